//! Ingestion gateway: accepts hook events over HTTP, appends them to per-session
//! logs, fans them out to live listeners and serves transcript views.

pub mod config;
pub mod idle;
pub mod path_guard;
pub mod project_docs;
pub mod routes;
pub mod state;

pub use config::HubConfig;
pub use state::{HubError, HubState, Subscription};

use axum::{extract::DefaultBodyLimit, middleware, Router};
use std::sync::Arc;

/// Every route is served at the root and mirrored under `/api`.
pub fn router(state: Arc<HubState>) -> Router {
    let api = routes::api_routes();
    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(config::MAX_EVENT_BYTES))
        .layer(middleware::from_fn(routes::preflight))
        .layer(middleware::map_response(routes::cors_headers))
        .with_state(state)
}
