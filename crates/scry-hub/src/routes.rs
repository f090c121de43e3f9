use crate::project_docs::{self, DocLookup};
use crate::state::{AcceptError, HubState};
use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use scry_core::events::EventError;
use scry_transcript::{extract_compaction_summaries, list_subagent_transcripts};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

type Params = Query<HashMap<String, String>>;

pub fn api_routes() -> Router<Arc<HubState>> {
    Router::new()
        .route("/events", get(stream_events).post(post_event))
        .route("/session", get(session_events))
        .route("/sessions", get(sessions))
        .route("/health", get(health))
        .route("/agent-transcripts", get(agent_transcripts))
        .route("/transcript", get(transcript))
        .route("/subagents", get(subagents))
        .route("/compaction-summary", get(compaction_summary))
        .route("/memory", get(memory))
        .route("/claude-md", get(claude_md))
}

pub async fn preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    next.run(request).await
}

pub async fn cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn post_event(State(state): State<Arc<HubState>>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    match state.accept(value).await {
        Ok(event) => {
            let id = event.id.clone();
            state.persist(event).await;
            (StatusCode::CREATED, Json(json!({ "ok": true, "id": id }))).into_response()
        }
        Err(AcceptError::Invalid(EventError::MissingField(_))) => {
            error_response(StatusCode::BAD_REQUEST, "Missing event_type or timestamp")
        }
        Err(AcceptError::Invalid(err)) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Err(AcceptError::Log(err)) => {
            error!(event = "session_log_append_failed", error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not record event")
        }
        Err(AcceptError::Task(err)) => {
            error!(event = "accept_task_failed", error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not record event")
        }
    }
}

async fn stream_events(
    State(state): State<Arc<HubState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.subscribe();
    let opening = stream::once(async { Ok::<_, Infallible>(Event::default().comment("ok")) });
    let updates = stream::unfold(subscription, |mut subscription| async move {
        let data = subscription.recv().await?;
        let event = Event::default().event("message").data(data.as_ref());
        Some((Ok(event), subscription))
    });
    Sse::new(opening.chain(updates)).keep_alive(KeepAlive::default())
}

async fn session_events(State(state): State<Arc<HubState>>, Query(params): Params) -> Response {
    let Some(session_id) = non_empty(&params, "id").or_else(|| state.current_session()) else {
        return Json(Vec::<Value>::new()).into_response();
    };
    match state.log().read_events(&session_id) {
        Ok(events) => Json(events).into_response(),
        Err(err) => {
            warn!(event = "session_read_failed", session_id = %session_id, error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not read session")
        }
    }
}

async fn sessions(State(state): State<Arc<HubState>>) -> Response {
    match state.log().list() {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => {
            warn!(event = "session_list_failed", error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not list sessions")
        }
    }
}

async fn health(State(state): State<Arc<HubState>>) -> Response {
    Json(json!({ "status": "ok", "uptime": state.uptime().as_secs() })).into_response()
}

async fn agent_transcripts(State(state): State<Arc<HubState>>) -> Response {
    Json(state.agent_transcripts()).into_response()
}

async fn transcript(State(state): State<Arc<HubState>>, Query(params): Params) -> Response {
    let path = match guarded_path(&state, &params, "path") {
        Ok(path) => path,
        Err(response) => return response,
    };
    let cache = state.cache();
    match run_blocking(&state, move || cache.get_or_parse(&path)).await {
        Ok(Some(view)) => Json(view.as_ref()).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Transcript not found"),
        Err(response) => response,
    }
}

async fn subagents(State(state): State<Arc<HubState>>, Query(params): Params) -> Response {
    let path = match guarded_path(&state, &params, "transcript") {
        Ok(path) => path,
        Err(response) => return response,
    };
    match run_blocking(&state, move || list_subagent_transcripts(&path)).await {
        Ok(found) => Json(found).into_response(),
        Err(response) => response,
    }
}

async fn compaction_summary(State(state): State<Arc<HubState>>, Query(params): Params) -> Response {
    let path = match guarded_path(&state, &params, "path") {
        Ok(path) => path,
        Err(response) => return response,
    };
    let index = match non_empty(&params, "index") {
        Some(raw) => raw.parse::<usize>().ok(),
        None => Some(0),
    };
    let summaries = match run_blocking(&state, move || extract_compaction_summaries(&path)).await {
        Ok(summaries) => summaries,
        Err(response) => return response,
    };
    match summaries
        .into_iter()
        .find(|summary| Some(summary.index) == index)
    {
        Some(entry) => Json(json!({ "summary": entry.text, "index": entry.index })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Compaction summary not found"),
    }
}

async fn memory(State(state): State<Arc<HubState>>, Query(params): Params) -> Response {
    project_doc(&state, &params, project_docs::memory).await
}

async fn claude_md(State(state): State<Arc<HubState>>, Query(params): Params) -> Response {
    project_doc(&state, &params, project_docs::claude_md).await
}

async fn project_doc(
    state: &HubState,
    params: &HashMap<String, String>,
    lookup: fn(&Path, &str) -> DocLookup,
) -> Response {
    let Some(project) = non_empty(params, "project") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing project parameter");
    };
    let root = state.config().transcript_root.clone();
    match run_blocking(state, move || lookup(&root, &project)).await {
        Ok(DocLookup::Found(doc)) => Json(doc).into_response(),
        Ok(DocLookup::Missing(body)) => (StatusCode::NOT_FOUND, Json(body)).into_response(),
        Ok(DocLookup::Forbidden) => {
            warn!(event = "project_doc_rejected");
            error_response(StatusCode::FORBIDDEN, "Invalid project path")
        }
        Err(response) => response,
    }
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 400 when the parameter is missing, 403 when it resolves outside the allow-list.
/// On success the resolved path is returned and is the one handlers read.
fn guarded_path(
    state: &HubState,
    params: &HashMap<String, String>,
    key: &str,
) -> Result<PathBuf, Response> {
    let Some(raw) = non_empty(params, key) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("Missing {key} parameter"),
        ));
    };
    let raw = PathBuf::from(raw);
    match state.transcript_path(&raw) {
        Some(resolved) => Ok(resolved),
        None => {
            warn!(event = "transcript_path_rejected", path = %raw.display());
            Err(error_response(
                StatusCode::FORBIDDEN,
                "Path outside allowed directory",
            ))
        }
    }
}

async fn run_blocking<T, F>(state: &HubState, work: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(state.config().blocking_timeout, task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            error!(event = "blocking_task_failed", error = %err);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
        Err(_) => {
            warn!(event = "blocking_task_timeout");
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "Timed out"))
        }
    }
}
