use crate::state::HubState;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Resolves once no event has been accepted for longer than `timeout`,
/// checking every `check_every`. A zero timeout never resolves.
pub async fn wait_for_idle(state: Arc<HubState>, timeout: Duration, check_every: Duration) {
    if timeout.is_zero() {
        std::future::pending::<()>().await;
    }
    let mut ticker = tokio::time::interval(check_every.max(Duration::from_millis(1)));
    loop {
        ticker.tick().await;
        let idle = state.idle_for();
        if idle > timeout {
            info!(event = "idle_timeout", idle_secs = idle.as_secs(), timeout_secs = timeout.as_secs());
            return;
        }
    }
}
