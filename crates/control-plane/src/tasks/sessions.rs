use std::time::Duration;

use tracing::warn;

use crate::app_state::AppState;
use crate::services::sessions;

/// Periodically deletes expired session rows.
pub async fn session_cleanup_loop(state: AppState) {
    let cleanup_interval = Duration::from_secs(state.sessions.cleanup_interval_secs.max(1));
    let mut interval = tokio::time::interval(cleanup_interval);

    loop {
        interval.tick().await;
        match sessions::cleanup_expired(&state).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(removed, "expired sessions removed");
            }
            Ok(_) => {}
            Err(err) => warn!(?err, "session cleanup failed"),
        }
    }
}
