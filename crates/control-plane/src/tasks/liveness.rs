use std::time::Duration;

use tracing::warn;

use crate::app_state::AppState;
use crate::services::liveness;

/// Periodically flips devices offline once they miss the liveness window.
pub async fn liveness_loop(state: AppState) {
    let sweep_interval = Duration::from_secs(state.liveness.sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(sweep_interval);

    loop {
        interval.tick().await;
        if let Err(err) = liveness::sweep_stale_devices(&state).await {
            warn!(?err, "liveness sweep failed");
        }
    }
}
