use std::time::Duration;

use tracing::warn;

use crate::app_state::AppState;
use crate::services::commands;

/// Periodically requeues or fails commands whose lease expired without a
/// reported result.
pub async fn lease_loop(state: AppState) {
    let sweep_interval = Duration::from_secs(state.commands.lease_sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(sweep_interval);

    loop {
        interval.tick().await;
        if let Err(err) = commands::sweep_expired_leases(&state).await {
            warn!(?err, "command lease sweep failed");
        }
    }
}
