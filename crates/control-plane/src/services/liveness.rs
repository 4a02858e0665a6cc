use chrono::{DateTime, Duration, Utc};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::devices;
use crate::services::devices::merge_metadata;
use crate::validation;
use common::api::{DeviceStatus, FleetStatistics, HeartbeatAck, LivenessReport};

/// Window used by the `recently_active` statistic.
const RECENT_ACTIVITY_WINDOW_SECS: i64 = 300;

#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct HeartbeatRequest {
    /// Metadata delta merged over the stored blob.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Point-in-time resource metrics; stored under the `metrics` key.
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

/// Processes one heartbeat: device comes back online, last_seen advances,
/// reported metadata and metrics land in the stored blob.
pub async fn process_heartbeat(
    state: &AppState,
    device_id: &str,
    req: HeartbeatRequest,
) -> ApiResult<HeartbeatAck> {
    let record = devices::get_device(&state.db, device_id)
        .await?
        .ok_or_else(|| AppError::not_found("device not found"))?;

    if let Some(metadata) = &req.metadata {
        validation::validate_metadata_object(metadata)?;
    }

    let now = Utc::now();
    let mut blob = record.metadata.0.clone();
    if let Some(metadata) = &req.metadata {
        merge_metadata(&mut blob, metadata);
    }
    if let Some(metrics) = req.metrics {
        if let Some(map) = blob.as_object_mut() {
            map.insert("metrics".to_string(), metrics);
            map.insert(
                "metrics_updated_at".to_string(),
                serde_json::Value::String(now.to_rfc3339()),
            );
        }
    }

    let updated = devices::record_heartbeat(&state.db, device_id, blob).await?;
    if updated == 0 {
        return Err(AppError::not_found("device not found"));
    }

    if record.status == crate::persistence::DeviceStatus::Offline {
        ::tracing::info!(device_id, "device back online");
    }
    ::metrics::counter!("heartbeats_total").increment(1);

    Ok(HeartbeatAck {
        status: DeviceStatus::Online,
        last_seen_at: now,
        next_interval_seconds: state.liveness.heartbeat_interval_secs,
    })
}

/// Point-in-time liveness view for one device, computed against the
/// configured timeout rather than the stored status so a report taken just
/// before a sweep is already truthful.
pub async fn liveness_report(state: &AppState, device_id: &str) -> ApiResult<LivenessReport> {
    let record = devices::get_device(&state.db, device_id)
        .await?
        .ok_or_else(|| AppError::not_found("device not found"))?;

    let now = Utc::now();
    let offline_duration_seconds = record.last_seen_at.map(|seen| (now - seen).num_seconds());
    let is_timed_out = offline_duration_seconds
        .map(|secs| secs > state.liveness.timeout_secs as i64)
        .unwrap_or(true);

    Ok(LivenessReport {
        status: record.status.into(),
        last_seen_at: record.last_seen_at,
        offline_duration_seconds,
        is_timed_out,
    })
}

/// Flips devices offline once their last heartbeat falls outside the
/// timeout window. Returns the ids that changed on this pass.
pub async fn sweep_stale_devices(state: &AppState) -> crate::Result<Vec<String>> {
    let cutoff = Utc::now() - Duration::seconds(state.liveness.timeout_secs as i64);
    let swept = devices::mark_offline_if_stale(&state.db, cutoff).await?;

    if !swept.is_empty() {
        ::tracing::info!(count = swept.len(), "marked stale devices offline");
        ::metrics::counter!("devices_swept_offline_total").increment(swept.len() as u64);
    }

    Ok(swept)
}

pub async fn fleet_statistics(state: &AppState) -> ApiResult<FleetStatistics> {
    let cutoff = recent_cutoff(Utc::now());
    let counts = devices::device_counts(&state.db, cutoff).await?;

    Ok(FleetStatistics {
        total: counts.total,
        online: counts.online,
        offline: counts.offline,
        recently_active: counts.recently_active,
    })
}

fn recent_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(RECENT_ACTIVITY_WINDOW_SECS)
}
