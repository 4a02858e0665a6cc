use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{self as db, commands, devices};
use crate::validation;
use common::api::{CommandCreated, CommandStatus, CommandView, ResultAck};

/// Upper bound on a single command's execution timeout.
const MAX_TIMEOUT_SECONDS: i64 = 3600;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct CreateCommandRequest {
    pub device_id: String,
    pub command_type: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ReportResultRequest {
    pub status: CommandStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

pub fn to_view(record: &db::CommandRecord) -> CommandView {
    CommandView {
        id: record.id,
        device_id: record.device_id.clone(),
        command_type: record.command_type.clone(),
        payload: record.payload.0.clone(),
        timeout_seconds: record.timeout_seconds.clamp(0, u32::MAX as i64) as u32,
        status: record.status.into(),
        exit_code: record.exit_code,
        stdout: record.stdout.clone(),
        stderr: record.stderr.clone(),
        duration_ms: record.duration_ms,
        retry_count: record.retry_count.clamp(0, u32::MAX as i64) as u32,
        created_at: record.created_at,
        claimed_at: record.claimed_at,
        completed_at: record.completed_at,
    }
}

/// Enqueues a command and wakes any pull stream waiting on the device.
pub async fn create_command(
    state: &AppState,
    req: CreateCommandRequest,
) -> ApiResult<CommandCreated> {
    validation::validate_required_str(
        "command_type",
        &req.command_type,
        state.limits.max_field_len,
    )?;

    let timeout_seconds = req.timeout_seconds.unwrap_or(60);
    if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(AppError::bad_request(format!(
            "timeout_seconds must be between 1 and {MAX_TIMEOUT_SECONDS}"
        )));
    }

    if devices::get_device(&state.db, &req.device_id).await?.is_none() {
        return Err(AppError::not_found("device not found"));
    }

    let record = commands::create_command(
        &state.db,
        db::NewCommand {
            id: Uuid::new_v4(),
            device_id: req.device_id.clone(),
            command_type: req.command_type.trim().to_string(),
            payload: req.payload,
            timeout_seconds,
        },
    )
    .await?;

    state.command_signals.notify(&req.device_id);
    ::metrics::counter!("commands_created_total").increment(1);

    Ok(CommandCreated {
        command_id: record.id,
    })
}

pub async fn get_command(state: &AppState, id: Uuid) -> ApiResult<CommandView> {
    let record = commands::get_command(&state.db, id)
        .await?
        .ok_or_else(|| AppError::not_found("command not found"))?;
    Ok(to_view(&record))
}

pub async fn list_commands_for_device(
    state: &AppState,
    device_id: &str,
    status: Option<CommandStatus>,
    limit: u32,
) -> ApiResult<Vec<CommandView>> {
    let records =
        commands::list_commands_for_device(&state.db, device_id, status.map(Into::into), limit)
            .await?;
    Ok(records.iter().map(to_view).collect())
}

/// Claims the oldest pending commands for the device, granting each a lease.
pub async fn claim_commands(
    state: &AppState,
    device_id: &str,
    batch: Option<u32>,
) -> ApiResult<Vec<CommandView>> {
    let batch = batch
        .unwrap_or(state.commands.default_batch)
        .clamp(1, state.commands.default_batch.max(1));
    let lease_until = Utc::now() + Duration::seconds(state.commands.lease_secs as i64);

    let claimed = commands::claim_pending_commands(&state.db, device_id, batch, lease_until).await?;
    if !claimed.is_empty() {
        ::metrics::counter!("commands_claimed_total").increment(claimed.len() as u64);
    }

    Ok(claimed.iter().map(to_view).collect())
}

/// Records a terminal result. A repeat report for an already-terminal
/// command is acknowledged with `applied: false`; the stored result wins.
pub async fn report_result(
    state: &AppState,
    device_id: &str,
    command_id: Uuid,
    req: ReportResultRequest,
) -> ApiResult<ResultAck> {
    if !req.status.is_terminal() {
        return Err(AppError::bad_request(
            "result status must be completed or failed",
        ));
    }

    let record = commands::get_command(&state.db, command_id)
        .await?
        .ok_or_else(|| AppError::not_found("command not found"))?;
    if record.device_id != device_id {
        return Err(AppError::forbidden("command belongs to another device"));
    }

    let applied = commands::record_result(
        &state.db,
        command_id,
        req.status.into(),
        req.exit_code,
        req.stdout,
        req.stderr,
        req.duration_ms,
    )
    .await?;

    let status = if applied > 0 {
        ::metrics::counter!(
            "commands_completed_total",
            "status" => req.status.as_str()
        )
        .increment(1);
        req.status
    } else {
        // Read back the state that won.
        commands::get_command(&state.db, command_id)
            .await?
            .map(|c| c.status.into())
            .unwrap_or(req.status)
    };

    Ok(ResultAck {
        applied: applied > 0,
        status,
    })
}

/// Requeues or fails commands whose lease expired without a result.
pub async fn sweep_expired_leases(state: &AppState) -> crate::Result<commands::LeaseSweepOutcome> {
    let outcome =
        commands::requeue_expired_leases(&state.db, Utc::now(), state.commands.max_retries).await?;

    if !outcome.requeued.is_empty() {
        ::tracing::info!(count = outcome.requeued.len(), "requeued expired command leases");
        ::metrics::counter!("commands_requeued_total").increment(outcome.requeued.len() as u64);

        // Wake any stream already waiting on the requeued work.
        for id in &outcome.requeued {
            if let Some(record) = commands::get_command(&state.db, *id).await? {
                state.command_signals.notify(&record.device_id);
            }
        }
    }
    if !outcome.failed.is_empty() {
        ::tracing::warn!(count = outcome.failed.len(), "failed commands with exhausted retries");
        ::metrics::counter!(
            "commands_completed_total",
            "status" => "failed"
        )
        .increment(outcome.failed.len() as u64);
    }

    Ok(outcome)
}
