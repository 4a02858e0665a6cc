use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<CommandStatus> for common::api::CommandStatus {
    fn from(value: CommandStatus) -> Self {
        match value {
            CommandStatus::Pending => common::api::CommandStatus::Pending,
            CommandStatus::Running => common::api::CommandStatus::Running,
            CommandStatus::Completed => common::api::CommandStatus::Completed,
            CommandStatus::Failed => common::api::CommandStatus::Failed,
        }
    }
}

impl From<common::api::CommandStatus> for CommandStatus {
    fn from(value: common::api::CommandStatus) -> Self {
        match value {
            common::api::CommandStatus::Pending => CommandStatus::Pending,
            common::api::CommandStatus::Running => CommandStatus::Running,
            common::api::CommandStatus::Completed => CommandStatus::Completed,
            common::api::CommandStatus::Failed => CommandStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CommandRecord {
    pub id: Uuid,
    pub device_id: String,
    pub command_type: String,
    pub payload: Json<serde_json::Value>,
    pub timeout_seconds: i64,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i64>,
    pub retry_count: i64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub id: Uuid,
    pub device_id: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub timeout_seconds: i64,
}

const COMMAND_COLUMNS: &str = r#"
    id,
    device_id,
    command_type,
    payload,
    timeout_seconds,
    status,
    exit_code,
    stdout,
    stderr,
    duration_ms,
    retry_count,
    lease_expires_at,
    created_at,
    claimed_at,
    completed_at
"#;

pub async fn create_command(pool: &Db, new: NewCommand) -> Result<CommandRecord> {
    sqlx::query(
        r#"
        INSERT INTO commands (
            id,
            device_id,
            command_type,
            payload,
            timeout_seconds,
            status
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(new.id)
    .bind(&new.device_id)
    .bind(&new.command_type)
    .bind(Json(new.payload))
    .bind(new.timeout_seconds)
    .bind(CommandStatus::Pending)
    .execute(pool)
    .await?;

    get_command(pool, new.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("command insert did not return row"))
}

pub async fn get_command(pool: &Db, id: Uuid) -> Result<Option<CommandRecord>> {
    let record = sqlx::query_as::<_, CommandRecord>(&format!(
        "SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_commands_for_device(
    pool: &Db,
    device_id: &str,
    status: Option<CommandStatus>,
    limit: u32,
) -> Result<Vec<CommandRecord>> {
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(format!(
        "SELECT {COMMAND_COLUMNS} FROM commands WHERE device_id = "
    ));
    qb.push_bind(device_id);

    if status.is_some() {
        qb.push(" AND status = ");
        qb.push_bind(status);
    }

    qb.push(" ORDER BY created_at DESC LIMIT ");
    qb.push_bind(limit as i64);

    let records = qb.build_query_as::<CommandRecord>().fetch_all(pool).await?;
    Ok(records)
}

/// Atomically claims up to `batch` oldest pending commands for the device.
/// The status guard inside the subquery and the outer predicate make the
/// claim race-free: a command already flipped by a concurrent pull is
/// skipped, never claimed twice. Ordering follows rowid, which tracks
/// insertion order even when created_at ties at second resolution.
pub async fn claim_pending_commands(
    pool: &Db,
    device_id: &str,
    batch: u32,
    lease_until: DateTime<Utc>,
) -> Result<Vec<CommandRecord>> {
    let claimed_ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE commands
        SET status = ?1,
            claimed_at = datetime('now'),
            lease_expires_at = ?2
        WHERE status = ?3
          AND id IN (
            SELECT id FROM commands
            WHERE device_id = ?4 AND status = ?3
            ORDER BY rowid ASC
            LIMIT ?5
          )
        RETURNING id
        "#,
    )
    .bind(CommandStatus::Running)
    .bind(lease_until)
    .bind(CommandStatus::Pending)
    .bind(device_id)
    .bind(batch as i64)
    .fetch_all(pool)
    .await?;

    if claimed_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(format!(
        "SELECT {COMMAND_COLUMNS} FROM commands WHERE id IN ("
    ));
    let mut separated = qb.separated(", ");
    for id in &claimed_ids {
        separated.push_bind(*id);
    }
    qb.push(") ORDER BY rowid ASC");

    let claimed = qb.build_query_as::<CommandRecord>().fetch_all(pool).await?;
    Ok(claimed)
}

/// Records a terminal result for a running command. Returns 0 when the
/// command was not running, which callers treat as an idempotent no-op for
/// already-terminal rows.
pub async fn record_result(
    pool: &Db,
    id: Uuid,
    status: CommandStatus,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    duration_ms: Option<i64>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE commands
        SET status = ?2,
            exit_code = ?3,
            stdout = ?4,
            stderr = ?5,
            duration_ms = ?6,
            completed_at = datetime('now'),
            lease_expires_at = NULL
        WHERE id = ?1 AND status = ?7
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(exit_code)
    .bind(stdout)
    .bind(stderr)
    .bind(duration_ms)
    .bind(CommandStatus::Running)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Default)]
pub struct LeaseSweepOutcome {
    pub requeued: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Requeues running commands whose lease expired, failing those that have
/// exhausted their retries.
pub async fn requeue_expired_leases(
    pool: &Db,
    now: DateTime<Utc>,
    max_retries: u32,
) -> Result<LeaseSweepOutcome> {
    let mut tx = pool.begin().await?;

    let requeued: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE commands
        SET status = ?1,
            claimed_at = NULL,
            lease_expires_at = NULL,
            retry_count = retry_count + 1
        WHERE status = ?2
          AND lease_expires_at IS NOT NULL
          AND lease_expires_at < ?3
          AND retry_count < ?4
        RETURNING id
        "#,
    )
    .bind(CommandStatus::Pending)
    .bind(CommandStatus::Running)
    .bind(now)
    .bind(max_retries as i64)
    .fetch_all(&mut *tx)
    .await?;

    let failed: Vec<Uuid> = sqlx::query_scalar(
        r#"
        UPDATE commands
        SET status = ?1,
            stderr = COALESCE(stderr, 'lease expired; retries exhausted'),
            completed_at = datetime('now'),
            lease_expires_at = NULL
        WHERE status = ?2
          AND lease_expires_at IS NOT NULL
          AND lease_expires_at < ?3
          AND retry_count >= ?4
        RETURNING id
        "#,
    )
    .bind(CommandStatus::Failed)
    .bind(CommandStatus::Running)
    .bind(now)
    .bind(max_retries as i64)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(LeaseSweepOutcome { requeued, failed })
}
