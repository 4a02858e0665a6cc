use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};
use uuid::Uuid;

use super::credentials::CallerClass;
use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct SessionRecord {
    pub token_hash: String,
    pub credential_id: Uuid,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Session joined with the owning credential, used for verification.
#[derive(Debug, Clone, FromRow)]
pub struct SessionWithCredential {
    pub token_hash: String,
    pub credential_id: Uuid,
    pub device_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub credential_name: String,
    pub caller_class: CallerClass,
    #[sqlx(rename = "permissions")]
    pub permissions: Json<Vec<String>>,
    pub credential_active: bool,
    pub credential_expires_at: Option<DateTime<Utc>>,
}

impl SessionWithCredential {
    /// Valid means the session is unexpired and the credential is usable.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
            && self.credential_active
            && self.credential_expires_at.is_none_or(|exp| exp > now)
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub token_hash: String,
    pub credential_id: Uuid,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_session(pool: &Db, new: NewSession) -> Result<SessionRecord> {
    sqlx::query(
        r#"
        INSERT INTO sessions (
            token_hash,
            credential_id,
            device_id,
            ip_address,
            user_agent,
            expires_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&new.token_hash)
    .bind(new.credential_id)
    .bind(&new.device_id)
    .bind(&new.ip_address)
    .bind(&new.user_agent)
    .bind(new.expires_at)
    .execute(pool)
    .await?;

    get_session(pool, &new.token_hash)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session insert did not return row"))
}

pub async fn get_session(pool: &Db, token_hash: &str) -> Result<Option<SessionRecord>> {
    let record = sqlx::query_as::<_, SessionRecord>(
        r#"
        SELECT
            token_hash,
            credential_id,
            device_id,
            ip_address,
            user_agent,
            expires_at,
            last_activity_at,
            created_at
        FROM sessions
        WHERE token_hash = ?1
        "#,
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn get_session_with_credential(
    pool: &Db,
    token_hash: &str,
) -> Result<Option<SessionWithCredential>> {
    let record = sqlx::query_as::<_, SessionWithCredential>(
        r#"
        SELECT
            s.token_hash,
            s.credential_id,
            s.device_id,
            s.expires_at,
            s.last_activity_at,
            c.name AS credential_name,
            c.caller_class,
            c.permissions,
            c.active AS credential_active,
            c.expires_at AS credential_expires_at
        FROM sessions s
        JOIN credentials c ON c.id = s.credential_id
        WHERE s.token_hash = ?1
        "#,
    )
    .bind(token_hash)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn touch_session_activity(pool: &Db, token_hash: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET last_activity_at = ?2
        WHERE token_hash = ?1
        "#,
    )
    .bind(token_hash)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Extends expiry only while the session is still alive. The expiry guard
/// binds the clock value; `expires_at` rows are written as bound chrono
/// timestamps, so SQL-side `datetime('now')` text would not compare with
/// them.
pub async fn refresh_session(
    pool: &Db,
    token_hash: &str,
    new_expires_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET expires_at = ?2, last_activity_at = ?3
        WHERE token_hash = ?1 AND expires_at > ?3
        "#,
    )
    .bind(token_hash)
    .bind(new_expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_session(pool: &Db, token_hash: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?1")
        .bind(token_hash)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_sessions_for_credential(pool: &Db, credential_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE credential_id = ?1")
        .bind(credential_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn list_active_sessions(
    pool: &Db,
    credential_id: Option<Uuid>,
    limit: u32,
    offset: u32,
) -> Result<Vec<SessionRecord>> {
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(
        r#"
        SELECT
            token_hash,
            credential_id,
            device_id,
            ip_address,
            user_agent,
            expires_at,
            last_activity_at,
            created_at
        FROM sessions
        WHERE expires_at >
        "#,
    );
    qb.push_bind(Utc::now());

    if credential_id.is_some() {
        qb.push(" AND credential_id = ");
        qb.push_bind(credential_id);
    }

    qb.push(" ORDER BY created_at ASC LIMIT ");
    qb.push_bind(limit as i64);
    qb.push(" OFFSET ");
    qb.push_bind(offset as i64);

    let records = qb.build_query_as::<SessionRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn count_active_sessions(pool: &Db, credential_id: Option<Uuid>) -> Result<u64> {
    let mut qb =
        QueryBuilder::<sqlx::Sqlite>::new("SELECT COUNT(*) FROM sessions WHERE expires_at > ");
    qb.push_bind(Utc::now());

    if credential_id.is_some() {
        qb.push(" AND credential_id = ");
        qb.push_bind(credential_id);
    }

    let count: i64 = qb.build_query_scalar().fetch_one(pool).await?;
    Ok(count.max(0) as u64)
}

pub async fn delete_expired_sessions(pool: &Db) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?1")
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
