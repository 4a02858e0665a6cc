use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct AuditLogRecord {
    pub id: i64,
    pub device_id: Option<String>,
    pub action: String,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub device_id: Option<String>,
    pub action: String,
    pub details: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

pub async fn insert_audit_log(pool: &Db, new: NewAuditLog) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_logs (device_id, action, details, ip_address, user_agent)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&new.device_id)
    .bind(&new.action)
    .bind(&new.details)
    .bind(&new.ip_address)
    .bind(&new.user_agent)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_audit_logs(pool: &Db, action: Option<&str>, limit: u32) -> Result<Vec<AuditLogRecord>> {
    let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
        "SELECT id, device_id, action, details, ip_address, user_agent, created_at FROM audit_logs",
    );

    if let Some(action) = action {
        qb.push(" WHERE action = ");
        qb.push_bind(action);
    }

    qb.push(" ORDER BY created_at DESC, id DESC LIMIT ");
    qb.push_bind(limit as i64);

    let records = qb.build_query_as::<AuditLogRecord>().fetch_all(pool).await?;
    Ok(records)
}
