use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl From<DeviceStatus> for common::api::DeviceStatus {
    fn from(value: DeviceStatus) -> Self {
        match value {
            DeviceStatus::Online => common::api::DeviceStatus::Online,
            DeviceStatus::Offline => common::api::DeviceStatus::Offline,
        }
    }
}

impl From<common::api::DeviceStatus> for DeviceStatus {
    fn from(value: common::api::DeviceStatus) -> Self {
        match value {
            common::api::DeviceStatus::Online => DeviceStatus::Online,
            common::api::DeviceStatus::Offline => DeviceStatus::Offline,
        }
    }
}

/// Columns the device list may be sorted by. Caller input is parsed into
/// this enum before any SQL is built; arbitrary column names never reach
/// the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSortColumn {
    CreatedAt,
    LastSeenAt,
    Hostname,
}

impl DeviceSortColumn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            DeviceSortColumn::CreatedAt => "created_at",
            DeviceSortColumn::LastSeenAt => "last_seen_at",
            DeviceSortColumn::Hostname => "hostname",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created_at" => Some(DeviceSortColumn::CreatedAt),
            "last_seen_at" => Some(DeviceSortColumn::LastSeenAt),
            "hostname" => Some(DeviceSortColumn::Hostname),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRecord {
    pub device_id: String,
    pub hostname: String,
    pub address: String,
    pub os_type: String,
    pub os_version: String,
    pub agent_version: String,
    pub token_hash: String,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub metadata: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeviceUpsert {
    pub device_id: String,
    pub hostname: String,
    pub address: String,
    pub os_type: String,
    pub os_version: String,
    pub agent_version: String,
    pub token_hash: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceListFilters {
    pub status: Option<DeviceStatus>,
    pub os_type: Option<String>,
}

const DEVICE_COLUMNS: &str = r#"
    device_id,
    hostname,
    address,
    os_type,
    os_version,
    agent_version,
    token_hash,
    status,
    last_seen_at,
    metadata,
    created_at,
    updated_at
"#;

pub async fn insert_device(pool: &Db, new: DeviceUpsert) -> Result<DeviceRecord> {
    sqlx::query(
        r#"
        INSERT INTO devices (
            device_id,
            hostname,
            address,
            os_type,
            os_version,
            agent_version,
            token_hash,
            status,
            last_seen_at,
            metadata
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&new.device_id)
    .bind(&new.hostname)
    .bind(&new.address)
    .bind(&new.os_type)
    .bind(&new.os_version)
    .bind(&new.agent_version)
    .bind(&new.token_hash)
    .bind(DeviceStatus::Online)
    .bind(Utc::now())
    .bind(Json(new.metadata))
    .execute(pool)
    .await?;

    get_device(pool, &new.device_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("device insert did not return row"))
}

/// Re-registration of a known device: refreshes mutable fields, comes back
/// online, keeps the existing token hash. `last_seen_at` is always a bound
/// chrono timestamp so stale-sweep comparisons stay in one format.
pub async fn update_registration(pool: &Db, upsert: &DeviceUpsert) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE devices
        SET hostname = ?2,
            address = ?3,
            os_type = ?4,
            os_version = ?5,
            agent_version = ?6,
            status = ?7,
            last_seen_at = ?8,
            metadata = ?9,
            updated_at = datetime('now')
        WHERE device_id = ?1
        "#,
    )
    .bind(&upsert.device_id)
    .bind(&upsert.hostname)
    .bind(&upsert.address)
    .bind(&upsert.os_type)
    .bind(&upsert.os_version)
    .bind(&upsert.agent_version)
    .bind(DeviceStatus::Online)
    .bind(Utc::now())
    .bind(Json(upsert.metadata.clone()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_device(pool: &Db, device_id: &str) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"
    ))
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn update_display_fields(
    pool: &Db,
    device_id: &str,
    hostname: Option<&str>,
    os_type: Option<&str>,
    os_version: Option<&str>,
    agent_version: Option<&str>,
) -> Result<u64> {
    let mut qb =
        QueryBuilder::<sqlx::Sqlite>::new("UPDATE devices SET updated_at = datetime('now')");

    if let Some(hostname) = hostname {
        qb.push(", hostname = ");
        qb.push_bind(hostname);
    }
    if let Some(os_type) = os_type {
        qb.push(", os_type = ");
        qb.push_bind(os_type);
    }
    if let Some(os_version) = os_version {
        qb.push(", os_version = ");
        qb.push_bind(os_version);
    }
    if let Some(agent_version) = agent_version {
        qb.push(", agent_version = ");
        qb.push_bind(agent_version);
    }

    qb.push(" WHERE device_id = ");
    qb.push_bind(device_id);

    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

/// Heartbeat write: back online, advance last_seen, store the merged blob.
pub async fn record_heartbeat(
    pool: &Db,
    device_id: &str,
    metadata: serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE devices
        SET status = ?2,
            last_seen_at = ?3,
            metadata = ?4,
            updated_at = datetime('now')
        WHERE device_id = ?1
        "#,
    )
    .bind(device_id)
    .bind(DeviceStatus::Online)
    .bind(Utc::now())
    .bind(Json(metadata))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn update_device_token_hash(pool: &Db, device_id: &str, token_hash: String) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE devices
        SET token_hash = ?2, updated_at = datetime('now')
        WHERE device_id = ?1
        "#,
    )
    .bind(device_id)
    .bind(token_hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Flips every online device whose last heartbeat predates the cutoff and
/// returns the affected ids. One conditional batch update, so two sweeps in
/// a row with no new heartbeats flip nothing the second time.
pub async fn mark_offline_if_stale(pool: &Db, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let flipped: Vec<String> = sqlx::query_scalar(
        r#"
        UPDATE devices
        SET status = ?1, updated_at = datetime('now')
        WHERE status = ?2
          AND (last_seen_at IS NULL OR last_seen_at < ?3)
        RETURNING device_id
        "#,
    )
    .bind(DeviceStatus::Offline)
    .bind(DeviceStatus::Online)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(flipped)
}

pub async fn delete_device(pool: &Db, device_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM devices WHERE device_id = ?1")
        .bind(device_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn list_devices(
    pool: &Db,
    filters: &DeviceListFilters,
    sort: DeviceSortColumn,
    limit: u32,
    offset: u32,
) -> Result<Vec<DeviceRecord>> {
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE 1 = 1"
    ));

    push_filters(&mut qb, filters);

    qb.push(format!(" ORDER BY {} ASC LIMIT ", sort.as_sql()));
    qb.push_bind(limit as i64);
    qb.push(" OFFSET ");
    qb.push_bind(offset as i64);

    let records = qb.build_query_as::<DeviceRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn count_devices(pool: &Db, filters: &DeviceListFilters) -> Result<u64> {
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new("SELECT COUNT(*) FROM devices WHERE 1 = 1");
    push_filters(&mut qb, filters);

    let count: i64 = qb.build_query_scalar().fetch_one(pool).await?;
    Ok(count.max(0) as u64)
}

fn push_filters(qb: &mut QueryBuilder<'_, sqlx::Sqlite>, filters: &DeviceListFilters) {
    if filters.status.is_some() {
        qb.push(" AND status = ");
        qb.push_bind(filters.status);
    }
    if let Some(os_type) = &filters.os_type {
        qb.push(" AND os_type = ");
        qb.push_bind(os_type.clone());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCounts {
    pub total: u64,
    pub online: u64,
    pub offline: u64,
    pub recently_active: u64,
}

pub async fn device_counts(pool: &Db, recent_cutoff: DateTime<Utc>) -> Result<DeviceCounts> {
    let row: (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COALESCE(SUM(status = 'online'), 0),
            COALESCE(SUM(status = 'offline'), 0),
            COALESCE(SUM(last_seen_at IS NOT NULL AND last_seen_at >= ?1), 0)
        FROM devices
        "#,
    )
    .bind(recent_cutoff)
    .fetch_one(pool)
    .await?;

    Ok(DeviceCounts {
        total: row.0.max(0) as u64,
        online: row.1.max(0) as u64,
        offline: row.2.max(0) as u64,
        recently_active: row.3.max(0) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;
    use chrono::Duration;

    async fn setup_db() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    async fn force_offline(db: &Db, device_id: &str) {
        sqlx::query("UPDATE devices SET status = 'offline' WHERE device_id = ?1")
            .bind(device_id)
            .execute(db)
            .await
            .expect("force offline");
    }

    pub(crate) fn upsert(device_id: &str, hostname: &str) -> DeviceUpsert {
        DeviceUpsert {
            device_id: device_id.to_string(),
            hostname: hostname.to_string(),
            address: "10.0.0.5".to_string(),
            os_type: "linux".to_string(),
            os_version: "6.1".to_string(),
            agent_version: "1.2.0".to_string(),
            token_hash: "hash".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let db = setup_db().await;
        let record = insert_device(&db, upsert("device-aaaa", "web1")).await.unwrap();

        assert_eq!(record.device_id, "device-aaaa");
        assert_eq!(record.status, DeviceStatus::Online);
        assert!(record.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn update_registration_refreshes_fields() {
        let db = setup_db().await;
        insert_device(&db, upsert("device-bbbb", "web1")).await.unwrap();
        force_offline(&db, "device-bbbb").await;

        let mut refreshed = upsert("device-bbbb", "web1");
        refreshed.os_version = "6.8".to_string();
        assert_eq!(update_registration(&db, &refreshed).await.unwrap(), 1);

        let record = get_device(&db, "device-bbbb").await.unwrap().expect("row");
        assert_eq!(record.os_version, "6.8");
        assert_eq!(record.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn stale_sweep_flips_once() {
        let db = setup_db().await;
        insert_device(&db, upsert("device-cccc", "web1")).await.unwrap();

        // A cutoff in the future makes the fresh heartbeat count as stale.
        let cutoff = Utc::now() + Duration::seconds(301);
        let flipped = mark_offline_if_stale(&db, cutoff).await.unwrap();
        assert_eq!(flipped, vec!["device-cccc".to_string()]);

        let again = mark_offline_if_stale(&db, cutoff).await.unwrap();
        assert!(again.is_empty());

        record_heartbeat(&db, "device-cccc", serde_json::json!({}))
            .await
            .unwrap();
        let record = get_device(&db, "device-cccc").await.unwrap().expect("row");
        assert_eq!(record.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn sweep_skips_devices_with_recent_heartbeats() {
        let db = setup_db().await;
        insert_device(&db, upsert("device-dddd", "web2")).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(300);
        let flipped = mark_offline_if_stale(&db, cutoff).await.unwrap();
        assert!(flipped.is_empty());
    }

    #[tokio::test]
    async fn list_filters_and_typed_sort() {
        let db = setup_db().await;
        insert_device(&db, upsert("device-eeee", "alpha")).await.unwrap();
        let mut windows = upsert("device-ffff", "beta");
        windows.os_type = "windows".to_string();
        insert_device(&db, windows).await.unwrap();
        force_offline(&db, "device-ffff").await;

        let online = DeviceListFilters {
            status: Some(DeviceStatus::Online),
            os_type: None,
        };
        let records = list_devices(&db, &online, DeviceSortColumn::Hostname, 50, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_id, "device-eeee");

        let windows_only = DeviceListFilters {
            status: None,
            os_type: Some("windows".to_string()),
        };
        assert_eq!(count_devices(&db, &windows_only).await.unwrap(), 1);
        assert_eq!(DeviceSortColumn::parse("hostname"), Some(DeviceSortColumn::Hostname));
        assert_eq!(DeviceSortColumn::parse("secret_hash; --"), None);
    }

    #[tokio::test]
    async fn counts_track_recent_activity() {
        let db = setup_db().await;
        insert_device(&db, upsert("device-gggg", "web1")).await.unwrap();
        insert_device(&db, upsert("device-hhhh", "web2")).await.unwrap();
        force_offline(&db, "device-hhhh").await;

        let counts = device_counts(&db, Utc::now() - Duration::minutes(5)).await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.online, 1);
        assert_eq!(counts.offline, 1);
        assert_eq!(counts.recently_active, 2);
    }
}
