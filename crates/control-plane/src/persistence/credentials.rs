use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum CallerClass {
    Web,
    External,
    Internal,
}

impl From<common::api::CallerClass> for CallerClass {
    fn from(value: common::api::CallerClass) -> Self {
        match value {
            common::api::CallerClass::Web => CallerClass::Web,
            common::api::CallerClass::External => CallerClass::External,
            common::api::CallerClass::Internal => CallerClass::Internal,
        }
    }
}

impl From<CallerClass> for common::api::CallerClass {
    fn from(value: CallerClass) -> Self {
        match value {
            CallerClass::Web => common::api::CallerClass::Web,
            CallerClass::External => common::api::CallerClass::External,
            CallerClass::Internal => common::api::CallerClass::Internal,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CredentialRecord {
    pub id: Uuid,
    pub name: String,
    pub key: String,
    pub secret_hash: String,
    pub caller_class: CallerClass,
    #[sqlx(rename = "permissions")]
    pub permissions: Json<Vec<String>>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Usable means active and not past its expiry.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|exp| exp > now)
    }
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub id: Uuid,
    pub name: String,
    pub key: String,
    pub secret_hash: String,
    pub caller_class: CallerClass,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub name: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub active: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

const CREDENTIAL_COLUMNS: &str = r#"
    id,
    name,
    key,
    secret_hash,
    caller_class,
    permissions,
    active,
    expires_at,
    last_used_at,
    created_at,
    updated_at
"#;

pub async fn create_credential(pool: &Db, new: NewCredential) -> Result<CredentialRecord> {
    sqlx::query(
        r#"
        INSERT INTO credentials (
            id,
            name,
            key,
            secret_hash,
            caller_class,
            permissions,
            active,
            expires_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
        "#,
    )
    .bind(new.id)
    .bind(&new.name)
    .bind(&new.key)
    .bind(&new.secret_hash)
    .bind(new.caller_class)
    .bind(Json(new.permissions))
    .bind(new.expires_at)
    .execute(pool)
    .await?;

    get_credential(pool, new.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("credential insert did not return row"))
}

pub async fn get_credential(pool: &Db, id: Uuid) -> Result<Option<CredentialRecord>> {
    let record = sqlx::query_as::<_, CredentialRecord>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn get_credential_by_key(pool: &Db, key: &str) -> Result<Option<CredentialRecord>> {
    let record = sqlx::query_as::<_, CredentialRecord>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE key = ?1"
    ))
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn get_credential_by_name(pool: &Db, name: &str) -> Result<Option<CredentialRecord>> {
    let record = sqlx::query_as::<_, CredentialRecord>(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_credentials(
    pool: &Db,
    caller_class: Option<CallerClass>,
    active: Option<bool>,
    limit: u32,
    offset: u32,
) -> Result<Vec<CredentialRecord>> {
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE 1 = 1"
    ));

    if caller_class.is_some() {
        qb.push(" AND caller_class = ");
        qb.push_bind(caller_class);
    }

    if let Some(active) = active {
        qb.push(" AND active = ");
        qb.push_bind(active);
    }

    qb.push(" ORDER BY created_at ASC LIMIT ");
    qb.push_bind(limit as i64);
    qb.push(" OFFSET ");
    qb.push_bind(offset as i64);

    let records = qb.build_query_as::<CredentialRecord>().fetch_all(pool).await?;
    Ok(records)
}

pub async fn update_credential(pool: &Db, id: Uuid, update: CredentialUpdate) -> Result<u64> {
    let mut qb = QueryBuilder::<sqlx::Sqlite>::new("UPDATE credentials SET updated_at = datetime('now')");

    if let Some(name) = &update.name {
        qb.push(", name = ");
        qb.push_bind(name);
    }
    if let Some(permissions) = update.permissions {
        qb.push(", permissions = ");
        qb.push_bind(Json(permissions));
    }
    if let Some(active) = update.active {
        qb.push(", active = ");
        qb.push_bind(active);
    }
    if let Some(expires_at) = update.expires_at {
        qb.push(", expires_at = ");
        qb.push_bind(expires_at);
    }

    qb.push(" WHERE id = ");
    qb.push_bind(id);

    let result = qb.build().execute(pool).await?;
    Ok(result.rows_affected())
}

pub async fn delete_credential(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM credentials WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn update_secret_hash(pool: &Db, id: Uuid, secret_hash: String) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE credentials
        SET secret_hash = ?2, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(secret_hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn touch_credential_last_used(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE credentials
        SET last_used_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;
    use chrono::TimeZone;

    async fn setup_db() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn new_credential(name: &str, key: &str) -> NewCredential {
        NewCredential {
            id: Uuid::new_v4(),
            name: name.to_string(),
            key: key.to_string(),
            secret_hash: "hash".to_string(),
            caller_class: CallerClass::External,
            permissions: vec!["devices:read".to_string()],
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn create_credential_roundtrip() {
        let db = setup_db().await;
        let record = create_credential(&db, new_credential("ci", "key-1"))
            .await
            .unwrap();

        assert_eq!(record.name, "ci");
        assert_eq!(record.key, "key-1");
        assert_eq!(record.permissions.0, vec!["devices:read".to_string()]);
        assert!(record.active);
        assert!(record.last_used_at.is_none());

        let by_key = get_credential_by_key(&db, "key-1").await.unwrap().expect("row");
        assert_eq!(by_key.id, record.id);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let db = setup_db().await;
        create_credential(&db, new_credential("dup", "key-1"))
            .await
            .unwrap();

        let err = create_credential(&db, new_credential("dup", "key-2"))
            .await
            .expect_err("duplicate name");
        assert!(crate::error::is_unique_violation(&err));
    }

    #[tokio::test]
    async fn list_credentials_filters_by_class_and_active() {
        let db = setup_db().await;
        let web = NewCredential {
            caller_class: CallerClass::Web,
            ..new_credential("web-ui", "key-web")
        };
        create_credential(&db, web).await.unwrap();
        let external = create_credential(&db, new_credential("partner", "key-ext"))
            .await
            .unwrap();
        update_credential(
            &db,
            external.id,
            CredentialUpdate {
                active: Some(false),
                ..CredentialUpdate::default()
            },
        )
        .await
        .unwrap();

        let web_only = list_credentials(&db, Some(CallerClass::Web), None, 50, 0)
            .await
            .unwrap();
        assert_eq!(web_only.len(), 1);
        assert_eq!(web_only[0].name, "web-ui");

        let active_only = list_credentials(&db, None, Some(true), 50, 0).await.unwrap();
        assert!(active_only.iter().all(|c| c.active));
        assert!(!active_only.iter().any(|c| c.id == external.id));
    }

    #[tokio::test]
    async fn usable_respects_active_and_expiry() {
        let db = setup_db().await;
        let record = create_credential(&db, new_credential("exp", "key-exp"))
            .await
            .unwrap();
        let now = Utc::now();
        assert!(record.is_usable(now));

        let past = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        update_credential(
            &db,
            record.id,
            CredentialUpdate {
                expires_at: Some(Some(past)),
                ..CredentialUpdate::default()
            },
        )
        .await
        .unwrap();
        let expired = get_credential(&db, record.id).await.unwrap().expect("row");
        assert!(!expired.is_usable(now));
    }

    #[tokio::test]
    async fn touch_last_used_sets_value() {
        let db = setup_db().await;
        let record = create_credential(&db, new_credential("touch", "key-touch"))
            .await
            .unwrap();

        let affected = touch_credential_last_used(&db, record.id).await.unwrap();
        assert_eq!(affected, 1);
        let updated = get_credential(&db, record.id).await.unwrap().expect("row");
        assert!(updated.last_used_at.is_some());
    }

    #[tokio::test]
    async fn delete_credential_removes_row() {
        let db = setup_db().await;
        let record = create_credential(&db, new_credential("gone", "key-gone"))
            .await
            .unwrap();

        assert_eq!(delete_credential(&db, record.id).await.unwrap(), 1);
        assert!(get_credential(&db, record.id).await.unwrap().is_none());
        assert_eq!(delete_credential(&db, record.id).await.unwrap(), 0);
    }
}
