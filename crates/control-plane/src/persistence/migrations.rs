use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::migrate::{AppliedMigration, Migrate};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationLabel {
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationSnapshot {
    pub latest_applied: Option<i64>,
    pub latest_available: Option<i64>,
    pub applied: Vec<MigrationLabel>,
    pub pending: Vec<MigrationLabel>,
}

#[derive(Debug, Clone)]
pub struct MigrationRunOutcome {
    pub snapshot: MigrationSnapshot,
    pub applied: Vec<MigrationLabel>,
}

pub async fn init_pool(database_url: &str) -> Result<Db> {
    let is_memory_request = database_url.starts_with("sqlite::memory");
    let resolved_url = if is_memory_request {
        // Each plain `:memory:` connection opens its own private database,
        // so a pool would point different queries at different databases.
        // A uniquely named shared-cache memory database gives every pool its
        // own isolated database without touching the filesystem; it lives
        // exactly as long as the pool holds a connection.
        format!(
            "sqlite:file:fleet-cp-{}?mode=memory&cache=shared",
            Uuid::new_v4()
        )
    } else {
        database_url.to_string()
    };

    ensure_db_dir(&resolved_url)?;

    let mut opts = SqliteConnectOptions::from_str(&resolved_url)?;
    opts = opts.create_if_missing(true).foreign_keys(true);
    if !is_memory_request {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_opts = if is_memory_request {
        // One always-open connection pins the memory database for the
        // lifetime of the pool.
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_opts
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    if database_url.starts_with("sqlite::memory") {
        return Ok(());
    }
    if let Some(path_str) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(path_str).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

pub fn latest_migration_version() -> Option<i64> {
    MIGRATOR.iter().map(|m| m.version).max()
}

pub async fn migration_snapshot(pool: &Db) -> Result<MigrationSnapshot> {
    let applied = fetch_applied_migrations(pool).await?;
    let descriptions: HashMap<i64, String> = MIGRATOR
        .iter()
        .map(|m| (m.version, m.description.to_string()))
        .collect();
    let applied_labels: Vec<MigrationLabel> = applied
        .iter()
        .map(|m| MigrationLabel {
            version: m.version,
            description: descriptions
                .get(&m.version)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
        })
        .collect();

    let applied_versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();
    let pending: Vec<MigrationLabel> = MIGRATOR
        .iter()
        .filter(|m| !applied_versions.contains(&m.version))
        .map(|m| MigrationLabel {
            version: m.version,
            description: m.description.to_string(),
        })
        .collect();

    let latest_applied = applied.iter().map(|m| m.version).max();
    let latest_available = latest_migration_version();

    Ok(MigrationSnapshot {
        latest_applied,
        latest_available,
        applied: applied_labels,
        pending,
    })
}

pub async fn validate_migrations(pool: &Db) -> Result<()> {
    let applied = fetch_applied_migrations(pool).await?;
    let known: HashMap<i64, &sqlx::migrate::Migration> =
        MIGRATOR.iter().map(|m| (m.version, m)).collect();

    for migration in &applied {
        let Some(defined) = known.get(&migration.version) else {
            anyhow::bail!(
                "database has unknown migration version {}",
                migration.version
            );
        };

        if defined.checksum != migration.checksum {
            anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                migration.version
            );
        }
    }

    Ok(())
}

pub async fn dry_run_migrations(pool: &Db) -> Result<MigrationSnapshot> {
    let before = migration_snapshot(pool).await?;
    validate_migrations(pool).await?;

    let temp = init_pool("sqlite::memory:").await?;
    MIGRATOR
        .run(&temp)
        .await
        .context("dry-run execution of migrations failed")?;

    Ok(before)
}

pub async fn run_migrations(pool: &Db) -> Result<MigrationRunOutcome> {
    let before = migration_snapshot(pool).await?;
    validate_migrations(pool).await?;

    if before.pending.is_empty() {
        return Ok(MigrationRunOutcome {
            snapshot: before.clone(),
            applied: Vec::new(),
        });
    }

    let previously_applied: HashSet<i64> = before.applied.iter().map(|m| m.version).collect();
    MIGRATOR
        .run(pool)
        .await
        .context("applying database migrations failed")?;

    let after = migration_snapshot(pool).await?;
    let newly_applied: Vec<MigrationLabel> = after
        .applied
        .iter()
        .filter(|m| !previously_applied.contains(&m.version))
        .cloned()
        .collect();

    Ok(MigrationRunOutcome {
        snapshot: after,
        applied: newly_applied,
    })
}

async fn fetch_applied_migrations(pool: &Db) -> Result<Vec<AppliedMigration>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;

    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }

    let applied = conn
        .list_applied_migrations()
        .await
        .context("list applied migrations")?;

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::migrate::Migrate;

    #[test]
    fn ensure_db_dir_creates_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("db.sqlite");
        let url = format!("sqlite://{}", db_path.display());
        ensure_db_dir(&url).expect("ensure");
        assert!(db_path.parent().expect("parent").exists());
    }

    #[tokio::test]
    async fn memory_pools_get_isolated_databases() {
        let first = init_pool("sqlite::memory:").await.expect("pool");
        run_migrations(&first).await.expect("run");

        // A second memory pool starts from an empty database.
        let second = init_pool("sqlite::memory:").await.expect("pool");
        let snapshot = migration_snapshot(&second).await.expect("snapshot");
        assert!(snapshot.applied.is_empty());
        assert_eq!(snapshot.pending.len(), MIGRATOR.iter().count());
    }

    #[tokio::test]
    async fn migration_snapshot_reports_pending_for_fresh_db() {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        let snapshot = migration_snapshot(&pool).await.expect("snapshot");
        let total = MIGRATOR.iter().count();
        assert!(snapshot.applied.is_empty());
        assert_eq!(snapshot.pending.len(), total);
        assert_eq!(snapshot.latest_applied, None);
        assert_eq!(snapshot.latest_available, latest_migration_version());
    }

    #[tokio::test]
    async fn run_migrations_applies_everything_once() {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        let first = run_migrations(&pool).await.expect("run");
        assert!(!first.applied.is_empty());

        let second = run_migrations(&pool).await.expect("run again");
        assert!(second.applied.is_empty());
        assert_eq!(second.snapshot.latest_applied, latest_migration_version());
    }

    async fn insert_applied_migration(pool: &Db, version: i64, checksum: Vec<u8>) -> Result<()> {
        let mut conn = pool.acquire().await?;
        conn.ensure_migrations_table().await?;
        sqlx::query(
            "INSERT INTO _sqlx_migrations \
             (version, description, installed_on, success, checksum, execution_time) \
             VALUES (?, ?, CURRENT_TIMESTAMP, 1, ?, 0)",
        )
        .bind(version)
        .bind(format!("test-{version}"))
        .bind(checksum)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn validate_migrations_rejects_unknown_version() {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        let unknown = latest_migration_version().unwrap_or(0) + 100;
        insert_applied_migration(&pool, unknown, vec![0_u8; 32])
            .await
            .expect("insert");

        let err = validate_migrations(&pool)
            .await
            .expect_err("unknown should fail");
        assert!(err.to_string().contains("unknown migration version"));
    }
}
