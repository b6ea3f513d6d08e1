//! SQLite state store underpinning every other component.
//!
//! One file, WAL journaling, foreign keys on. Callers never see raw SQL:
//! each entity family has a typed sub-store (`hashes()`, `access()`,
//! `topics()`, `queue()`, `mirror()`).

pub mod access;
pub mod hashes;
pub mod mirror;
pub mod queue;
pub mod topics;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, SqlitePool};
use tracing::info;

use crate::types::error::{Result, SpectraError};

pub use access::{AccessStore, ChannelAccessRecord};
pub use hashes::HashStore;
pub use mirror::{MirrorProgressRecord, MirrorStore};
pub use queue::{QueueEntry, QueueStatus, QueueStore, ScheduleRecord};
pub use topics::TopicStore;

/// Ordered list of forward-only migrations: (version, name, sql).
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "dedup_and_access",
        include_str!("../../migrations/001_dedup_and_access.sql"),
    ),
    (
        2,
        "topic_organization",
        include_str!("../../migrations/002_topic_organization.sql"),
    ),
    (
        3,
        "scheduler_and_mirror",
        include_str!("../../migrations/003_scheduler_and_mirror.sql"),
    ),
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the state store and bring the schema up to
    /// date.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SpectraError::state_store(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;

        info!(path = %db_path.display(), "state store open (WAL, foreign keys on)");
        Ok(Self { pool })
    }

    pub fn hashes(&self) -> HashStore {
        HashStore::new(self.pool.clone())
    }

    pub fn access(&self) -> AccessStore {
        AccessStore::new(self.pool.clone())
    }

    pub fn topics(&self) -> TopicStore {
        TopicStore::new(self.pool.clone())
    }

    pub fn queue(&self) -> QueueStore {
        QueueStore::new(self.pool.clone())
    }

    pub fn mirror(&self) -> MirrorStore {
        MirrorStore::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
    )
    .await?;

    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    let current_version: i64 = row.get("v");

    for &(version, name, sql) in MIGRATIONS {
        if version <= current_version {
            continue;
        }
        pool.execute(sql).await.map_err(|e| {
            SpectraError::state_store(format!("applying migration v{version} ({name}): {e}"))
        })?;
        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES (?, ?)")
            .bind(version)
            .bind(name)
            .execute(pool)
            .await?;
        info!(version, name, "applied migration");
    }

    Ok(())
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) async fn open_test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("spectra.db")).await.unwrap();
    (dir, store)
}
