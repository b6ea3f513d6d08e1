//! Mirror progress bookkeeping for mass migrations.

use sqlx::{Row, SqlitePool};

use crate::store::now_unix;
use crate::types::error::Result;

#[derive(Clone, Debug)]
pub struct MirrorProgressRecord {
    pub source_channel: String,
    pub dest_channel: String,
    pub last_message_id: i64,
    pub status: String,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
}

impl MirrorStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_progress(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<Option<MirrorProgressRecord>> {
        let row = sqlx::query(
            "SELECT source_channel, dest_channel, last_message_id, status, updated_at
             FROM mirror_progress WHERE source_channel = ? AND dest_channel = ?",
        )
        .bind(source)
        .bind(dest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| MirrorProgressRecord {
            source_channel: row.get(0),
            dest_channel: row.get(1),
            last_message_id: row.get(2),
            status: row.get(3),
            updated_at: row.get(4),
        }))
    }

    pub async fn set_progress(
        &self,
        source: &str,
        dest: &str,
        last_message_id: i64,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mirror_progress
                 (source_channel, dest_channel, last_message_id, status, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(source_channel, dest_channel) DO UPDATE SET
                 last_message_id = excluded.last_message_id,
                 status = excluded.status,
                 updated_at = excluded.updated_at",
        )
        .bind(source)
        .bind(dest)
        .bind(last_message_id)
        .bind(status)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, source: &str, dest: &str, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE mirror_progress SET status = ?, updated_at = ?
             WHERE source_channel = ? AND dest_channel = ?",
        )
        .bind(status)
        .bind(now_unix())
        .bind(source)
        .bind(dest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_progress(&self, source: &str, dest: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM mirror_progress WHERE source_channel = ? AND dest_channel = ?",
        )
        .bind(source)
        .bind(dest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record one delivered destination message, enabling rollback.
    pub async fn log_delivery(
        &self,
        source: &str,
        dest: &str,
        source_message_id: i64,
        dest_message_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mirror_log
                 (source_channel, dest_channel, source_message_id, dest_message_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source)
        .bind(dest)
        .bind(source_message_id)
        .bind(dest_message_id)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delivered_messages(&self, source: &str, dest: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT dest_message_id FROM mirror_log
             WHERE source_channel = ? AND dest_channel = ? ORDER BY id",
        )
        .bind(source)
        .bind(dest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    pub async fn clear_log(&self, source: &str, dest: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM mirror_log WHERE source_channel = ? AND dest_channel = ?",
        )
        .bind(source)
        .bind(dest)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
