//! Content-hash index and forward inventory.

use futures::TryStreamExt;
use sqlx::{Row, SqlitePool};

use crate::store::now_unix;
use crate::types::error::Result;

#[derive(Clone)]
pub struct HashStore {
    pool: SqlitePool,
}

impl HashStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a file's content hash. Idempotent: a hash seen before (same
    /// file id or same digest) leaves the existing row untouched, since
    /// `FileHash` rows are never mutated.
    pub async fn upsert_hash(&self, file_id: i64, sha256: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_hashes (file_id, sha256_hash, first_seen_at)
             VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(file_id)
        .bind(sha256)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The file id a digest was first recorded under. Re-uploads of the same
    /// content get inventoried against this canonical id.
    pub async fn file_id_for_digest(&self, sha256: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT file_id FROM file_hashes WHERE sha256_hash = ?")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn hash_exists(&self, sha256: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM file_hashes WHERE sha256_hash = ?")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Stream every known digest. Used once at startup to seed the
    /// deduplicator's in-memory set without materializing the table twice.
    pub async fn load_all_hashes(&self) -> Result<Vec<String>> {
        let mut rows = sqlx::query(
            "SELECT sha256_hash FROM file_hashes WHERE sha256_hash IS NOT NULL",
        )
        .fetch(&self.pool);

        let mut hashes = Vec::new();
        while let Some(row) = rows.try_next().await? {
            hashes.push(row.get::<String, _>(0));
        }
        Ok(hashes)
    }

    pub async fn count_hashes(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM file_hashes")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("c"))
    }

    /// Append one inventory row proving a file was forwarded from a channel.
    pub async fn insert_inventory(
        &self,
        channel_id: i64,
        message_id: i64,
        file_id: i64,
        topic_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_file_inventory
                 (channel_id, message_id, file_id, topic_id, forwarded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(channel_id)
        .bind(message_id)
        .bind(file_id)
        .bind(topic_id)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn inventory_count(&self, channel_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM channel_file_inventory WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("c"))
    }

    pub async fn inventory_for_file(&self, file_id: i64) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query(
            "SELECT channel_id, message_id FROM channel_file_inventory
             WHERE file_id = ? ORDER BY id",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>(0), r.get::<i64, _>(1)))
            .collect())
    }
}
