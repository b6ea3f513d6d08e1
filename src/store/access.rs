//! Per-account channel visibility map, populated by the indexer.

use sqlx::{Row, SqlitePool};

use crate::store::now_unix;
use crate::types::error::Result;

#[derive(Clone, Debug)]
pub struct ChannelAccessRecord {
    pub account_id: String,
    pub channel_id: i64,
    pub channel_title: String,
    pub last_seen_at: i64,
}

#[derive(Clone)]
pub struct AccessStore {
    pool: SqlitePool,
}

impl AccessStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_access(
        &self,
        account_id: &str,
        channel_id: i64,
        channel_title: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO account_channel_access
                 (account_id, channel_id, channel_title, last_seen_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, channel_id) DO UPDATE SET
                 channel_title = excluded.channel_title,
                 last_seen_at = excluded.last_seen_at",
        )
        .bind(account_id)
        .bind(channel_id)
        .bind(channel_title)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every `(account, channel)` pair, ordered for deterministic total-mode
    /// sweeps.
    pub async fn enumerate(&self) -> Result<Vec<ChannelAccessRecord>> {
        let rows = sqlx::query(
            "SELECT account_id, channel_id, channel_title, last_seen_at
             FROM account_channel_access
             ORDER BY account_id, channel_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(record_from_row).collect())
    }

    pub async fn for_account(&self, account_id: &str) -> Result<Vec<ChannelAccessRecord>> {
        let rows = sqlx::query(
            "SELECT account_id, channel_id, channel_title, last_seen_at
             FROM account_channel_access
             WHERE account_id = ?
             ORDER BY channel_id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(record_from_row).collect())
    }

    pub async fn remove_account(&self, account_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM account_channel_access WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> ChannelAccessRecord {
    ChannelAccessRecord {
        account_id: row.get(0),
        channel_id: row.get(1),
        channel_title: row.get(2),
        last_seen_at: row.get(3),
    }
}
