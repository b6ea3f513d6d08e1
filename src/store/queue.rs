//! Persistent file-forward queue and scheduler entries.

use sqlx::{Row, SqlitePool};

use crate::store::now_unix;
use crate::types::error::Result;

/// Status of a queued file forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Success,
    Error(String),
}

impl QueueStatus {
    pub fn render(&self) -> String {
        match self {
            Self::Pending => "pending".to_string(),
            Self::Success => "success".to_string(),
            Self::Error(msg) => format!("error: {msg}"),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "success" => Self::Success,
            other => Self::Error(
                other
                    .strip_prefix("error: ")
                    .unwrap_or(other)
                    .to_string(),
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub origin_channel: String,
    pub message_id: i64,
    pub file_id: i64,
    pub destination: Option<String>,
    pub status: QueueStatus,
    pub enqueued_at: i64,
    pub attempted_at: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct ScheduleRecord {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub cron_expr: String,
    pub params_json: String,
    pub priority: i64,
    pub enabled: bool,
    pub last_run_at: Option<i64>,
}

#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn enqueue_file(
        &self,
        schedule_id: Option<i64>,
        origin_channel: &str,
        message_id: i64,
        file_id: i64,
        destination: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO file_forward_queue
                 (schedule_id, origin_channel, message_id, file_id, destination,
                  status, enqueued_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(schedule_id)
        .bind(origin_channel)
        .bind(message_id)
        .bind(file_id)
        .bind(destination)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Pending entries, highest owning-schedule priority first, FIFO within a
    /// priority band.
    pub async fn dequeue_pending(&self, limit: i64) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            "SELECT q.id, q.schedule_id, q.origin_channel, q.message_id, q.file_id,
                    q.destination, q.status, q.enqueued_at, q.attempted_at
             FROM file_forward_queue q
             LEFT JOIN schedule_entries s ON s.id = q.schedule_id
             WHERE q.status = 'pending'
             ORDER BY COALESCE(s.priority, 0) DESC, q.id ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(entry_from_row).collect())
    }

    pub async fn update_status(&self, queue_id: i64, status: &QueueStatus) -> Result<()> {
        sqlx::query(
            "UPDATE file_forward_queue SET status = ?, attempted_at = ? WHERE id = ?",
        )
        .bind(status.render())
        .bind(now_unix())
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn queue_report(&self, schedule_id: i64) -> Result<Vec<(i64, i64, QueueStatus)>> {
        let rows = sqlx::query(
            "SELECT message_id, file_id, status FROM file_forward_queue
             WHERE schedule_id = ? ORDER BY id",
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<i64, _>(0),
                    row.get::<i64, _>(1),
                    QueueStatus::parse(row.get::<String, _>(2).as_str()),
                )
            })
            .collect())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM file_forward_queue WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("c"))
    }

    pub async fn add_schedule(
        &self,
        name: &str,
        kind: &str,
        cron_expr: &str,
        params_json: &str,
        priority: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO schedule_entries (name, kind, cron_expr, params_json, priority)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 kind = excluded.kind,
                 cron_expr = excluded.cron_expr,
                 params_json = excluded.params_json,
                 priority = excluded.priority",
        )
        .bind(name)
        .bind(kind)
        .bind(cron_expr)
        .bind(params_json)
        .bind(priority)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, cron_expr, params_json, priority, enabled, last_run_at
             FROM schedule_entries ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(schedule_from_row).collect())
    }

    pub async fn get_schedule(&self, id: i64) -> Result<Option<ScheduleRecord>> {
        let row = sqlx::query(
            "SELECT id, name, kind, cron_expr, params_json, priority, enabled, last_run_at
             FROM schedule_entries WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(schedule_from_row))
    }

    pub async fn remove_schedule(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedule_entries WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_schedule_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE schedule_entries SET enabled = ? WHERE name = ?")
            .bind(enabled as i64)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_last_run(&self, name: &str, run_at: i64) -> Result<()> {
        sqlx::query("UPDATE schedule_entries SET last_run_at = ? WHERE name = ?")
            .bind(run_at)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> QueueEntry {
    QueueEntry {
        id: row.get(0),
        schedule_id: row.get(1),
        origin_channel: row.get(2),
        message_id: row.get(3),
        file_id: row.get(4),
        destination: row.get(5),
        status: QueueStatus::parse(row.get::<String, _>(6).as_str()),
        enqueued_at: row.get(7),
        attempted_at: row.get(8),
    }
}

fn schedule_from_row(row: sqlx::sqlite::SqliteRow) -> ScheduleRecord {
    ScheduleRecord {
        id: row.get(0),
        name: row.get(1),
        kind: row.get(2),
        cron_expr: row.get(3),
        params_json: row.get(4),
        priority: row.get(5),
        enabled: row.get::<i64, _>(6) != 0,
        last_run_at: row.get(7),
    }
}
