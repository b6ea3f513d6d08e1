//! Forum topic mirror, classification output, assignments, per-day stats and
//! per-channel organization configuration.

use std::collections::BTreeMap;

use sqlx::{Row, SqlitePool};

use crate::config::{FallbackStrategy, OrganizationMode, OrganizationSettings, TopicStrategy};
use crate::store::now_unix;
use crate::types::error::{Result, SpectraError};
use crate::types::topic::{
    AssignmentMethod, ContentMetadataRecord, ForumTopicRecord, OrganizationStatsRecord,
    StatsDelta, TopicAssignmentRecord,
};

#[derive(Clone, Debug)]
pub struct EfficiencyReport {
    pub messages_processed: i64,
    pub topics_created: i64,
    pub successful_assignments: i64,
    pub failed_assignments: i64,
    pub fallback_used: i64,
    pub success_rate: f64,
}

#[derive(Clone, Debug)]
pub struct TopicPerformance {
    pub topic_id: Option<i64>,
    pub topic_title: Option<String>,
    pub assignments: i64,
}

#[derive(Clone)]
pub struct TopicStore {
    pool: SqlitePool,
}

impl TopicStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_topic(&self, topic: &ForumTopicRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO forum_topics
                 (channel_id, topic_id, title, icon_color, icon_emoji_id, category,
                  subcategory, description, message_count, created_at, last_activity_at,
                  is_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, topic_id) DO UPDATE SET
                 title = excluded.title,
                 icon_color = excluded.icon_color,
                 icon_emoji_id = excluded.icon_emoji_id,
                 category = COALESCE(excluded.category, forum_topics.category),
                 subcategory = COALESCE(excluded.subcategory, forum_topics.subcategory),
                 description = COALESCE(excluded.description, forum_topics.description),
                 message_count = excluded.message_count,
                 last_activity_at = excluded.last_activity_at,
                 is_active = excluded.is_active",
        )
        .bind(topic.channel_id)
        .bind(topic.topic_id)
        .bind(&topic.title)
        .bind(topic.icon_color as i64)
        .bind(topic.icon_emoji_id)
        .bind(&topic.category)
        .bind(&topic.subcategory)
        .bind(&topic.description)
        .bind(topic.message_count)
        .bind(topic.created_at)
        .bind(topic.last_activity_at)
        .bind(topic.is_active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_topic(&self, channel_id: i64, topic_id: i64) -> Result<Option<ForumTopicRecord>> {
        let row = sqlx::query(
            "SELECT channel_id, topic_id, title, icon_color, icon_emoji_id, category,
                    subcategory, description, message_count, created_at, last_activity_at,
                    is_active
             FROM forum_topics WHERE channel_id = ? AND topic_id = ?",
        )
        .bind(channel_id)
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(topic_from_row))
    }

    pub async fn find_topic_by_title(
        &self,
        channel_id: i64,
        title: &str,
    ) -> Result<Option<ForumTopicRecord>> {
        let row = sqlx::query(
            "SELECT channel_id, topic_id, title, icon_color, icon_emoji_id, category,
                    subcategory, description, message_count, created_at, last_activity_at,
                    is_active
             FROM forum_topics
             WHERE channel_id = ? AND title = ? AND is_active = 1
             ORDER BY topic_id LIMIT 1",
        )
        .bind(channel_id)
        .bind(title)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(topic_from_row))
    }

    pub async fn topics_by_channel(
        &self,
        channel_id: i64,
        active_only: bool,
    ) -> Result<Vec<ForumTopicRecord>> {
        let sql = if active_only {
            "SELECT channel_id, topic_id, title, icon_color, icon_emoji_id, category,
                    subcategory, description, message_count, created_at, last_activity_at,
                    is_active
             FROM forum_topics WHERE channel_id = ? AND is_active = 1 ORDER BY topic_id"
        } else {
            "SELECT channel_id, topic_id, title, icon_color, icon_emoji_id, category,
                    subcategory, description, message_count, created_at, last_activity_at,
                    is_active
             FROM forum_topics WHERE channel_id = ? ORDER BY topic_id"
        };
        let rows = sqlx::query(sql).bind(channel_id).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(topic_from_row).collect())
    }

    pub async fn topics_by_category(
        &self,
        channel_id: i64,
        category: &str,
    ) -> Result<Vec<ForumTopicRecord>> {
        let rows = sqlx::query(
            "SELECT channel_id, topic_id, title, icon_color, icon_emoji_id, category,
                    subcategory, description, message_count, created_at, last_activity_at,
                    is_active
             FROM forum_topics
             WHERE channel_id = ? AND category = ? AND is_active = 1
             ORDER BY topic_id",
        )
        .bind(channel_id)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(topic_from_row).collect())
    }

    /// Soft delete: the row survives for reporting but existence checks skip
    /// it.
    pub async fn deactivate_topic(&self, channel_id: i64, topic_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE forum_topics SET is_active = 0 WHERE channel_id = ? AND topic_id = ?",
        )
        .bind(channel_id)
        .bind(topic_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Topics with no recorded assignments, older than `min_age_hours`.
    pub async fn empty_topics(&self, channel_id: i64, min_age_hours: i64) -> Result<Vec<i64>> {
        let threshold = now_unix() - min_age_hours * 3600;
        let rows = sqlx::query(
            "SELECT t.topic_id FROM forum_topics t
             LEFT JOIN topic_assignments a
                 ON a.channel_id = t.channel_id AND a.topic_id = t.topic_id
             WHERE t.channel_id = ? AND t.is_active = 1 AND t.created_at < ?
             GROUP BY t.topic_id
             HAVING COUNT(a.id) = 0
             ORDER BY t.topic_id",
        )
        .bind(channel_id)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    pub async fn upsert_content_metadata(&self, record: &ContentMetadataRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO content_metadata
                 (message_id, channel_id, content_type, category, subcategory,
                  file_extension, file_size, mime_type, duration, width, height,
                  keywords, classification_confidence, additional_metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, message_id) DO UPDATE SET
                 content_type = excluded.content_type,
                 category = excluded.category,
                 subcategory = excluded.subcategory,
                 file_extension = excluded.file_extension,
                 file_size = excluded.file_size,
                 mime_type = excluded.mime_type,
                 duration = excluded.duration,
                 width = excluded.width,
                 height = excluded.height,
                 keywords = excluded.keywords,
                 classification_confidence = excluded.classification_confidence,
                 additional_metadata = excluded.additional_metadata",
        )
        .bind(record.message_id)
        .bind(record.channel_id)
        .bind(&record.content_type)
        .bind(&record.category)
        .bind(&record.subcategory)
        .bind(&record.file_extension)
        .bind(record.file_size)
        .bind(&record.mime_type)
        .bind(record.duration)
        .bind(record.width)
        .bind(record.height)
        .bind(&record.keywords)
        .bind(record.classification_confidence)
        .bind(&record.additional_metadata)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_content_metadata(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<ContentMetadataRecord>> {
        let row = sqlx::query(
            "SELECT message_id, channel_id, content_type, category, subcategory,
                    file_extension, file_size, mime_type, duration, width, height,
                    keywords, classification_confidence, additional_metadata
             FROM content_metadata WHERE channel_id = ? AND message_id = ?",
        )
        .bind(channel_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ContentMetadataRecord {
            message_id: row.get(0),
            channel_id: row.get(1),
            content_type: row.get(2),
            category: row.get(3),
            subcategory: row.get(4),
            file_extension: row.get(5),
            file_size: row.get(6),
            mime_type: row.get(7),
            duration: row.get(8),
            width: row.get(9),
            height: row.get(10),
            keywords: row.get(11),
            classification_confidence: row.get(12),
            additional_metadata: row.get(13),
        }))
    }

    pub async fn upsert_assignment(&self, record: &TopicAssignmentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO topic_assignments
                 (message_id, channel_id, topic_id, topic_title, category,
                  assignment_method, confidence, fallback_used, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, message_id) DO UPDATE SET
                 topic_id = excluded.topic_id,
                 topic_title = excluded.topic_title,
                 category = excluded.category,
                 assignment_method = excluded.assignment_method,
                 confidence = excluded.confidence,
                 fallback_used = excluded.fallback_used",
        )
        .bind(record.message_id)
        .bind(record.channel_id)
        .bind(record.topic_id)
        .bind(&record.topic_title)
        .bind(&record.category)
        .bind(record.assignment_method.as_str())
        .bind(record.confidence)
        .bind(record.fallback_used as i64)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_assignment(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<Option<TopicAssignmentRecord>> {
        let row = sqlx::query(
            "SELECT message_id, channel_id, topic_id, topic_title, category,
                    assignment_method, confidence, fallback_used
             FROM topic_assignments WHERE channel_id = ? AND message_id = ?",
        )
        .bind(channel_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TopicAssignmentRecord {
            message_id: row.get(0),
            channel_id: row.get(1),
            topic_id: row.get(2),
            topic_title: row.get(3),
            category: row.get(4),
            assignment_method: AssignmentMethod::parse(row.get::<String, _>(5).as_str())
                .unwrap_or(AssignmentMethod::Auto),
            confidence: row.get(6),
            fallback_used: row.get::<i64, _>(7) != 0,
        }))
    }

    /// Atomic additive upsert of the per-day stats row. The numeric columns
    /// add server-side; the category map merges inside the same transaction,
    /// which is the only additive path for stats.
    pub async fn accumulate_stats(
        &self,
        channel_id: i64,
        date: &str,
        delta: &StatsDelta,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query(
            "SELECT categories_json FROM organization_stats
             WHERE channel_id = ? AND date = ?",
        )
        .bind(channel_id)
        .bind(date)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get(0));

        let mut categories: BTreeMap<String, i64> = existing
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        for (category, count) in &delta.categories {
            *categories.entry(category.clone()).or_insert(0) += count;
        }
        let categories_json = serde_json::to_string(&categories)
            .map_err(|e| SpectraError::state_store(e.to_string()))?;

        sqlx::query(
            "INSERT INTO organization_stats
                 (channel_id, date, messages_processed, topics_created,
                  successful_assignments, failed_assignments, fallback_used,
                  categories_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id, date) DO UPDATE SET
                 messages_processed = messages_processed + excluded.messages_processed,
                 topics_created = topics_created + excluded.topics_created,
                 successful_assignments = successful_assignments + excluded.successful_assignments,
                 failed_assignments = failed_assignments + excluded.failed_assignments,
                 fallback_used = fallback_used + excluded.fallback_used,
                 categories_json = excluded.categories_json",
        )
        .bind(channel_id)
        .bind(date)
        .bind(delta.messages_processed)
        .bind(delta.topics_created)
        .bind(delta.successful_assignments)
        .bind(delta.failed_assignments)
        .bind(delta.fallback_used)
        .bind(&categories_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_stats(
        &self,
        channel_id: i64,
        date: &str,
    ) -> Result<Option<OrganizationStatsRecord>> {
        let row = sqlx::query(
            "SELECT channel_id, date, messages_processed, topics_created,
                    successful_assignments, failed_assignments, fallback_used,
                    categories_json
             FROM organization_stats WHERE channel_id = ? AND date = ?",
        )
        .bind(channel_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(stats_from_row))
    }

    pub async fn stats_range(
        &self,
        channel_id: i64,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<OrganizationStatsRecord>> {
        let rows = sqlx::query(
            "SELECT channel_id, date, messages_processed, topics_created,
                    successful_assignments, failed_assignments, fallback_used,
                    categories_json
             FROM organization_stats
             WHERE channel_id = ? AND date >= ? AND date <= ?
             ORDER BY date",
        )
        .bind(channel_id)
        .bind(start_date)
        .bind(end_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(stats_from_row).collect())
    }

    /// Category → message count over the trailing `days` days.
    pub async fn category_distribution(
        &self,
        channel_id: i64,
        days: i64,
    ) -> Result<BTreeMap<String, i64>> {
        let start = (chrono::Utc::now() - chrono::Duration::days(days))
            .format("%Y-%m-%d")
            .to_string();
        let rows = sqlx::query(
            "SELECT categories_json FROM organization_stats
             WHERE channel_id = ? AND date >= ?",
        )
        .bind(channel_id)
        .bind(&start)
        .fetch_all(&self.pool)
        .await?;

        let mut distribution: BTreeMap<String, i64> = BTreeMap::new();
        for row in rows {
            let raw: String = row.get(0);
            if let Ok(categories) = serde_json::from_str::<BTreeMap<String, i64>>(&raw) {
                for (category, count) in categories {
                    *distribution.entry(category).or_insert(0) += count;
                }
            }
        }
        Ok(distribution)
    }

    pub async fn efficiency_report(&self, channel_id: i64, days: i64) -> Result<EfficiencyReport> {
        let start = (chrono::Utc::now() - chrono::Duration::days(days))
            .format("%Y-%m-%d")
            .to_string();
        let row = sqlx::query(
            "SELECT COALESCE(SUM(messages_processed), 0),
                    COALESCE(SUM(topics_created), 0),
                    COALESCE(SUM(successful_assignments), 0),
                    COALESCE(SUM(failed_assignments), 0),
                    COALESCE(SUM(fallback_used), 0)
             FROM organization_stats WHERE channel_id = ? AND date >= ?",
        )
        .bind(channel_id)
        .bind(&start)
        .fetch_one(&self.pool)
        .await?;

        let messages_processed: i64 = row.get(0);
        let successful_assignments: i64 = row.get(2);
        Ok(EfficiencyReport {
            messages_processed,
            topics_created: row.get(1),
            successful_assignments,
            failed_assignments: row.get(3),
            fallback_used: row.get(4),
            success_rate: if messages_processed > 0 {
                successful_assignments as f64 / messages_processed as f64
            } else {
                0.0
            },
        })
    }

    pub async fn topic_performance(
        &self,
        channel_id: i64,
        limit: i64,
    ) -> Result<Vec<TopicPerformance>> {
        let rows = sqlx::query(
            "SELECT topic_id, topic_title, COUNT(*) AS assignments
             FROM topic_assignments
             WHERE channel_id = ?
             GROUP BY topic_id, topic_title
             ORDER BY assignments DESC, topic_id
             LIMIT ?",
        )
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TopicPerformance {
                topic_id: row.get(0),
                topic_title: row.get(1),
                assignments: row.get(2),
            })
            .collect())
    }

    pub async fn cleanup_old_stats(&self, days_to_keep: i64) -> Result<u64> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(days_to_keep))
            .format("%Y-%m-%d")
            .to_string();
        let result = sqlx::query("DELETE FROM organization_stats WHERE date < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_org_config(&self, channel_id: i64) -> Result<Option<OrganizationSettings>> {
        let row = sqlx::query(
            "SELECT mode, topic_strategy, fallback_strategy, max_topics_per_channel,
                    topic_creation_cooldown_seconds, enable_content_analysis,
                    classification_confidence_threshold, general_topic_title,
                    auto_cleanup_empty_topics, enable_statistics, debug_mode
             FROM organization_config WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let defaults = OrganizationSettings::default();
        Ok(Some(OrganizationSettings {
            mode: OrganizationMode::parse(row.get::<String, _>(0).as_str())
                .unwrap_or(defaults.mode),
            topic_strategy: TopicStrategy::parse(row.get::<String, _>(1).as_str())
                .unwrap_or(defaults.topic_strategy),
            fallback_strategy: FallbackStrategy::parse(row.get::<String, _>(2).as_str())
                .unwrap_or(defaults.fallback_strategy),
            max_topics_per_channel: row.get::<i64, _>(3) as u32,
            topic_creation_cooldown_seconds: row.get::<i64, _>(4) as u64,
            enable_content_analysis: row.get::<i64, _>(5) != 0,
            classification_confidence_threshold: row.get(6),
            general_topic_title: row.get(7),
            auto_cleanup_empty_topics: row.get::<i64, _>(8) != 0,
            enable_statistics: row.get::<i64, _>(9) != 0,
            debug_mode: row.get::<i64, _>(10) != 0,
        }))
    }

    pub async fn upsert_org_config(
        &self,
        channel_id: i64,
        settings: &OrganizationSettings,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO organization_config
                 (channel_id, mode, topic_strategy, fallback_strategy,
                  max_topics_per_channel, topic_creation_cooldown_seconds,
                  enable_content_analysis, classification_confidence_threshold,
                  general_topic_title, auto_cleanup_empty_topics, enable_statistics,
                  debug_mode, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_id) DO UPDATE SET
                 mode = excluded.mode,
                 topic_strategy = excluded.topic_strategy,
                 fallback_strategy = excluded.fallback_strategy,
                 max_topics_per_channel = excluded.max_topics_per_channel,
                 topic_creation_cooldown_seconds = excluded.topic_creation_cooldown_seconds,
                 enable_content_analysis = excluded.enable_content_analysis,
                 classification_confidence_threshold = excluded.classification_confidence_threshold,
                 general_topic_title = excluded.general_topic_title,
                 auto_cleanup_empty_topics = excluded.auto_cleanup_empty_topics,
                 enable_statistics = excluded.enable_statistics,
                 debug_mode = excluded.debug_mode,
                 updated_at = excluded.updated_at",
        )
        .bind(channel_id)
        .bind(settings.mode.as_str())
        .bind(settings.topic_strategy.as_str())
        .bind(settings.fallback_strategy.as_str())
        .bind(settings.max_topics_per_channel as i64)
        .bind(settings.topic_creation_cooldown_seconds as i64)
        .bind(settings.enable_content_analysis as i64)
        .bind(settings.classification_confidence_threshold)
        .bind(&settings.general_topic_title)
        .bind(settings.auto_cleanup_empty_topics as i64)
        .bind(settings.enable_statistics as i64)
        .bind(settings.debug_mode as i64)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the attribution counter for an origin channel.
    pub async fn increment_attribution(&self, channel_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO attribution_stats (channel_id, attributed_messages, last_attributed_at)
             VALUES (?, 1, ?)
             ON CONFLICT(channel_id) DO UPDATE SET
                 attributed_messages = attributed_messages + 1,
                 last_attributed_at = excluded.last_attributed_at",
        )
        .bind(channel_id)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn attribution_count(&self, channel_id: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT attributed_messages FROM attribution_stats WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }
}

fn topic_from_row(row: sqlx::sqlite::SqliteRow) -> ForumTopicRecord {
    ForumTopicRecord {
        channel_id: row.get(0),
        topic_id: row.get(1),
        title: row.get(2),
        icon_color: row.get::<i64, _>(3) as u32,
        icon_emoji_id: row.get(4),
        category: row.get(5),
        subcategory: row.get(6),
        description: row.get(7),
        message_count: row.get(8),
        created_at: row.get(9),
        last_activity_at: row.get(10),
        is_active: row.get::<i64, _>(11) != 0,
    }
}

fn stats_from_row(row: sqlx::sqlite::SqliteRow) -> OrganizationStatsRecord {
    let raw: String = row.get(7);
    OrganizationStatsRecord {
        channel_id: row.get(0),
        date: row.get(1),
        messages_processed: row.get(2),
        topics_created: row.get(3),
        successful_assignments: row.get(4),
        failed_assignments: row.get(5),
        fallback_used: row.get(6),
        categories: serde_json::from_str(&raw).unwrap_or_default(),
    }
}
