//! Mass migration: mirrors one channel into another, topics included, with
//! resumable progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accounts::pool::AccountPool;
use crate::gateway::{CreateTopicRequest, FetchOptions, TelegramGateway};
use crate::store::Store;
use crate::types::error::{Result, SpectraError};
use crate::types::message::{Entity, EntityRef};

const INTER_MESSAGE_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Default)]
pub struct MirrorReport {
    pub messages_mirrored: u64,
    pub topics_mapped: usize,
    pub last_message_id: i64,
}

pub struct MirrorService {
    store: Store,
    pool: Arc<AccountPool>,
}

impl MirrorService {
    pub fn new(store: Store, pool: Arc<AccountPool>) -> Self {
        Self { store, pool }
    }

    /// Mirror `source` into `dest`, resuming from recorded progress. Halts
    /// (and records `failed`) on destination permission errors; absorbs
    /// flood waits.
    pub async fn mirror(
        &self,
        source_ref: &EntityRef,
        dest_ref: &EntityRef,
        account: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MirrorReport> {
        let lease = self.pool.select(account).await?;
        let gateway = Arc::clone(&lease.gateway);

        let source = gateway.resolve_entity(source_ref).await?;
        let dest = gateway.resolve_entity(dest_ref).await?;
        let source_key = source.id.to_string();
        let dest_key = dest.id.to_string();

        let topic_map = self.mirror_topics(&source, &dest, gateway.as_ref()).await?;

        let resume_from = match self.store.mirror().get_progress(&source_key, &dest_key).await? {
            Some(progress) => {
                info!(
                    source = source.id,
                    dest = dest.id,
                    last = progress.last_message_id,
                    "resuming mirror"
                );
                progress.last_message_id
            }
            None => {
                self.store
                    .mirror()
                    .set_progress(&source_key, &dest_key, 0, "in_progress")
                    .await?;
                0
            }
        };
        self.store
            .mirror()
            .set_status(&source_key, &dest_key, "in_progress")
            .await?;

        let mut stream = gateway
            .iter_messages(
                &source,
                FetchOptions {
                    min_id: Some(resume_from),
                    reverse: true,
                    ..FetchOptions::default()
                },
            )
            .await?;

        let mut report = MirrorReport {
            topics_mapped: topic_map.len(),
            last_message_id: resume_from,
            ..MirrorReport::default()
        };

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                self.store
                    .mirror()
                    .set_status(&source_key, &dest_key, "paused")
                    .await?;
                return Err(SpectraError::CancelRequested);
            }
            let message = item?;

            let reply_to = message
                .reply_to
                .as_ref()
                .and_then(|r| r.topic_id)
                .and_then(|topic| topic_map.get(&topic).copied());

            let delivered = match gateway
                .send_message(&dest, &message.text, Some(&message), reply_to)
                .await
            {
                Ok(delivered) => delivered,
                Err(SpectraError::FloodWait { seconds }) => {
                    warn!(seconds, message_id = message.id, "flood wait while mirroring");
                    tokio::time::sleep(Duration::from_secs(seconds + 1)).await;
                    continue;
                }
                Err(err) if err.is_permission_denied() => {
                    error!(
                        dest = dest.id,
                        error = %err,
                        "permission error in destination, halting mirror"
                    );
                    self.store
                        .mirror()
                        .set_status(&source_key, &dest_key, "failed")
                        .await?;
                    return Err(err);
                }
                Err(err) => {
                    warn!(message_id = message.id, error = %err, "message skipped");
                    continue;
                }
            };

            self.store
                .mirror()
                .log_delivery(&source_key, &dest_key, message.id, delivered.message_id)
                .await?;
            self.store
                .mirror()
                .set_progress(&source_key, &dest_key, message.id, "in_progress")
                .await?;
            report.messages_mirrored += 1;
            report.last_message_id = message.id;

            tokio::time::sleep(INTER_MESSAGE_DELAY).await;
        }

        self.store
            .mirror()
            .set_status(&source_key, &dest_key, "completed")
            .await?;
        info!(
            source = source.id,
            dest = dest.id,
            mirrored = report.messages_mirrored,
            "mirror completed"
        );
        Ok(report)
    }

    /// Recreate the source's forum topics in the destination, returning the
    /// source-topic → dest-topic map.
    async fn mirror_topics(
        &self,
        source: &Entity,
        dest: &Entity,
        gateway: &dyn TelegramGateway,
    ) -> Result<HashMap<i64, i64>> {
        let mut map = HashMap::new();
        if !source.is_forum() || !dest.is_forum() {
            return Ok(map);
        }

        let mut cursor = None;
        let mut source_topics = Vec::new();
        loop {
            let page = match gateway.list_forum_topics(source, cursor.clone()).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source = source.id, error = %err, "cannot list source topics");
                    return Ok(map);
                }
            };
            source_topics.extend(page.topics);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let existing = gateway
            .list_forum_topics(dest, None)
            .await
            .map(|page| page.topics)
            .unwrap_or_default();

        for topic in source_topics {
            if let Some(found) = existing.iter().find(|t| t.title == topic.title) {
                map.insert(topic.topic_id, found.topic_id);
                continue;
            }

            let request = CreateTopicRequest {
                title: topic.title.clone(),
                icon_color: topic.icon_color,
                icon_emoji_id: topic.icon_emoji_id,
                random_id: uuid::Uuid::new_v4().as_u128() as i64,
            };
            match gateway.create_forum_topic(dest, &request).await {
                Ok(new_id) => {
                    map.insert(topic.topic_id, new_id);
                }
                Err(SpectraError::FloodWait { seconds }) => {
                    tokio::time::sleep(Duration::from_secs(seconds + 1)).await;
                    if let Ok(new_id) = gateway.create_forum_topic(dest, &request).await {
                        map.insert(topic.topic_id, new_id);
                    }
                }
                Err(err) => {
                    warn!(title = %topic.title, error = %err, "topic not mirrored");
                }
            }
        }

        info!(mapped = map.len(), "topics mirrored");
        Ok(map)
    }

    /// Best-effort rollback: delete every delivered destination message for
    /// the pair and reset progress. `DeleteForbidden` stops early.
    pub async fn rollback(
        &self,
        source_ref: &EntityRef,
        dest_ref: &EntityRef,
        account: Option<&str>,
    ) -> Result<u64> {
        let lease = self.pool.select(account).await?;
        let gateway = Arc::clone(&lease.gateway);
        let dest = gateway.resolve_entity(dest_ref).await?;

        let source_key = match source_ref {
            EntityRef::Id(id) => id.to_string(),
            EntityRef::Username(_) => gateway.resolve_entity(source_ref).await?.id.to_string(),
        };
        let dest_key = dest.id.to_string();

        let delivered = self
            .store
            .mirror()
            .delivered_messages(&source_key, &dest_key)
            .await?;
        if delivered.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0u64;
        for chunk in delivered.chunks(100) {
            match gateway.delete_messages(&dest, chunk).await {
                Ok(()) => deleted += chunk.len() as u64,
                Err(err @ SpectraError::DeleteForbidden { .. }) => {
                    warn!(error = %err, "rollback stopped");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "delete batch failed");
                    break;
                }
            }
        }

        self.store.mirror().clear_log(&source_key, &dest_key).await?;
        self.store.mirror().clear_progress(&source_key, &dest_key).await?;
        info!(deleted, "mirror rolled back");
        Ok(deleted)
    }
}
