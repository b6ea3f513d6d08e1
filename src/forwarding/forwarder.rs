//! End-to-end forwarding pipeline: fetch → group → dedupe → organize →
//! deliver → record.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accounts::pool::{AccountLease, AccountPool};
use crate::config::{Config, OrganizationMode};
use crate::forwarding::attribution::{AttributionContext, AttributionFormatter};
use crate::forwarding::dedup::Deduplicator;
use crate::forwarding::grouping::{GroupingStrategy, MessageGrouper};
use crate::forwarding::organizer::{OrganizationEngine, OrganizationPort, OrganizationResult};
use crate::forwarding::topic_manager::TopicManager;
use crate::gateway::{FetchOptions, TelegramGateway};
use crate::store::Store;
use crate::types::error::{Result, SpectraError};
use crate::types::message::{Entity, EntityRef, Message};
use crate::types::topic::{
    AssignmentMethod, ContentMetadataRecord, StatsDelta, TopicAssignmentRecord,
};

/// Delay between members of a multi-message group.
const INTRA_GROUP_DELAY: Duration = Duration::from_secs(1);

/// Final summary counters for a forward run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub messages_forwarded: u64,
    pub files_forwarded: u64,
    pub bytes_forwarded: u64,
    pub topics_created: u64,
    pub topic_assignments: u64,
    pub fallback_used: u64,
}

impl ForwardStats {
    pub fn merge(&mut self, other: &ForwardStats) {
        self.messages_forwarded += other.messages_forwarded;
        self.files_forwarded += other.files_forwarded;
        self.bytes_forwarded += other.bytes_forwarded;
        self.topics_created += other.topics_created;
        self.topic_assignments += other.topic_assignments;
        self.fallback_used += other.fallback_used;
    }
}

#[derive(Clone, Debug)]
pub struct ForwardOutcome {
    pub last_message_id: Option<i64>,
    pub stats: ForwardStats,
}

#[derive(Clone, Debug)]
pub struct ForwardRequest {
    pub origin: EntityRef,
    pub destination: EntityRef,
    pub account: Option<String>,
    pub start_message_id: Option<i64>,
    /// Explicit topic override; wins over the organization engine.
    pub topic_override: Option<i64>,
}

impl ForwardRequest {
    pub fn new(origin: EntityRef, destination: EntityRef) -> Self {
        Self {
            origin,
            destination,
            account: None,
            start_message_id: None,
            topic_override: None,
        }
    }
}

/// Summary for a total-mode sweep over every accessible channel.
#[derive(Clone, Debug, Default)]
pub struct TotalForwardOutcome {
    pub channels_processed: usize,
    pub channels_failed: usize,
    pub stats: ForwardStats,
}

pub struct Forwarder {
    config: Arc<Config>,
    store: Store,
    pool: Arc<AccountPool>,
    dedup: Deduplicator,
    grouper: MessageGrouper,
    attribution: AttributionFormatter,
}

impl Forwarder {
    pub async fn new(config: Arc<Config>, store: Store, pool: Arc<AccountPool>) -> Result<Self> {
        let dedup =
            Deduplicator::new(&store, config.forwarding.enable_deduplication).await?;
        let grouper = MessageGrouper::new(GroupingStrategy::resolve(
            &config.grouping.strategy,
            config.grouping.time_window_seconds,
        ));
        let attribution = AttributionFormatter::from_config(&config.attribution);
        Ok(Self {
            config,
            store,
            pool,
            dedup,
            grouper,
            attribution,
        })
    }

    /// Run one forward pass from `origin` to `destination`.
    pub async fn forward(
        &self,
        request: &ForwardRequest,
        cancel: &CancellationToken,
    ) -> Result<ForwardOutcome> {
        let lease = self.pool.select(request.account.as_deref()).await?;
        let gateway = Arc::clone(&lease.gateway);

        let origin = gateway.resolve_entity(&request.origin).await?;
        let destination = gateway.resolve_entity(&request.destination).await?;
        info!(
            origin = origin.id,
            destination = destination.id,
            account = %lease.session_name,
            "forward run starting"
        );

        let organizer = self.build_organizer(&gateway, &destination, request).await?;

        let mut stream = gateway
            .iter_messages(
                &origin,
                FetchOptions {
                    min_id: request.start_message_id,
                    media_only: !self.config.forwarding.forward_text_messages,
                    reverse: true,
                    ..FetchOptions::default()
                },
            )
            .await?;

        let mut messages: Vec<Message> = Vec::new();
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(SpectraError::CancelRequested);
            }
            messages.push(item?);
        }
        drop(stream);
        info!(count = messages.len(), origin = origin.id, "messages fetched");

        let groups = self.grouper.group(messages);
        info!(groups = groups.len(), "message groups to process");

        let mut stats = ForwardStats::default();
        let mut last_message_id: Option<i64> = None;

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SpectraError::CancelRequested);
            }
            if group.is_empty() {
                continue;
            }
            let representative = &group[0];

            if self.dedup.is_duplicate(group, gateway.as_ref()).await? {
                info!(
                    group = index + 1,
                    message_id = representative.id,
                    "duplicate group skipped"
                );
                continue;
            }

            let mut org_result: Option<OrganizationResult> = None;
            let mut topics_created_delta = 0u64;
            let topic_id = match request.topic_override {
                Some(topic) => Some(topic),
                None => match &organizer {
                    Some(engine) => {
                        let before = engine.stats_snapshot().await.topics_created;
                        let result = engine.organize_message(representative).await;
                        let after = engine.stats_snapshot().await.topics_created;
                        topics_created_delta = after.saturating_sub(before);
                        let topic = result.topic_id;
                        org_result = Some(result);
                        topic
                    }
                    None => None,
                },
            };

            match &org_result {
                Some(result) => {
                    if result.topic_id.is_some() && !result.fallback_used {
                        stats.topic_assignments += 1;
                    }
                    if result.fallback_used {
                        stats.fallback_used += 1;
                    }
                }
                None => {
                    if topic_id.is_some() {
                        stats.topic_assignments += 1;
                    }
                }
            }

            match self
                .deliver_group(group, &origin, &destination, gateway.as_ref(), topic_id, cancel)
                .await
            {
                Ok(()) => {}
                Err(SpectraError::FloodWait { seconds }) => {
                    warn!(
                        group = index + 1,
                        seconds, "flood wait while delivering, skipping group"
                    );
                    tokio::time::sleep(Duration::from_secs(seconds + 1)).await;
                    continue;
                }
                Err(SpectraError::CancelRequested) => return Err(SpectraError::CancelRequested),
                Err(err @ SpectraError::StateStore { .. }) => return Err(err),
                Err(err) if err.is_permission_denied() => {
                    error!(group = index + 1, error = %err, "permission error, skipping group");
                    continue;
                }
                Err(err) => {
                    error!(group = index + 1, error = %err, "delivery failed, skipping group");
                    continue;
                }
            }

            stats.messages_forwarded += 1;
            if let Some(file) = &representative.file {
                stats.files_forwarded += 1;
                stats.bytes_forwarded += file.size;
            }
            last_message_id = Some(representative.id);

            self.dedup
                .record_forwarded(
                    group,
                    origin.id,
                    &destination.id.to_string(),
                    gateway.as_ref(),
                )
                .await?;

            if self.config.forwarding.secondary_unique_destination.is_some() {
                self.fan_out_secondary(group, &origin, gateway.as_ref()).await;
            }
            if self.config.forwarding.forward_to_all_saved_messages {
                self.fan_out_saved_messages(group, &origin, &lease).await;
            }

            stats.topics_created += topics_created_delta;
            self.record_group(
                representative,
                &destination,
                request.topic_override,
                org_result.as_ref(),
                topics_created_delta,
            )
            .await?;
        }

        info!(
            origin = origin.id,
            forwarded = stats.messages_forwarded,
            files = stats.files_forwarded,
            bytes = stats.bytes_forwarded,
            topics_created = stats.topics_created,
            assignments = stats.topic_assignments,
            fallbacks = stats.fallback_used,
            "forward run finished"
        );

        Ok(ForwardOutcome {
            last_message_id,
            stats,
        })
    }

    /// Total forward mode: run the pipeline for every `(account, channel)`
    /// pair in the access map. Per-channel failures never abort the sweep.
    pub async fn forward_all_accessible(
        &self,
        destination: EntityRef,
        cancel: &CancellationToken,
    ) -> Result<TotalForwardOutcome> {
        let mut outcome = TotalForwardOutcome::default();

        for record in self.store.access().enumerate().await? {
            if cancel.is_cancelled() {
                return Err(SpectraError::CancelRequested);
            }

            let request = ForwardRequest {
                origin: EntityRef::Id(record.channel_id),
                destination: destination.clone(),
                account: Some(record.account_id.clone()),
                start_message_id: None,
                topic_override: None,
            };

            match self.forward(&request, cancel).await {
                Ok(run) => {
                    outcome.channels_processed += 1;
                    outcome.stats.merge(&run.stats);
                }
                Err(SpectraError::CancelRequested) => return Err(SpectraError::CancelRequested),
                Err(err) => {
                    warn!(
                        channel = record.channel_id,
                        account = %record.account_id,
                        error = %err,
                        "channel failed, continuing sweep"
                    );
                    outcome.channels_failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn build_organizer(
        &self,
        gateway: &Arc<dyn TelegramGateway>,
        destination: &Entity,
        request: &ForwardRequest,
    ) -> Result<Option<Arc<dyn OrganizationPort>>> {
        if !destination.is_forum() || request.topic_override.is_some() {
            return Ok(None);
        }

        let settings = match self.store.topics().get_org_config(destination.id).await? {
            Some(saved) => saved,
            None => self.config.topic_organization.clone(),
        };
        if settings.mode == OrganizationMode::Disabled {
            return Ok(None);
        }

        let manager = Arc::new(TopicManager::new(
            Arc::clone(gateway),
            self.store.topics(),
            destination.clone(),
            settings.topic_strategy,
            Duration::from_secs(settings.topic_creation_cooldown_seconds),
            settings.max_topics_per_channel,
        ));
        manager.initialize().await;

        let engine = Arc::new(OrganizationEngine::new(
            settings,
            Some(manager),
            destination.id,
        ));
        engine.initialize().await;
        Ok(Some(engine as Arc<dyn OrganizationPort>))
    }

    async fn deliver_group(
        &self,
        group: &[Message],
        origin: &Entity,
        destination: &Entity,
        gateway: &dyn TelegramGateway,
        topic_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let with_attribution =
            self.config.forwarding.forward_with_attribution && topic_id.is_none();

        for (index, message) in group.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SpectraError::CancelRequested);
            }

            if with_attribution {
                let body = self
                    .attributed_body(message, origin, destination, index, group.len())
                    .await?;
                gateway
                    .send_message(destination, &body, Some(message), topic_id)
                    .await?;
            } else {
                gateway
                    .forward_messages(destination, origin, &[message.id], topic_id)
                    .await?;
            }
            info!(
                message_id = message.id,
                destination = destination.id,
                topic = topic_id,
                "delivered message"
            );

            if group.len() > 1 && index < group.len() - 1 {
                tokio::time::sleep(INTRA_GROUP_DELAY).await;
            }
        }
        Ok(())
    }

    async fn attributed_body(
        &self,
        message: &Message,
        origin: &Entity,
        destination: &Entity,
        index: usize,
        group_size: usize,
    ) -> Result<String> {
        if self.attribution.is_disabled_for(destination.id) {
            return Ok(message.text.clone());
        }

        let ctx = AttributionContext {
            source_channel_name: if origin.title.is_empty() {
                format!("ID: {}", origin.id)
            } else {
                origin.title.clone()
            },
            source_channel_id: origin.id,
            sender_name: message
                .sender_id
                .map(|id| format!("user {id}"))
                .unwrap_or_else(|| "unknown".to_string()),
            sender_id: message.sender_id.unwrap_or_default(),
            timestamp: message.date,
            message_id: message.id,
        };
        let header = self.attribution.render_group_member(&ctx, index, group_size);
        self.store.topics().increment_attribution(origin.id).await?;

        Ok(if message.text.is_empty() {
            header
        } else {
            format!("{header}\n\n{}", message.text)
        })
    }

    async fn fan_out_secondary(
        &self,
        group: &[Message],
        origin: &Entity,
        gateway: &dyn TelegramGateway,
    ) {
        let Some(raw) = &self.config.forwarding.secondary_unique_destination else {
            return;
        };
        let reference = match EntityRef::parse(raw) {
            Ok(reference) => reference,
            Err(err) => {
                warn!(destination = %raw, error = %err, "bad secondary destination");
                return;
            }
        };
        let secondary = match gateway.resolve_entity(&reference).await {
            Ok(entity) => entity,
            Err(err) => {
                warn!(destination = %raw, error = %err, "secondary destination unresolved");
                return;
            }
        };

        for (index, message) in group.iter().enumerate() {
            match gateway
                .forward_messages(&secondary, origin, &[message.id], None)
                .await
            {
                Ok(_) => {}
                Err(SpectraError::FloodWait { seconds }) => {
                    warn!(seconds, "flood wait on secondary fan-out, skipping rest");
                    tokio::time::sleep(Duration::from_secs(seconds + 1)).await;
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "secondary fan-out failed");
                    return;
                }
            }
            if group.len() > 1 && index < group.len() - 1 {
                tokio::time::sleep(INTRA_GROUP_DELAY).await;
            }
        }
    }

    /// Forward the group to the Saved Messages of every healthy account,
    /// reusing the active lease for the account already checked out.
    async fn fan_out_saved_messages(
        &self,
        group: &[Message],
        origin: &Entity,
        active: &AccountLease,
    ) {
        for session in self.pool.healthy_sessions().await {
            if session == active.session_name {
                self.forward_group_to_saved(group, origin, active.gateway.as_ref(), &session)
                    .await;
                continue;
            }

            match self.pool.select(Some(&session)).await {
                Ok(lease) if lease.session_name == session => {
                    self.forward_group_to_saved(group, origin, lease.gateway.as_ref(), &session)
                        .await;
                }
                Ok(_) => {
                    // The pool rotated to a different account; this session is
                    // no longer usable for its own Saved Messages.
                    warn!(account = %session, "session unavailable for saved-messages fan-out");
                }
                Err(err) => {
                    warn!(account = %session, error = %err, "no lease for saved-messages fan-out");
                }
            }
        }
    }

    async fn forward_group_to_saved(
        &self,
        group: &[Message],
        origin: &Entity,
        gateway: &dyn TelegramGateway,
        session: &str,
    ) {
        let saved = match gateway.saved_messages().await {
            Ok(entity) => entity,
            Err(err) => {
                warn!(account = session, error = %err, "cannot resolve saved messages");
                return;
            }
        };

        for (index, message) in group.iter().enumerate() {
            match gateway
                .forward_messages(&saved, origin, &[message.id], None)
                .await
            {
                Ok(_) => {}
                Err(SpectraError::FloodWait { seconds }) => {
                    warn!(account = session, seconds, "flood wait on saved fan-out");
                    tokio::time::sleep(Duration::from_secs(seconds + 1)).await;
                    return;
                }
                Err(err) => {
                    warn!(account = session, error = %err, "saved fan-out failed");
                    return;
                }
            }
            if group.len() > 1 && index < group.len() - 1 {
                tokio::time::sleep(INTRA_GROUP_DELAY).await;
            }
        }
    }

    async fn record_group(
        &self,
        representative: &Message,
        destination: &Entity,
        topic_override: Option<i64>,
        org_result: Option<&OrganizationResult>,
        topics_created_delta: u64,
    ) -> Result<()> {
        if let Some(topic) = topic_override {
            let record = TopicAssignmentRecord {
                message_id: representative.id,
                channel_id: destination.id,
                topic_id: Some(topic),
                topic_title: None,
                category: None,
                assignment_method: AssignmentMethod::Manual,
                confidence: 1.0,
                fallback_used: false,
            };
            self.store.topics().upsert_assignment(&record).await?;
            return Ok(());
        }

        let Some(result) = org_result else {
            return Ok(());
        };

        let confidence = result
            .metadata
            .as_ref()
            .map(|m| m.confidence)
            .unwrap_or(1.0);

        if let Some(metadata) = &result.metadata {
            let extra = if metadata.extra.is_empty() {
                None
            } else {
                serde_json::to_string(&metadata.extra).ok()
            };
            let record = ContentMetadataRecord {
                message_id: representative.id,
                channel_id: destination.id,
                content_type: metadata.content_type.as_str().to_string(),
                category: metadata.category.clone(),
                subcategory: metadata.subcategory.clone(),
                file_extension: metadata.file_extension.clone(),
                file_size: metadata.file_size.map(|s| s as i64),
                mime_type: metadata.mime_type.clone(),
                duration: metadata.duration.map(i64::from),
                width: metadata.width.map(i64::from),
                height: metadata.height.map(i64::from),
                keywords: if metadata.keywords.is_empty() {
                    None
                } else {
                    Some(metadata.keywords.join(","))
                },
                classification_confidence: metadata.confidence,
                additional_metadata: extra,
            };
            self.store.topics().upsert_content_metadata(&record).await?;
        }

        let assignment = TopicAssignmentRecord {
            message_id: representative.id,
            channel_id: destination.id,
            topic_id: result.topic_id,
            topic_title: result.topic_title.clone(),
            category: result.category.clone(),
            assignment_method: if result.fallback_used {
                AssignmentMethod::Fallback
            } else {
                AssignmentMethod::Auto
            },
            confidence,
            fallback_used: result.fallback_used,
        };
        self.store.topics().upsert_assignment(&assignment).await?;

        // Accumulate today's stats for the destination channel.
        let mut delta = StatsDelta {
            messages_processed: 1,
            topics_created: topics_created_delta as i64,
            ..StatsDelta::default()
        };
        if result.success {
            delta.successful_assignments = 1;
        } else {
            delta.failed_assignments = 1;
        }
        if result.fallback_used {
            delta.fallback_used = 1;
        }
        if let Some(category) = &result.category {
            delta.categories.insert(category.clone(), 1);
        }

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        self.store
            .topics()
            .accumulate_stats(destination.id, &today, &delta)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::pool::AccountPool;
    use crate::config::{FallbackStrategy, OrganizationSettings};
    use crate::gateway::mock::{file_message, photo_message, MockGateway};
    use crate::store::open_test_store;
    use crate::types::message::EntityKind;

    fn origin_entity() -> Entity {
        Entity {
            id: -100,
            title: "Leak Watch".to_string(),
            kind: EntityKind::Channel,
        }
    }

    fn plain_destination() -> Entity {
        Entity {
            id: -200,
            title: "Archive".to_string(),
            kind: EntityKind::Channel,
        }
    }

    fn forum_destination() -> Entity {
        Entity {
            id: -200,
            title: "Archive".to_string(),
            kind: EntityKind::ForumChannel,
        }
    }

    fn fast_org(settings: &mut OrganizationSettings) {
        settings.topic_creation_cooldown_seconds = 0;
    }

    async fn harness(
        mut config: Config,
        destination: Entity,
    ) -> (
        tempfile::TempDir,
        crate::store::Store,
        Arc<MockGateway>,
        Forwarder,
    ) {
        fast_org(&mut config.topic_organization);
        let (dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        gateway.add_entity(origin_entity());
        gateway.add_entity(destination);

        let pool = Arc::new(AccountPool::new());
        pool.register(
            "main",
            "",
            Arc::clone(&gateway) as Arc<dyn TelegramGateway>,
        )
        .await;

        let forwarder = Forwarder::new(Arc::new(config), store.clone(), pool)
            .await
            .unwrap();
        (dir, store, gateway, forwarder)
    }

    fn request() -> ForwardRequest {
        ForwardRequest::new(EntityRef::Id(-100), EntityRef::Id(-200))
    }

    #[tokio::test]
    async fn test_simple_forward_no_dedupe_hit() {
        let (_dir, store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(
            -100,
            vec![
                file_message(10, 9, 1001, "a.bin", 100),
                file_message(11, 9, 1002, "b.bin", 200),
            ],
        );

        let outcome = forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.last_message_id, Some(11));
        assert_eq!(outcome.stats.messages_forwarded, 2);
        assert_eq!(outcome.stats.files_forwarded, 2);
        assert_eq!(outcome.stats.bytes_forwarded, 300);

        let forwarded = gateway.forwarded();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].message_ids, vec![10]);
        assert_eq!(forwarded[1].message_ids, vec![11]);
        assert!(forwarded.iter().all(|c| c.dest == -200 && c.from == -100));

        assert_eq!(store.hashes().count_hashes().await.unwrap(), 2);
        assert_eq!(store.hashes().inventory_count(-100).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rerun_skips_all_as_duplicates() {
        let (_dir, store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(
            -100,
            vec![
                file_message(10, 9, 1001, "a.bin", 100),
                file_message(11, 9, 1002, "b.bin", 200),
            ],
        );

        let cancel = CancellationToken::new();
        forwarder.forward(&request(), &cancel).await.unwrap();
        let second = forwarder.forward(&request(), &cancel).await.unwrap();

        assert_eq!(second.stats.messages_forwarded, 0);
        assert_eq!(second.last_message_id, None);
        // No additional deliveries happened.
        assert_eq!(gateway.forwarded().len(), 2);
        assert_eq!(store.hashes().count_hashes().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dedupe_survives_forwarder_restart() {
        let (_dir, store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(-100, vec![file_message(10, 9, 1001, "a.bin", 100)]);

        let cancel = CancellationToken::new();
        forwarder.forward(&request(), &cancel).await.unwrap();

        // A fresh forwarder over the same store sees the hash index.
        let pool = Arc::new(AccountPool::new());
        pool.register("main", "", Arc::clone(&gateway) as Arc<dyn TelegramGateway>)
            .await;
        let fresh = Forwarder::new(Arc::new(Config::default()), store.clone(), pool)
            .await
            .unwrap();
        let outcome = fresh.forward(&request(), &cancel).await.unwrap();
        assert_eq!(outcome.stats.messages_forwarded, 0);
    }

    #[tokio::test]
    async fn test_filename_groups_forward_atomically_in_part_order() {
        let mut config = Config::default();
        config.grouping.strategy = "filename".to_string();
        let (_dir, _store, gateway, forwarder) = harness(config, plain_destination()).await;
        gateway.add_messages(
            -100,
            vec![
                file_message(1, 9, 101, "a_part1.rar", 10),
                file_message(2, 9, 102, "a_part2.rar", 10),
                file_message(3, 9, 103, "b.pdf", 10),
                file_message(4, 9, 104, "a_part3.rar", 10),
                file_message(5, 9, 105, "c.zip", 10),
            ],
        );

        let outcome = forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        // Three groups delivered; forwarded ids follow group order with the
        // archive parts kept contiguous.
        assert_eq!(outcome.stats.messages_forwarded, 3);
        let order: Vec<i64> = gateway
            .forwarded()
            .iter()
            .flat_map(|c| c.message_ids.clone())
            .collect();
        assert_eq!(order, vec![1, 2, 4, 3, 5]);
    }

    #[tokio::test]
    async fn test_duplicate_group_member_skips_whole_group() {
        let mut config = Config::default();
        config.grouping.strategy = "filename".to_string();
        let (_dir, store, gateway, forwarder) = harness(config, plain_destination()).await;

        // Seed part2's content hash as already forwarded.
        gateway.set_file_content(102, b"part-two");
        gateway.add_messages(-100, vec![file_message(50, 9, 999, "other.bin", 10)]);
        let cancel = CancellationToken::new();
        forwarder.forward(&request(), &cancel).await.unwrap();

        // Hash of b"part-two" recorded out of band.
        let digest = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(b"part-two");
            format!("{:x}", hasher.finalize())
        };
        store.hashes().upsert_hash(102, &digest).await.unwrap();

        gateway.add_messages(
            -100,
            vec![
                file_message(60, 9, 101, "a_part1.rar", 10),
                file_message(61, 9, 102, "a_part2.rar", 10),
            ],
        );

        let before = gateway.forwarded().len();
        let outcome = forwarder.forward(&request(), &cancel).await.unwrap();

        // Group atomicity: neither part delivered.
        assert_eq!(gateway.forwarded().len(), before);
        assert_eq!(outcome.stats.messages_forwarded, 0);
    }

    #[tokio::test]
    async fn test_photo_routed_to_created_topic() {
        let mut config = Config::default();
        config.topic_organization.fallback_strategy = FallbackStrategy::NoTopic;
        let (_dir, store, gateway, forwarder) = harness(config, forum_destination()).await;
        gateway.add_messages(-100, vec![photo_message(21, 9)]);

        let outcome = forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let created = gateway.created_topics();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1, "📸 Photos");

        let forwarded = gateway.forwarded();
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded[0].reply_to.is_some());

        let assignment = store.topics().get_assignment(-200, 21).await.unwrap().unwrap();
        assert_eq!(assignment.assignment_method, AssignmentMethod::Auto);
        assert!(!assignment.fallback_used);
        assert_eq!(assignment.topic_title.as_deref(), Some("📸 Photos"));

        assert_eq!(outcome.stats.topics_created, 1);
        assert_eq!(outcome.stats.topic_assignments, 1);
        assert_eq!(outcome.stats.fallback_used, 0);

        let metadata = store
            .topics()
            .get_content_metadata(-200, 21)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.content_type, "photo");
        assert_eq!(metadata.category, "photos");

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let stats = store.topics().get_stats(-200, &today).await.unwrap().unwrap();
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(stats.successful_assignments, 1);
        assert_eq!(stats.topics_created, 1);
    }

    #[tokio::test]
    async fn test_fallback_to_general_topic() {
        let mut config = Config::default();
        config.topic_organization.mode = OrganizationMode::ExistingOnly;
        let (_dir, store, gateway, forwarder) = harness(config, forum_destination()).await;
        gateway.add_messages(-100, vec![photo_message(21, 9)]);

        forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        // Only the general topic was created, and the message went to it.
        let created = gateway.created_topics();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].1, "General Discussion");

        let assignment = store.topics().get_assignment(-200, 21).await.unwrap().unwrap();
        assert!(assignment.fallback_used);
        assert_eq!(assignment.assignment_method, AssignmentMethod::Fallback);
        assert_eq!(assignment.topic_title.as_deref(), Some("General Discussion"));
        assert_eq!(assignment.topic_id, Some(gateway.topics_in(-200)[0].topic_id));
    }

    #[tokio::test]
    async fn test_topic_override_wins_over_organization() {
        let mut config = Config::default();
        config.topic_organization.fallback_strategy = FallbackStrategy::NoTopic;
        let (_dir, store, gateway, forwarder) = harness(config, forum_destination()).await;
        gateway.add_messages(-100, vec![photo_message(21, 9)]);

        let mut req = request();
        req.topic_override = Some(4242);
        forwarder
            .forward(&req, &CancellationToken::new())
            .await
            .unwrap();

        // No organization ran at all.
        assert!(gateway.created_topics().is_empty());
        assert_eq!(gateway.forwarded()[0].reply_to, Some(4242));

        let assignment = store.topics().get_assignment(-200, 21).await.unwrap().unwrap();
        assert_eq!(assignment.assignment_method, AssignmentMethod::Manual);
        assert_eq!(assignment.topic_id, Some(4242));
    }

    #[tokio::test]
    async fn test_attribution_send_path() {
        let mut config = Config::default();
        config.forwarding.forward_with_attribution = true;
        let (_dir, store, gateway, forwarder) = harness(config, plain_destination()).await;

        let mut msg = file_message(30, 9, 1003, "doc.pdf", 64);
        msg.text = "original caption".to_string();
        gateway.add_messages(-100, vec![msg]);

        forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        // Re-sent with a header, not natively forwarded.
        assert!(gateway.forwarded().is_empty());
        let sent = gateway.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("Leak Watch"));
        assert!(sent[0].body.contains("user 9"));
        assert!(sent[0].body.ends_with("original caption"));
        assert_eq!(sent[0].media_message_id, Some(30));

        assert_eq!(store.topics().attribution_count(-100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_attribution_disabled_for_listed_destination() {
        let mut config = Config::default();
        config.forwarding.forward_with_attribution = true;
        config.attribution.disable_attribution_for_groups = vec![-200];
        let (_dir, store, gateway, forwarder) = harness(config, plain_destination()).await;

        let mut msg = file_message(30, 9, 1003, "doc.pdf", 64);
        msg.text = "caption".to_string();
        gateway.add_messages(-100, vec![msg]);

        forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let sent = gateway.sent();
        assert_eq!(sent[0].body, "caption");
        assert_eq!(store.topics().attribution_count(-100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_secondary_fan_out() {
        let mut config = Config::default();
        config.forwarding.secondary_unique_destination = Some("-300".to_string());
        let (_dir, _store, gateway, forwarder) = harness(config, plain_destination()).await;
        gateway.add_entity(Entity {
            id: -300,
            title: "Mirror".to_string(),
            kind: EntityKind::Channel,
        });
        gateway.add_messages(-100, vec![file_message(10, 9, 1001, "a.bin", 100)]);

        forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let destinations: Vec<i64> = gateway.forwarded().iter().map(|c| c.dest).collect();
        assert_eq!(destinations, vec![-200, -300]);
    }

    #[tokio::test]
    async fn test_saved_messages_fan_out() {
        let mut config = Config::default();
        config.forwarding.forward_to_all_saved_messages = true;
        let (_dir, _store, gateway, forwarder) = harness(config, plain_destination()).await;
        gateway.add_messages(-100, vec![file_message(10, 9, 1001, "a.bin", 100)]);

        forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        let destinations: Vec<i64> = gateway.forwarded().iter().map(|c| c.dest).collect();
        assert_eq!(destinations, vec![-200, 999_999]);
    }

    #[tokio::test]
    async fn test_flood_wait_skips_group_not_run() {
        let (_dir, store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(
            -100,
            vec![
                file_message(10, 9, 1001, "a.bin", 100),
                file_message(11, 9, 1002, "b.bin", 200),
            ],
        );
        gateway.push_forward_error(SpectraError::flood_wait(0));

        let outcome = forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        // First group hit the flood wait and was skipped; the second went
        // through and only it was recorded.
        assert_eq!(outcome.stats.messages_forwarded, 1);
        assert_eq!(outcome.last_message_id, Some(11));
        assert_eq!(store.hashes().inventory_count(-100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_permission_error_skips_group() {
        let (_dir, _store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(
            -100,
            vec![
                file_message(10, 9, 1001, "a.bin", 100),
                file_message(11, 9, 1002, "b.bin", 200),
            ],
        );
        gateway.push_forward_error(SpectraError::UserBanned { channel_id: -200 });

        let outcome = forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stats.messages_forwarded, 1);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_store_clean() {
        let (_dir, store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(-100, vec![file_message(10, 9, 1001, "a.bin", 100)]);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = forwarder.forward(&request(), &cancel).await;
        assert!(matches!(result, Err(SpectraError::CancelRequested)));
        assert_eq!(store.hashes().count_hashes().await.unwrap(), 0);
        assert_eq!(store.hashes().inventory_count(-100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resume_from_last_message_id() {
        let (_dir, _store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(
            -100,
            vec![
                file_message(10, 9, 1001, "a.bin", 100),
                file_message(11, 9, 1002, "b.bin", 200),
            ],
        );

        let mut req = request();
        req.start_message_id = Some(10);
        let outcome = forwarder
            .forward(&req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stats.messages_forwarded, 1);
        assert_eq!(gateway.forwarded()[0].message_ids, vec![11]);
    }

    #[tokio::test]
    async fn test_total_mode_continues_past_failing_channel() {
        let (_dir, store, gateway, forwarder) =
            harness(Config::default(), plain_destination()).await;
        gateway.add_messages(-100, vec![file_message(10, 9, 1001, "a.bin", 100)]);

        store.access().upsert_access("main", -100, "ok").await.unwrap();
        // This channel is unknown to the gateway and fails to resolve.
        store.access().upsert_access("main", -666, "gone").await.unwrap();

        let outcome = forwarder
            .forward_all_accessible(EntityRef::Id(-200), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.channels_processed, 1);
        assert_eq!(outcome.channels_failed, 1);
        assert_eq!(outcome.stats.messages_forwarded, 1);
    }

    #[tokio::test]
    async fn test_saved_org_config_overrides_file_config() {
        let mut config = Config::default();
        config.topic_organization.fallback_strategy = FallbackStrategy::NoTopic;
        let (_dir, store, gateway, forwarder) = harness(config, forum_destination()).await;

        // The store says organization is disabled for this destination.
        let mut saved = OrganizationSettings::default();
        saved.mode = OrganizationMode::Disabled;
        store.topics().upsert_org_config(-200, &saved).await.unwrap();

        gateway.add_messages(-100, vec![photo_message(21, 9)]);
        forwarder
            .forward(&request(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(gateway.created_topics().is_empty());
        assert_eq!(gateway.forwarded()[0].reply_to, None);
    }
}
