//! Glues the classifier and the topic manager into routing decisions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{FallbackStrategy, OrganizationMode, OrganizationSettings};
use crate::forwarding::classifier::{ContentClassifier, ContentMetadata, ContentType};
use crate::forwarding::topic_manager::TopicManager;
use crate::types::message::Message;

/// Bound on the in-memory retry queue; oldest entries drop first.
const RETRY_QUEUE_LIMIT: usize = 10_000;

/// Routing decision boundary consumed by the forwarder, keeping the
/// forwarder ↔ engine ↔ topic-manager dependency chain acyclic.
#[async_trait]
pub trait OrganizationPort: Send + Sync {
    async fn organize_message(&self, message: &Message) -> OrganizationResult;
    async fn stats_snapshot(&self) -> EngineStats;
}

/// Result of one organization attempt.
#[derive(Clone, Debug, Default)]
pub struct OrganizationResult {
    pub success: bool,
    pub topic_id: Option<i64>,
    pub topic_title: Option<String>,
    pub category: Option<String>,
    pub fallback_used: bool,
    pub metadata: Option<ContentMetadata>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub messages_processed: u64,
    pub topics_created: u64,
    pub successful_assignments: u64,
    pub failed_assignments: u64,
    pub fallback_used: u64,
    pub categories: BTreeMap<String, u64>,
}

struct EngineState {
    stats: EngineStats,
    general_topic_id: Option<i64>,
    retry_queue: VecDeque<(Message, ContentMetadata)>,
}

pub struct OrganizationEngine {
    settings: OrganizationSettings,
    classifier: ContentClassifier,
    topics: Option<Arc<TopicManager>>,
    channel_id: i64,
    state: Mutex<EngineState>,
}

impl OrganizationEngine {
    pub fn new(
        settings: OrganizationSettings,
        topics: Option<Arc<TopicManager>>,
        channel_id: i64,
    ) -> Self {
        Self {
            settings,
            classifier: ContentClassifier::new(),
            topics,
            channel_id,
            state: Mutex::new(EngineState {
                stats: EngineStats::default(),
                general_topic_id: None,
                retry_queue: VecDeque::new(),
            }),
        }
    }

    pub fn settings(&self) -> &OrganizationSettings {
        &self.settings
    }

    /// Prepare the engine: make sure the general topic exists when the
    /// fallback needs it.
    pub async fn initialize(&self) {
        if self.settings.mode == OrganizationMode::Disabled {
            debug!(channel = self.channel_id, "organization disabled");
            return;
        }
        if self.settings.fallback_strategy == FallbackStrategy::GeneralTopic {
            self.ensure_general_topic().await;
        }
        info!(
            channel = self.channel_id,
            mode = self.settings.mode.as_str(),
            strategy = self.settings.topic_strategy.as_str(),
            "organization engine ready"
        );
    }

    async fn organize_inner(&self, message: &Message) -> OrganizationResult {
        {
            let mut state = self.state.lock().await;
            state.stats.messages_processed += 1;
        }

        if self.settings.mode == OrganizationMode::Disabled {
            return OrganizationResult {
                success: true,
                ..OrganizationResult::default()
            };
        }

        let metadata = if self.settings.enable_content_analysis {
            self.classifier.classify(message, None)
        } else {
            ContentMetadata {
                content_type: ContentType::detect(message),
                category: "general".to_string(),
                subcategory: None,
                file_extension: None,
                file_size: message.file_size(),
                mime_type: None,
                duration: None,
                width: None,
                height: None,
                source_channel: None,
                keywords: Vec::new(),
                confidence: 1.0,
                extra: Default::default(),
            }
        };

        if metadata.confidence < self.settings.classification_confidence_threshold {
            warn!(
                message_id = message.id,
                confidence = metadata.confidence,
                "classification confidence below threshold"
            );
        }

        {
            let mut state = self.state.lock().await;
            *state
                .stats
                .categories
                .entry(metadata.category.clone())
                .or_insert(0) += 1;
        }

        match self.route(&metadata).await {
            Some(topic_id) => {
                let topic_title = match &self.topics {
                    Some(manager) => manager.title_of(topic_id).await,
                    None => None,
                };
                let mut state = self.state.lock().await;
                state.stats.successful_assignments += 1;
                OrganizationResult {
                    success: true,
                    topic_id: Some(topic_id),
                    topic_title,
                    category: Some(metadata.category.clone()),
                    fallback_used: false,
                    metadata: Some(metadata),
                    error: None,
                }
            }
            None => self.apply_fallback(message, metadata).await,
        }
    }

    async fn route(&self, metadata: &ContentMetadata) -> Option<i64> {
        let manager = self.topics.as_ref()?;

        match self.settings.mode {
            OrganizationMode::Disabled => None,
            OrganizationMode::ExistingOnly => {
                match manager
                    .find_existing(&metadata.category, metadata.content_type)
                    .await
                {
                    Ok(found) => found,
                    Err(err) => {
                        error!(channel = self.channel_id, error = %err, "topic lookup failed");
                        None
                    }
                }
            }
            OrganizationMode::AutoCreate => self.try_create(manager, metadata).await,
            OrganizationMode::Hybrid => match self.try_create(manager, metadata).await {
                Some(topic_id) => Some(topic_id),
                None => manager
                    .find_existing(&metadata.category, metadata.content_type)
                    .await
                    .unwrap_or_default(),
            },
        }
    }

    async fn try_create(&self, manager: &TopicManager, metadata: &ContentMetadata) -> Option<i64> {
        match manager.get_or_create_topic(metadata).await {
            Ok(topic_id) => topic_id,
            Err(err) => {
                error!(channel = self.channel_id, error = %err, "topic resolution failed");
                None
            }
        }
    }

    async fn apply_fallback(
        &self,
        message: &Message,
        metadata: ContentMetadata,
    ) -> OrganizationResult {
        let mut state = self.state.lock().await;
        state.stats.fallback_used += 1;

        match self.settings.fallback_strategy {
            FallbackStrategy::GeneralTopic => {
                let cached = state.general_topic_id;
                drop(state);

                let topic_id = match cached {
                    Some(id) => Some(id),
                    None => {
                        self.ensure_general_topic().await;
                        self.state.lock().await.general_topic_id
                    }
                };

                let mut state = self.state.lock().await;
                match topic_id {
                    Some(topic_id) => {
                        state.stats.successful_assignments += 1;
                        OrganizationResult {
                            success: true,
                            topic_id: Some(topic_id),
                            topic_title: Some(self.settings.general_topic_title.clone()),
                            category: Some(metadata.category.clone()),
                            fallback_used: true,
                            metadata: Some(metadata),
                            error: None,
                        }
                    }
                    None => {
                        state.stats.failed_assignments += 1;
                        OrganizationResult {
                            success: false,
                            fallback_used: true,
                            category: Some(metadata.category.clone()),
                            metadata: Some(metadata),
                            error: Some("general topic unavailable".to_string()),
                            ..OrganizationResult::default()
                        }
                    }
                }
            }
            FallbackStrategy::NoTopic => {
                state.stats.successful_assignments += 1;
                OrganizationResult {
                    success: true,
                    topic_id: None,
                    topic_title: None,
                    category: Some(metadata.category.clone()),
                    fallback_used: true,
                    metadata: Some(metadata),
                    error: None,
                }
            }
            FallbackStrategy::RetryOnce | FallbackStrategy::QueueForRetry => {
                state.stats.failed_assignments += 1;
                if state.retry_queue.len() >= RETRY_QUEUE_LIMIT {
                    state.retry_queue.pop_front();
                }
                state
                    .retry_queue
                    .push_back((message.clone(), metadata.clone()));
                OrganizationResult {
                    success: false,
                    fallback_used: true,
                    category: Some(metadata.category.clone()),
                    metadata: Some(metadata),
                    error: Some("queued for retry".to_string()),
                    ..OrganizationResult::default()
                }
            }
        }
    }

    async fn ensure_general_topic(&self) {
        if self.state.lock().await.general_topic_id.is_some() {
            return;
        }
        let Some(manager) = &self.topics else {
            warn!(channel = self.channel_id, "no topic manager for general topic");
            return;
        };
        match manager
            .get_or_create_named(&self.settings.general_topic_title)
            .await
        {
            Ok(Some(topic_id)) => {
                info!(channel = self.channel_id, topic_id, "general topic ready");
                self.state.lock().await.general_topic_id = Some(topic_id);
            }
            Ok(None) => warn!(channel = self.channel_id, "could not ensure general topic"),
            Err(err) => {
                error!(channel = self.channel_id, error = %err, "general topic creation failed")
            }
        }
    }

    /// Drain the retry queue, re-routing each entry. Entries that fail again
    /// are re-queued only under `queue_for_retry`; `retry_once` drops them.
    pub async fn process_retry_queue(&self) -> usize {
        let pending: Vec<(Message, ContentMetadata)> = {
            let mut state = self.state.lock().await;
            state.retry_queue.drain(..).collect()
        };
        if pending.is_empty() {
            return 0;
        }

        let requeue_failures =
            self.settings.fallback_strategy == FallbackStrategy::QueueForRetry;
        let mut processed = 0usize;

        for (message, metadata) in pending {
            match self.route(&metadata).await {
                Some(topic_id) => {
                    processed += 1;
                    let mut state = self.state.lock().await;
                    state.stats.successful_assignments += 1;
                    debug!(message_id = message.id, topic_id, "retry succeeded");
                }
                None if requeue_failures => {
                    let mut state = self.state.lock().await;
                    if state.retry_queue.len() >= RETRY_QUEUE_LIMIT {
                        state.retry_queue.pop_front();
                    }
                    state.retry_queue.push_back((message, metadata));
                }
                None => {}
            }
        }

        let remaining = self.state.lock().await.retry_queue.len();
        info!(processed, remaining, "retry queue drained");
        processed
    }

    pub async fn retry_queue_len(&self) -> usize {
        self.state.lock().await.retry_queue.len()
    }

    pub async fn reset_stats(&self) {
        self.state.lock().await.stats = EngineStats::default();
    }
}

#[async_trait]
impl OrganizationPort for OrganizationEngine {
    async fn organize_message(&self, message: &Message) -> OrganizationResult {
        self.organize_inner(message).await
    }

    async fn stats_snapshot(&self) -> EngineStats {
        let mut stats = self.state.lock().await.stats.clone();
        if let Some(manager) = &self.topics {
            stats.topics_created = manager.topics_created();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::TopicStrategy;
    use crate::gateway::mock::{photo_message, MockGateway};
    use crate::store::open_test_store;
    use crate::types::error::SpectraError;
    use crate::types::message::{Entity, EntityKind};
    use crate::types::topic::TopicSnapshot;

    fn forum() -> Entity {
        Entity {
            id: -200,
            title: "archive".to_string(),
            kind: EntityKind::ForumChannel,
        }
    }

    async fn engine_with(
        gateway: Arc<MockGateway>,
        store: &crate::store::Store,
        settings: OrganizationSettings,
    ) -> OrganizationEngine {
        let manager = Arc::new(TopicManager::new(
            gateway,
            store.topics(),
            forum(),
            settings.topic_strategy,
            Duration::ZERO,
            settings.max_topics_per_channel,
        ));
        OrganizationEngine::new(settings, Some(manager), -200)
    }

    #[tokio::test]
    async fn test_disabled_mode_succeeds_without_topic() {
        let engine = OrganizationEngine::new(
            OrganizationSettings {
                mode: OrganizationMode::Disabled,
                ..OrganizationSettings::default()
            },
            None,
            -200,
        );

        let result = engine.organize_message(&photo_message(1, 9)).await;
        assert!(result.success);
        assert!(result.topic_id.is_none());
        assert!(!result.fallback_used);
    }

    #[tokio::test]
    async fn test_auto_create_routes_photo_to_photo_topic() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            fallback_strategy: FallbackStrategy::NoTopic,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let result = engine.organize_message(&photo_message(1, 9)).await;

        assert!(result.success);
        assert!(result.topic_id.is_some());
        assert_eq!(result.topic_title.as_deref(), Some("📸 Photos"));
        assert_eq!(result.category.as_deref(), Some("photos"));
        assert!(!result.fallback_used);

        let stats = engine.stats_snapshot().await;
        assert_eq!(stats.messages_processed, 1);
        assert_eq!(stats.successful_assignments, 1);
        assert_eq!(stats.topics_created, 1);
        assert_eq!(stats.categories.get("photos"), Some(&1));
    }

    #[tokio::test]
    async fn test_existing_only_uses_present_topic() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        gateway.add_topic(
            -200,
            TopicSnapshot {
                topic_id: 31,
                title: "📸 Photos".to_string(),
                icon_color: 0,
                icon_emoji_id: None,
                message_count: 0,
                last_activity_at: None,
            },
        );
        let settings = OrganizationSettings {
            mode: OrganizationMode::ExistingOnly,
            fallback_strategy: FallbackStrategy::NoTopic,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let result = engine.organize_message(&photo_message(1, 9)).await;
        assert!(result.success);
        assert_eq!(result.topic_id, Some(31));
        assert!(gateway.created_topics().is_empty());
    }

    #[tokio::test]
    async fn test_existing_only_falls_back_to_general_topic() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            mode: OrganizationMode::ExistingOnly,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let result = engine.organize_message(&photo_message(1, 9)).await;

        assert!(result.success);
        assert!(result.fallback_used);
        assert_eq!(result.topic_title.as_deref(), Some("General Discussion"));
        assert!(result.topic_id.is_some());
        // Only the general topic was created.
        assert_eq!(gateway.created_topics().len(), 1);
        assert_eq!(gateway.created_topics()[0].1, "General Discussion");
    }

    #[tokio::test]
    async fn test_no_topic_fallback_succeeds_bare() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            mode: OrganizationMode::ExistingOnly,
            fallback_strategy: FallbackStrategy::NoTopic,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let result = engine.organize_message(&photo_message(1, 9)).await;
        assert!(result.success);
        assert!(result.topic_id.is_none());
        assert!(result.fallback_used);
    }

    #[tokio::test]
    async fn test_queue_for_retry_fails_and_queues() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            mode: OrganizationMode::ExistingOnly,
            fallback_strategy: FallbackStrategy::QueueForRetry,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let result = engine.organize_message(&photo_message(1, 9)).await;
        assert!(!result.success);
        assert!(result.fallback_used);
        assert_eq!(engine.retry_queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_retry_queue_drains_when_topic_appears() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            mode: OrganizationMode::ExistingOnly,
            fallback_strategy: FallbackStrategy::QueueForRetry,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        engine.organize_message(&photo_message(1, 9)).await;
        assert_eq!(engine.retry_queue_len().await, 1);

        // The missing topic shows up and the retry drains.
        gateway.add_topic(
            -200,
            TopicSnapshot {
                topic_id: 44,
                title: "📸 Photos".to_string(),
                icon_color: 0,
                icon_emoji_id: None,
                message_count: 0,
                last_activity_at: None,
            },
        );
        assert_eq!(engine.process_retry_queue().await, 1);
        assert_eq!(engine.retry_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_hybrid_falls_back_to_existing_on_create_failure() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        // Creation always refused; an existing topic is still found.
        gateway.push_create_topic_error(SpectraError::AdminRequired { channel_id: -200 });
        gateway.add_topic(
            -200,
            TopicSnapshot {
                topic_id: 52,
                title: "Old Photos".to_string(),
                icon_color: 0,
                icon_emoji_id: None,
                message_count: 0,
                last_activity_at: None,
            },
        );
        store
            .topics()
            .upsert_topic(&crate::types::topic::ForumTopicRecord {
                channel_id: -200,
                topic_id: 52,
                title: "Old Photos".to_string(),
                icon_color: 0,
                icon_emoji_id: None,
                category: Some("photos".to_string()),
                subcategory: None,
                description: None,
                message_count: 0,
                created_at: 0,
                last_activity_at: None,
                is_active: true,
            })
            .await
            .unwrap();

        let settings = OrganizationSettings {
            mode: OrganizationMode::Hybrid,
            fallback_strategy: FallbackStrategy::NoTopic,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let result = engine.organize_message(&photo_message(1, 9)).await;
        assert!(result.success);
        assert_eq!(result.topic_id, Some(52));
        assert!(!result.fallback_used);
    }

    #[tokio::test]
    async fn test_low_confidence_still_routes() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            classification_confidence_threshold: 1.0,
            fallback_strategy: FallbackStrategy::NoTopic,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        // Confidence equals 1.0 for rule hits, so use a message that hits no
        // rule and keeps confidence at 1.0 anyway; the threshold warning is
        // informational and routing proceeds.
        let result = engine.organize_message(&photo_message(1, 9)).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_general_topic_reused_across_fallbacks() {
        let (_dir, store) = open_test_store().await;
        let gateway = Arc::new(MockGateway::new());
        let settings = OrganizationSettings {
            mode: OrganizationMode::ExistingOnly,
            ..OrganizationSettings::default()
        };
        let engine = engine_with(Arc::clone(&gateway), &store, settings).await;

        let first = engine.organize_message(&photo_message(1, 9)).await;
        let second = engine.organize_message(&photo_message(2, 9)).await;

        assert_eq!(first.topic_id, second.topic_id);
        assert_eq!(gateway.created_topics().len(), 1);

        let stats = engine.stats_snapshot().await;
        assert_eq!(stats.messages_processed, 2);
        assert_eq!(stats.fallback_used, 2);
    }
}
