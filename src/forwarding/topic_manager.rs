//! Forum topic resolution and creation for a destination channel.
//!
//! One manager owns one channel: it caches that channel's topics (bounded
//! LRU with per-entry TTL), mirrors them into the state store, and creates
//! missing topics through the gateway under a per-channel minimum creation
//! interval.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::TopicStrategy;
use crate::forwarding::classifier::{ContentMetadata, ContentType};
use crate::gateway::{CreateTopicRequest, TelegramGateway, TopicPage};
use crate::store::now_unix;
use crate::store::TopicStore;
use crate::types::error::{Result, SpectraError};
use crate::types::message::Entity;
use crate::types::topic::{ForumTopicRecord, TopicSnapshot};

/// Default topic templates for the content-type strategy.
const CONTENT_TYPE_TOPICS: &[(ContentType, &str, u32)] = &[
    (ContentType::Photo, "📸 Photos", 0x3498db),
    (ContentType::Video, "🎬 Videos", 0xe74c3c),
    (ContentType::Document, "📄 Documents", 0xf39c12),
    (ContentType::Audio, "🎵 Audio", 0x9b59b6),
    (ContentType::Voice, "🎤 Voice Messages", 0x1abc9c),
    (ContentType::Sticker, "😄 Stickers", 0xf1c40f),
    (ContentType::Animation, "🎭 GIFs", 0x34495e),
    (ContentType::Contact, "👥 Contacts", 0x95a5a6),
    (ContentType::Location, "📍 Locations", 0x27ae60),
    (ContentType::Poll, "📊 Polls", 0x8e44ad),
    (ContentType::Game, "🎮 Games", 0xe67e22),
];

const GENERIC_TOPIC_COLOR: u32 = 0x95a5a6;
const DEFAULT_TOPIC_COLOR: u32 = 0x3498db;

/// A topic the manager intends to use, before it is known to exist.
#[derive(Clone, Debug)]
pub struct TopicCandidate {
    pub title: String,
    pub icon_color: u32,
    pub icon_emoji_id: Option<i64>,
    pub category: String,
}

/// Typed conditions attached to a topic creation rule.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicRuleConditions {
    pub categories: Vec<String>,
    pub content_types: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicCreationRule {
    pub name: String,
    pub strategy: TopicStrategy,
    /// Comma-separated match list, or `*` for any.
    pub pattern: String,
    /// Template with `{content_type}`, `{category}`, `{extension}`,
    /// `{source_channel}`, `{date}`, `{week}`, `{month}`, `{year}`.
    pub title_template: String,
    pub icon_color: u32,
    #[serde(default)]
    pub icon_emoji_id: Option<i64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: TopicRuleConditions,
}

#[derive(Clone, Debug)]
pub struct CachedTopic {
    pub topic_id: i64,
    pub title: String,
    pub icon_color: u32,
    pub icon_emoji_id: Option<i64>,
    pub category: Option<String>,
}

struct CacheSlot {
    topic: CachedTopic,
    expires_at: Instant,
    tick: u64,
}

/// Bounded LRU with per-entry TTL. Amortized O(1) get/put: recency is a
/// generation queue, stale queue entries are discarded lazily on eviction.
pub struct TopicCache {
    max_size: usize,
    ttl: Duration,
    slots: HashMap<String, CacheSlot>,
    recency: VecDeque<(String, u64)>,
    clock: u64,
}

impl TopicCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            slots: HashMap::new(),
            recency: VecDeque::new(),
            clock: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<CachedTopic> {
        let now = Instant::now();
        let expired = match self.slots.get(key) {
            Some(slot) => slot.expires_at <= now,
            None => return None,
        };
        if expired {
            self.slots.remove(key);
            return None;
        }

        self.clock += 1;
        let tick = self.clock;
        self.recency.push_back((key.to_string(), tick));
        let slot = self.slots.get_mut(key)?;
        slot.tick = tick;
        Some(slot.topic.clone())
    }

    pub fn put(&mut self, key: String, topic: CachedTopic) {
        self.clock += 1;
        let tick = self.clock;
        self.recency.push_back((key.clone(), tick));
        self.slots.insert(
            key,
            CacheSlot {
                topic,
                expires_at: Instant::now() + self.ttl,
                tick,
            },
        );
        while self.slots.len() > self.max_size {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((key, tick)) = self.recency.pop_front() {
            let current = match self.slots.get(&key) {
                Some(slot) => slot.tick,
                None => continue,
            };
            if current == tick {
                self.slots.remove(&key);
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.recency.clear();
    }

    /// First live entry whose category matches.
    pub fn find_by_category(&mut self, category: &str) -> Option<CachedTopic> {
        let now = Instant::now();
        let mut found: Option<(i64, CachedTopic)> = None;
        for slot in self.slots.values() {
            if slot.expires_at <= now {
                continue;
            }
            if slot.topic.category.as_deref() == Some(category) {
                match &found {
                    Some((best_id, _)) if *best_id <= slot.topic.topic_id => {}
                    _ => found = Some((slot.topic.topic_id, slot.topic.clone())),
                }
            }
        }
        found.map(|(_, topic)| topic)
    }
}

struct CreationState {
    last_creation: Option<Instant>,
}

pub struct TopicManager {
    gateway: Arc<dyn TelegramGateway>,
    store: TopicStore,
    channel: Entity,
    strategy: TopicStrategy,
    rules: Vec<TopicCreationRule>,
    cache: Mutex<TopicCache>,
    creation: Mutex<CreationState>,
    min_creation_interval: Duration,
    max_topics: u32,
    topics_created: AtomicU64,
}

impl TopicManager {
    pub fn new(
        gateway: Arc<dyn TelegramGateway>,
        store: TopicStore,
        channel: Entity,
        strategy: TopicStrategy,
        cooldown: Duration,
        max_topics: u32,
    ) -> Self {
        Self {
            gateway,
            store,
            channel,
            strategy,
            rules: Vec::new(),
            cache: Mutex::new(TopicCache::new(1000, Duration::from_secs(24 * 3600))),
            creation: Mutex::new(CreationState { last_creation: None }),
            min_creation_interval: cooldown,
            max_topics,
            topics_created: AtomicU64::new(0),
        }
    }

    pub fn channel_id(&self) -> i64 {
        self.channel.id
    }

    pub fn topics_created(&self) -> u64 {
        self.topics_created.load(Ordering::Relaxed)
    }

    pub fn add_rule(&mut self, rule: TopicCreationRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// Load existing topics into the cache and the store mirror. Missing
    /// permissions (or a non-forum destination) degrade gracefully: the
    /// cache simply starts cold.
    pub async fn initialize(&self) -> usize {
        let mut cursor = None;
        let mut loaded = 0usize;
        loop {
            let page = match self
                .gateway
                .list_forum_topics(&self.channel, cursor.clone())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        channel = self.channel.id,
                        error = %err,
                        "could not list topics (destination may not be a forum)"
                    );
                    return loaded;
                }
            };

            for snapshot in &page.topics {
                self.remember(snapshot, None).await;
                loaded += 1;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(channel = self.channel.id, topics = loaded, "topic cache primed");
        loaded
    }

    /// Resolve (or create) the topic for classified content.
    pub async fn get_or_create_topic(&self, metadata: &ContentMetadata) -> Result<Option<i64>> {
        let candidate = self.determine_candidate(metadata);
        self.resolve_candidate(candidate).await
    }

    /// Resolve (or create) a topic by explicit title. Used for the general
    /// fallback topic and operator-driven creation.
    pub async fn get_or_create_named(&self, title: &str) -> Result<Option<i64>> {
        self.resolve_candidate(TopicCandidate {
            title: title.to_string(),
            icon_color: GENERIC_TOPIC_COLOR,
            icon_emoji_id: None,
            category: "general".to_string(),
        })
        .await
    }

    /// Look up an existing topic for a category without ever creating one.
    pub async fn find_existing(
        &self,
        category: &str,
        content_type: ContentType,
    ) -> Result<Option<i64>> {
        if let Some(topic) = self.cache.lock().await.find_by_category(category) {
            return Ok(Some(topic.topic_id));
        }

        let stored = self.store.topics_by_category(self.channel.id, category).await?;
        if let Some(record) = stored.first() {
            return Ok(Some(record.topic_id));
        }

        // The default template title for this content type may exist even if
        // its category was never recorded.
        if let Some((_, title, _)) = CONTENT_TYPE_TOPICS
            .iter()
            .find(|(ct, _, _)| *ct == content_type)
        {
            if let Some(topic) = self.cache.lock().await.get(&self.title_key(title)) {
                return Ok(Some(topic.topic_id));
            }
            if let Some(found) = self.find_by_listing(title).await? {
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    pub async fn title_of(&self, topic_id: i64) -> Option<String> {
        if let Some(topic) = self.cache.lock().await.get(&self.id_key(topic_id)) {
            return Some(topic.title);
        }
        match self.store.get_topic(self.channel.id, topic_id).await {
            Ok(record) => record.map(|r| r.title),
            Err(_) => None,
        }
    }

    pub async fn cached_topics(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Interface for operator-initiated maintenance. Listing works; actual
    /// deletion stays with the operator.
    pub async fn cleanup_empty_topics(&self, min_age: Duration) -> Result<u64> {
        let empty = self
            .store
            .empty_topics(self.channel.id, (min_age.as_secs() / 3600) as i64)
            .await?;
        if !empty.is_empty() {
            info!(
                channel = self.channel.id,
                count = empty.len(),
                "empty topics eligible for cleanup"
            );
        }
        Ok(0)
    }

    fn determine_candidate(&self, metadata: &ContentMetadata) -> TopicCandidate {
        for rule in &self.rules {
            if let Some(candidate) = self.apply_rule(rule, metadata) {
                return candidate;
            }
        }
        self.default_candidate(metadata)
    }

    fn apply_rule(
        &self,
        rule: &TopicCreationRule,
        metadata: &ContentMetadata,
    ) -> Option<TopicCandidate> {
        if !self.conditions_met(&rule.conditions, metadata) {
            return None;
        }

        let matched = match rule.strategy {
            TopicStrategy::ContentType => {
                pattern_matches(&rule.pattern, metadata.content_type.as_str())
            }
            TopicStrategy::FileExtension => metadata
                .file_extension
                .as_deref()
                .map(|ext| pattern_matches(&rule.pattern, ext))
                .unwrap_or(false),
            TopicStrategy::SourceChannel => metadata
                .source_channel
                .as_deref()
                .map(|source| pattern_matches(&rule.pattern, source))
                .unwrap_or(false),
            TopicStrategy::DateBased => true,
            TopicStrategy::CustomRules | TopicStrategy::Hybrid => {
                pattern_matches(&rule.pattern, &metadata.category)
            }
        };
        if !matched {
            return None;
        }

        Some(TopicCandidate {
            title: render_template(&rule.title_template, metadata),
            icon_color: rule.icon_color,
            icon_emoji_id: rule.icon_emoji_id,
            category: rule.name.clone(),
        })
    }

    fn conditions_met(&self, conditions: &TopicRuleConditions, metadata: &ContentMetadata) -> bool {
        if !conditions.categories.is_empty()
            && !conditions.categories.contains(&metadata.category)
        {
            return false;
        }
        if !conditions.content_types.is_empty()
            && !conditions
                .content_types
                .iter()
                .any(|ct| ct == metadata.content_type.as_str())
        {
            return false;
        }
        if let Some(min) = conditions.min_size {
            if metadata.file_size.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(max) = conditions.max_size {
            if metadata.file_size.unwrap_or(u64::MAX) > max {
                return false;
            }
        }
        true
    }

    fn default_candidate(&self, metadata: &ContentMetadata) -> TopicCandidate {
        match self.strategy {
            TopicStrategy::ContentType => {
                if let Some((_, title, color)) = CONTENT_TYPE_TOPICS
                    .iter()
                    .find(|(ct, _, _)| *ct == metadata.content_type)
                {
                    return TopicCandidate {
                        title: (*title).to_string(),
                        icon_color: *color,
                        icon_emoji_id: None,
                        category: metadata.content_type.as_str().to_string(),
                    };
                }
                self.generic_candidate()
            }
            TopicStrategy::DateBased => TopicCandidate {
                title: format!("{} - Daily Archive", today()),
                icon_color: DEFAULT_TOPIC_COLOR,
                icon_emoji_id: None,
                category: "date_based".to_string(),
            },
            _ => self.generic_candidate(),
        }
    }

    fn generic_candidate(&self) -> TopicCandidate {
        TopicCandidate {
            title: format!("General - {}", today()),
            icon_color: GENERIC_TOPIC_COLOR,
            icon_emoji_id: None,
            category: "fallback".to_string(),
        }
    }

    async fn resolve_candidate(&self, candidate: TopicCandidate) -> Result<Option<i64>> {
        if let Some(topic) = self.cache.lock().await.get(&self.title_key(&candidate.title)) {
            debug!(title = %candidate.title, topic_id = topic.topic_id, "topic cache hit");
            return Ok(Some(topic.topic_id));
        }

        if let Some(found) = self.find_by_listing(&candidate.title).await? {
            return Ok(Some(found));
        }

        self.create_topic(candidate).await
    }

    async fn find_by_listing(&self, title: &str) -> Result<Option<i64>> {
        let mut cursor = None;
        loop {
            let page: TopicPage = match self
                .gateway
                .list_forum_topics(&self.channel, cursor.clone())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(channel = self.channel.id, error = %err, "topic listing failed");
                    return Ok(None);
                }
            };

            if let Some(snapshot) = page.topics.iter().find(|t| t.title == title) {
                self.remember(snapshot, None).await;
                return Ok(Some(snapshot.topic_id));
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    async fn create_topic(&self, candidate: TopicCandidate) -> Result<Option<i64>> {
        let active = self.store.topics_by_channel(self.channel.id, true).await?;
        if active.len() as u32 >= self.max_topics {
            warn!(
                channel = self.channel.id,
                limit = self.max_topics,
                "topic limit reached, not creating"
            );
            return Ok(None);
        }

        // Serializes creations for this channel and enforces the minimum
        // interval between them.
        let mut creation = self.creation.lock().await;
        if let Some(last) = creation.last_creation {
            let elapsed = last.elapsed();
            if elapsed < self.min_creation_interval {
                let wait = self.min_creation_interval - elapsed;
                info!(
                    channel = self.channel.id,
                    wait_ms = wait.as_millis() as u64,
                    "pacing topic creation"
                );
                tokio::time::sleep(wait).await;
            }
        }

        let request = CreateTopicRequest {
            title: candidate.title.clone(),
            icon_color: candidate.icon_color,
            icon_emoji_id: candidate.icon_emoji_id,
            random_id: uuid::Uuid::new_v4().as_u128() as i64,
        };

        // Soft deadline on the creation RPC itself; flood waits extend it.
        const CREATE_DEADLINE: Duration = Duration::from_secs(15);

        let mut retried = false;
        loop {
            let attempt = tokio::time::timeout(
                CREATE_DEADLINE,
                self.gateway.create_forum_topic(&self.channel, &request),
            )
            .await
            .unwrap_or_else(|_| Err(SpectraError::transient("topic creation timed out")));
            match attempt {
                Ok(topic_id) => {
                    creation.last_creation = Some(Instant::now());
                    drop(creation);

                    let snapshot = TopicSnapshot {
                        topic_id,
                        title: candidate.title.clone(),
                        icon_color: candidate.icon_color,
                        icon_emoji_id: candidate.icon_emoji_id,
                        message_count: 0,
                        last_activity_at: None,
                    };
                    self.remember(&snapshot, Some(candidate.category.clone())).await;
                    self.topics_created.fetch_add(1, Ordering::Relaxed);
                    info!(
                        channel = self.channel.id,
                        topic_id,
                        title = %candidate.title,
                        "created topic"
                    );
                    return Ok(Some(topic_id));
                }
                Err(SpectraError::FloodWait { seconds }) if !retried => {
                    retried = true;
                    warn!(
                        channel = self.channel.id,
                        seconds, "flood wait on topic creation, retrying once"
                    );
                    tokio::time::sleep(Duration::from_secs(seconds + 1)).await;
                }
                Err(SpectraError::FloodWait { seconds }) => {
                    warn!(
                        channel = self.channel.id,
                        seconds, "repeated flood wait, giving up on topic creation"
                    );
                    return Ok(None);
                }
                Err(SpectraError::TopicExists { .. }) => {
                    drop(creation);
                    return self.find_by_listing(&candidate.title).await;
                }
                Err(err) if err.is_permission_denied() => {
                    error!(
                        channel = self.channel.id,
                        error = %err,
                        "cannot create topics in destination"
                    );
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn remember(&self, snapshot: &TopicSnapshot, category: Option<String>) {
        let cached = CachedTopic {
            topic_id: snapshot.topic_id,
            title: snapshot.title.clone(),
            icon_color: snapshot.icon_color,
            icon_emoji_id: snapshot.icon_emoji_id,
            category: category.clone(),
        };
        {
            let mut cache = self.cache.lock().await;
            cache.put(self.id_key(snapshot.topic_id), cached.clone());
            cache.put(self.title_key(&snapshot.title), cached);
        }

        let record = ForumTopicRecord {
            channel_id: self.channel.id,
            topic_id: snapshot.topic_id,
            title: snapshot.title.clone(),
            icon_color: snapshot.icon_color,
            icon_emoji_id: snapshot.icon_emoji_id,
            category,
            subcategory: None,
            description: None,
            message_count: snapshot.message_count,
            created_at: now_unix(),
            last_activity_at: snapshot.last_activity_at,
            is_active: true,
        };
        if let Err(err) = self.store.upsert_topic(&record).await {
            warn!(
                channel = self.channel.id,
                topic_id = snapshot.topic_id,
                error = %err,
                "could not mirror topic into store"
            );
        }
    }

    fn id_key(&self, topic_id: i64) -> String {
        format!("{}:{}", self.channel.id, topic_id)
    }

    fn title_key(&self, title: &str) -> String {
        format!("{}:title:{}", self.channel.id, title)
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern.split(',').any(|p| p.trim() == value)
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn render_template(template: &str, metadata: &ContentMetadata) -> String {
    let now = chrono::Utc::now();
    let mut rendered = template.to_string();
    for (placeholder, value) in [
        ("{content_type}", metadata.content_type.as_str().to_string()),
        ("{category}", metadata.category.clone()),
        (
            "{extension}",
            metadata.file_extension.clone().unwrap_or_default(),
        ),
        (
            "{source_channel}",
            metadata.source_channel.clone().unwrap_or_default(),
        ),
        ("{date}", now.format("%Y-%m-%d").to_string()),
        ("{week}", now.format("%U").to_string()),
        ("{month}", now.format("%B").to_string()),
        ("{year}", now.format("%Y").to_string()),
    ] {
        rendered = rendered.replace(placeholder, &value);
    }
    rendered
}
