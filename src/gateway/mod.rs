//! Abstract boundary to the Telegram network.
//!
//! The engine never talks to the wire directly: every component consumes the
//! [`TelegramGateway`] trait and a deployment links an adapter that maps the
//! operations onto a real client library. All operations are cancellable by
//! dropping the future and report failures through the engine error taxonomy.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::types::error::{Result, SpectraError};
use crate::types::message::{Entity, EntityRef, Message, MessageRef};
use crate::types::topic::TopicSnapshot;

#[cfg(test)]
pub(crate) mod mock;

/// Options for a message iteration request.
#[derive(Clone, Debug, Default)]
pub struct FetchOptions {
    /// Only messages with id strictly greater than this are returned.
    pub min_id: Option<i64>,
    /// Restrict iteration to one forum topic.
    pub topic_id: Option<i64>,
    /// Drop messages without media at the gateway.
    pub media_only: bool,
    /// Ascending id order when set; the natural wire order is descending.
    pub reverse: bool,
    pub limit: Option<usize>,
}

/// A one-shot, finite, lazy stream of messages. Not restartable.
pub type MessageStream = BoxStream<'static, Result<Message>>;

/// One page of a forum-topic listing.
#[derive(Clone, Debug)]
pub struct TopicPage {
    pub topics: Vec<TopicSnapshot>,
    pub next_cursor: Option<String>,
}

/// Parameters for creating a forum topic.
#[derive(Clone, Debug)]
pub struct CreateTopicRequest {
    pub title: String,
    pub icon_color: u32,
    pub icon_emoji_id: Option<i64>,
    /// Client-generated salt to deduplicate retried RPCs.
    pub random_id: i64,
}

#[async_trait]
pub trait TelegramGateway: Send + Sync {
    async fn resolve_entity(&self, reference: &EntityRef) -> Result<Entity>;

    async fn iter_messages(&self, entity: &Entity, opts: FetchOptions) -> Result<MessageStream>;

    async fn get_message(&self, entity: &Entity, message_id: i64) -> Result<Option<Message>>;

    /// Send a new message. `media_from` re-attaches the media of an existing
    /// message, which is how attributed re-sends keep their files.
    async fn send_message(
        &self,
        dest: &Entity,
        body: &str,
        media_from: Option<&Message>,
        reply_to: Option<i64>,
    ) -> Result<MessageRef>;

    async fn forward_messages(
        &self,
        dest: &Entity,
        from: &Entity,
        message_ids: &[i64],
        reply_to: Option<i64>,
    ) -> Result<Vec<MessageRef>>;

    async fn delete_messages(&self, entity: &Entity, message_ids: &[i64]) -> Result<()>;

    /// Download the media of a message to `to_path`, returning bytes written.
    async fn download_media(&self, message: &Message, to_path: &Path) -> Result<u64>;

    async fn list_forum_topics(&self, channel: &Entity, cursor: Option<String>)
        -> Result<TopicPage>;

    /// Returns the new topic id. Fails with `TopicExists`, `AdminRequired` or
    /// `FloodWait`.
    async fn create_forum_topic(
        &self,
        channel: &Entity,
        request: &CreateTopicRequest,
    ) -> Result<i64>;

    /// Enumerate the dialogs visible to this session. Used by the
    /// channel-access indexer.
    async fn iter_dialogs(&self) -> Result<Vec<Entity>>;

    /// The session's own Saved Messages chat.
    async fn saved_messages(&self) -> Result<Entity>;
}

/// Decorator applying a per-call deadline to every gateway operation.
/// Timeouts surface as `Transient`, per the engine's propagation policy.
pub struct TimeoutGateway {
    inner: Arc<dyn TelegramGateway>,
    deadline: Duration,
}

impl TimeoutGateway {
    pub fn new(inner: Arc<dyn TelegramGateway>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    /// The §5 default of 30 seconds per gateway call.
    pub fn with_default_deadline(inner: Arc<dyn TelegramGateway>) -> Self {
        Self::new(inner, Duration::from_secs(30))
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(SpectraError::transient(format!(
                "gateway call exceeded {}s deadline",
                self.deadline.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl TelegramGateway for TimeoutGateway {
    async fn resolve_entity(&self, reference: &EntityRef) -> Result<Entity> {
        self.bounded(self.inner.resolve_entity(reference)).await
    }

    async fn iter_messages(&self, entity: &Entity, opts: FetchOptions) -> Result<MessageStream> {
        use futures::StreamExt;

        let deadline = self.deadline;
        let mut inner = self.bounded(self.inner.iter_messages(entity, opts)).await?;

        // The deadline also applies per item: a stalled stream surfaces one
        // `Transient` and ends.
        let stream = async_stream::stream! {
            loop {
                match tokio::time::timeout(deadline, inner.next()).await {
                    Ok(Some(item)) => yield item,
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(SpectraError::transient(format!(
                            "message stream stalled past {}s",
                            deadline.as_secs()
                        )));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn get_message(&self, entity: &Entity, message_id: i64) -> Result<Option<Message>> {
        self.bounded(self.inner.get_message(entity, message_id)).await
    }

    async fn send_message(
        &self,
        dest: &Entity,
        body: &str,
        media_from: Option<&Message>,
        reply_to: Option<i64>,
    ) -> Result<MessageRef> {
        self.bounded(self.inner.send_message(dest, body, media_from, reply_to))
            .await
    }

    async fn forward_messages(
        &self,
        dest: &Entity,
        from: &Entity,
        message_ids: &[i64],
        reply_to: Option<i64>,
    ) -> Result<Vec<MessageRef>> {
        self.bounded(self.inner.forward_messages(dest, from, message_ids, reply_to))
            .await
    }

    async fn delete_messages(&self, entity: &Entity, message_ids: &[i64]) -> Result<()> {
        self.bounded(self.inner.delete_messages(entity, message_ids))
            .await
    }

    async fn download_media(&self, message: &Message, to_path: &Path) -> Result<u64> {
        self.bounded(self.inner.download_media(message, to_path)).await
    }

    async fn list_forum_topics(
        &self,
        channel: &Entity,
        cursor: Option<String>,
    ) -> Result<TopicPage> {
        self.bounded(self.inner.list_forum_topics(channel, cursor))
            .await
    }

    async fn create_forum_topic(
        &self,
        channel: &Entity,
        request: &CreateTopicRequest,
    ) -> Result<i64> {
        self.bounded(self.inner.create_forum_topic(channel, request))
            .await
    }

    async fn iter_dialogs(&self) -> Result<Vec<Entity>> {
        self.bounded(self.inner.iter_dialogs()).await
    }

    async fn saved_messages(&self) -> Result<Entity> {
        self.bounded(self.inner.saved_messages()).await
    }
}
