//! Scripted in-memory gateway used by the test suites.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;

use crate::gateway::{CreateTopicRequest, FetchOptions, MessageStream, TelegramGateway, TopicPage};
use crate::types::error::{Result, SpectraError};
use crate::types::message::{
    Entity, EntityKind, EntityRef, FileInfo, MediaInfo, MediaKind, Message, MessageRef,
};
use crate::types::topic::TopicSnapshot;

#[derive(Clone, Debug)]
pub struct ForwardCall {
    pub dest: i64,
    pub from: i64,
    pub message_ids: Vec<i64>,
    pub reply_to: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct SendCall {
    pub dest: i64,
    pub body: String,
    pub media_message_id: Option<i64>,
    pub reply_to: Option<i64>,
}

#[derive(Default)]
struct State {
    entities: Vec<Entity>,
    usernames: HashMap<String, i64>,
    messages: HashMap<i64, Vec<Message>>,
    topics: HashMap<i64, Vec<TopicSnapshot>>,
    next_topic_id: i64,
    next_delivery_id: i64,
    create_topic_errors: VecDeque<SpectraError>,
    forward_errors: VecDeque<SpectraError>,
    send_errors: VecDeque<SpectraError>,
    download_failures: HashSet<i64>,
    file_contents: HashMap<i64, Vec<u8>>,
    dialogs: Vec<Entity>,
    saved: Option<Entity>,
    resolve_delay: Option<Duration>,
    forwarded: Vec<ForwardCall>,
    sent: Vec<SendCall>,
    deleted: Vec<(i64, Vec<i64>)>,
    created_topics: Vec<(i64, String)>,
}

pub struct MockGateway {
    state: Mutex<State>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_topic_id: 100,
                next_delivery_id: 5000,
                ..State::default()
            }),
        }
    }

    pub fn add_entity(&self, entity: Entity) {
        self.state.lock().unwrap().entities.push(entity);
    }

    pub fn add_username(&self, username: &str, id: i64) {
        self.state
            .lock()
            .unwrap()
            .usernames
            .insert(username.to_string(), id);
    }

    pub fn add_messages(&self, entity_id: i64, mut messages: Vec<Message>) {
        let mut state = self.state.lock().unwrap();
        state
            .messages
            .entry(entity_id)
            .or_default()
            .append(&mut messages);
    }

    pub fn add_topic(&self, channel_id: i64, snapshot: TopicSnapshot) {
        self.state
            .lock()
            .unwrap()
            .topics
            .entry(channel_id)
            .or_default()
            .push(snapshot);
    }

    pub fn push_create_topic_error(&self, err: SpectraError) {
        self.state.lock().unwrap().create_topic_errors.push_back(err);
    }

    pub fn push_forward_error(&self, err: SpectraError) {
        self.state.lock().unwrap().forward_errors.push_back(err);
    }

    pub fn push_send_error(&self, err: SpectraError) {
        self.state.lock().unwrap().send_errors.push_back(err);
    }

    pub fn fail_download(&self, file_id: i64) {
        self.state.lock().unwrap().download_failures.insert(file_id);
    }

    /// Override the bytes served for a file id. Two file ids given the same
    /// bytes hash identically, which is how duplicate fixtures are built.
    pub fn set_file_content(&self, file_id: i64, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .file_contents
            .insert(file_id, content.to_vec());
    }

    pub fn set_dialogs(&self, dialogs: Vec<Entity>) {
        self.state.lock().unwrap().dialogs = dialogs;
    }

    pub fn set_saved_messages(&self, entity: Entity) {
        self.state.lock().unwrap().saved = Some(entity);
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        self.state.lock().unwrap().resolve_delay = Some(delay);
    }

    pub fn forwarded(&self) -> Vec<ForwardCall> {
        self.state.lock().unwrap().forwarded.clone()
    }

    pub fn sent(&self) -> Vec<SendCall> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn deleted(&self) -> Vec<(i64, Vec<i64>)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn created_topics(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().created_topics.clone()
    }

    pub fn topics_in(&self, channel_id: i64) -> Vec<TopicSnapshot> {
        self.state
            .lock()
            .unwrap()
            .topics
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelegramGateway for MockGateway {
    async fn resolve_entity(&self, reference: &EntityRef) -> Result<Entity> {
        let delay = self.state.lock().unwrap().resolve_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        let id = match reference {
            EntityRef::Id(id) => *id,
            EntityRef::Username(name) => *state
                .usernames
                .get(name)
                .ok_or_else(|| SpectraError::resolve_failed(format!("@{name}")))?,
        };
        state
            .entities
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| SpectraError::resolve_failed(reference.to_string()))
    }

    async fn iter_messages(&self, entity: &Entity, opts: FetchOptions) -> Result<MessageStream> {
        let state = self.state.lock().unwrap();
        let mut messages: Vec<Message> = state
            .messages
            .get(&entity.id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| opts.min_id.map_or(true, |min| m.id > min))
            .filter(|m| !opts.media_only || m.has_media())
            .filter(|m| {
                opts.topic_id.map_or(true, |topic| {
                    m.reply_to.as_ref().and_then(|r| r.topic_id) == Some(topic)
                })
            })
            .collect();
        messages.sort_by_key(|m| m.id);
        if !opts.reverse {
            messages.reverse();
        }
        if let Some(limit) = opts.limit {
            messages.truncate(limit);
        }
        Ok(futures::stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn get_message(&self, entity: &Entity, message_id: i64) -> Result<Option<Message>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .get(&entity.id)
            .and_then(|msgs| msgs.iter().find(|m| m.id == message_id))
            .cloned())
    }

    async fn send_message(
        &self,
        dest: &Entity,
        body: &str,
        media_from: Option<&Message>,
        reply_to: Option<i64>,
    ) -> Result<MessageRef> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.send_errors.pop_front() {
            return Err(err);
        }
        state.sent.push(SendCall {
            dest: dest.id,
            body: body.to_string(),
            media_message_id: media_from.map(|m| m.id),
            reply_to,
        });
        state.next_delivery_id += 1;
        Ok(MessageRef {
            chat_id: dest.id,
            message_id: state.next_delivery_id,
        })
    }

    async fn forward_messages(
        &self,
        dest: &Entity,
        from: &Entity,
        message_ids: &[i64],
        reply_to: Option<i64>,
    ) -> Result<Vec<MessageRef>> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.forward_errors.pop_front() {
            return Err(err);
        }
        state.forwarded.push(ForwardCall {
            dest: dest.id,
            from: from.id,
            message_ids: message_ids.to_vec(),
            reply_to,
        });
        let refs = message_ids
            .iter()
            .map(|_| {
                state.next_delivery_id += 1;
                MessageRef {
                    chat_id: dest.id,
                    message_id: state.next_delivery_id,
                }
            })
            .collect();
        Ok(refs)
    }

    async fn delete_messages(&self, entity: &Entity, message_ids: &[i64]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push((entity.id, message_ids.to_vec()));
        Ok(())
    }

    async fn download_media(&self, message: &Message, to_path: &Path) -> Result<u64> {
        let file = message
            .file
            .as_ref()
            .ok_or_else(|| SpectraError::download_failed(message.id, "message has no file"))?;

        let content = {
            let state = self.state.lock().unwrap();
            if state.download_failures.contains(&file.id) {
                return Err(SpectraError::download_failed(message.id, "scripted failure"));
            }
            state
                .file_contents
                .get(&file.id)
                .cloned()
                .unwrap_or_else(|| format!("content-of-file-{}", file.id).into_bytes())
        };

        tokio::fs::write(to_path, &content)
            .await
            .map_err(|e| SpectraError::download_failed(message.id, e.to_string()))?;
        Ok(content.len() as u64)
    }

    async fn list_forum_topics(
        &self,
        channel: &Entity,
        _cursor: Option<String>,
    ) -> Result<TopicPage> {
        let state = self.state.lock().unwrap();
        Ok(TopicPage {
            topics: state.topics.get(&channel.id).cloned().unwrap_or_default(),
            next_cursor: None,
        })
    }

    async fn create_forum_topic(
        &self,
        channel: &Entity,
        request: &CreateTopicRequest,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.create_topic_errors.pop_front() {
            return Err(err);
        }
        state.next_topic_id += 1;
        let topic_id = state.next_topic_id;
        state.topics.entry(channel.id).or_default().push(TopicSnapshot {
            topic_id,
            title: request.title.clone(),
            icon_color: request.icon_color,
            icon_emoji_id: request.icon_emoji_id,
            message_count: 0,
            last_activity_at: None,
        });
        state.created_topics.push((channel.id, request.title.clone()));
        Ok(topic_id)
    }

    async fn iter_dialogs(&self) -> Result<Vec<Entity>> {
        Ok(self.state.lock().unwrap().dialogs.clone())
    }

    async fn saved_messages(&self) -> Result<Entity> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .saved
            .clone()
            .unwrap_or_else(|| Entity {
                id: 999_999,
                title: "Saved Messages".to_string(),
                kind: EntityKind::Chat,
            }))
    }
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn text_message(id: i64, sender_id: i64, text: &str) -> Message {
    Message {
        id,
        date: at(id),
        sender_id: Some(sender_id),
        text: text.to_string(),
        file: None,
        media: None,
        reply_to: None,
    }
}

pub fn file_message(id: i64, sender_id: i64, file_id: i64, name: &str, size: u64) -> Message {
    Message {
        id,
        date: at(id),
        sender_id: Some(sender_id),
        text: String::new(),
        file: Some(FileInfo {
            id: file_id,
            name: Some(name.to_string()),
            size,
            mime: None,
        }),
        media: Some(MediaInfo::of_kind(MediaKind::Document)),
        reply_to: None,
    }
}

pub fn photo_message(id: i64, sender_id: i64) -> Message {
    Message {
        id,
        date: at(id),
        sender_id: Some(sender_id),
        text: String::new(),
        file: Some(FileInfo {
            id: 9000 + id,
            name: None,
            size: 2048,
            mime: Some("image/jpeg".to_string()),
        }),
        media: Some(MediaInfo::of_kind(MediaKind::Photo)),
        reply_to: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_iter_messages_orders_and_filters() {
        let gw = MockGateway::new();
        let origin = Entity {
            id: 1,
            title: "origin".into(),
            kind: EntityKind::Channel,
        };
        gw.add_entity(origin.clone());
        gw.add_messages(
            1,
            vec![
                file_message(3, 9, 103, "c.zip", 10),
                text_message(1, 9, "hello"),
                file_message(2, 9, 102, "b.zip", 10),
            ],
        );

        let stream = gw
            .iter_messages(
                &origin,
                FetchOptions {
                    media_only: true,
                    reverse: true,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap();
        let ids: Vec<i64> = stream.map(|m| m.unwrap().id).collect().await;
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_min_id_is_exclusive() {
        let gw = MockGateway::new();
        let origin = Entity {
            id: 1,
            title: "origin".into(),
            kind: EntityKind::Channel,
        };
        gw.add_entity(origin.clone());
        gw.add_messages(1, vec![text_message(5, 9, "a"), text_message(6, 9, "b")]);

        let stream = gw
            .iter_messages(
                &origin,
                FetchOptions {
                    min_id: Some(5),
                    reverse: true,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap();
        let ids: Vec<i64> = stream.map(|m| m.unwrap().id).collect().await;
        assert_eq!(ids, vec![6]);
    }

    #[tokio::test]
    async fn test_scripted_create_topic_error_then_success() {
        let gw = MockGateway::new();
        let channel = Entity {
            id: 2,
            title: "dest".into(),
            kind: EntityKind::ForumChannel,
        };
        gw.push_create_topic_error(SpectraError::flood_wait(1));

        let request = CreateTopicRequest {
            title: "📸 Photos".into(),
            icon_color: 0x3498db,
            icon_emoji_id: None,
            random_id: 1,
        };
        assert!(matches!(
            gw.create_forum_topic(&channel, &request).await,
            Err(SpectraError::FloodWait { seconds: 1 })
        ));
        let topic_id = gw.create_forum_topic(&channel, &request).await.unwrap();
        assert!(topic_id > 100);
        assert_eq!(gw.topics_in(2).len(), 1);
    }

    #[tokio::test]
    async fn test_download_media_writes_deterministic_content() {
        let gw = MockGateway::new();
        let dir = tempfile::tempdir().unwrap();
        let msg = file_message(1, 9, 42, "a.bin", 10);

        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        gw.download_media(&msg, &path_a).await.unwrap();
        gw.download_media(&msg, &path_b).await.unwrap();

        assert_eq!(
            std::fs::read(&path_a).unwrap(),
            std::fs::read(&path_b).unwrap()
        );
    }
}
