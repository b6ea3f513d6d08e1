use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::error::{Result, SpectraError};

/// Kind of an addressable Telegram object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Chat,
    Channel,
    /// A channel with first-class threaded topics.
    ForumChannel,
}

/// A resolved Telegram entity (channel, group, chat or user).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub title: String,
    pub kind: EntityKind,
}

impl Entity {
    pub fn is_forum(&self) -> bool {
        self.kind == EntityKind::ForumChannel
    }
}

/// An unresolved reference to an entity, either a numeric id or a username.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Id(i64),
    Username(String),
}

impl EntityRef {
    /// Parse a user-supplied reference: integers become ids, everything else
    /// a username with any leading `@` stripped.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SpectraError::resolve_failed(raw));
        }
        if let Ok(id) = trimmed.parse::<i64>() {
            return Ok(Self::Id(id));
        }
        Ok(Self::Username(
            trimmed.trim_start_matches('@').to_string(),
        ))
    }
}

impl From<i64> for EntityRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Username(name) => write!(f, "@{name}"),
        }
    }
}

/// Media discriminator used by the classifier and the topic templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    Contact,
    Location,
    Poll,
    Game,
    Webpage,
}

/// Attached file description as reported by the gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: i64,
    pub name: Option<String>,
    pub size: u64,
    pub mime: Option<String>,
}

/// Media attributes relevant to classification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub duration: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl MediaInfo {
    pub fn of_kind(kind: MediaKind) -> Self {
        Self {
            kind,
            duration: None,
            width: None,
            height: None,
        }
    }
}

/// Reply context, carrying the forum topic when the message lives in one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyTo {
    pub message_id: i64,
    pub topic_id: Option<i64>,
}

/// The single message value type every component programs against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub sender_id: Option<i64>,
    pub text: String,
    pub file: Option<FileInfo>,
    pub media: Option<MediaInfo>,
    pub reply_to: Option<ReplyTo>,
}

impl Message {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file.as_ref().and_then(|f| f.name.as_deref())
    }

    pub fn file_size(&self) -> Option<u64> {
        self.file.as_ref().map(|f| f.size)
    }
}

/// Handle of a delivered message, as returned by send/forward operations.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}
