use thiserror::Error;

/// Error taxonomy surfaced by the engine.
///
/// `FloodWait` carries the server-issued back-off so callers can decide
/// between sleeping on the same account and swapping to another one. It is a
/// result variant, never a string to be re-parsed.
#[derive(Error, Debug, Clone)]
pub enum SpectraError {
    #[error("no account available for selection")]
    NoAccountAvailable,

    #[error("account '{session}' failed authorization: {reason}")]
    AccountAuthInvalid { session: String, reason: String },

    #[error("could not resolve entity '{reference}'")]
    EntityResolveFailed { reference: String },

    #[error("channel {channel_id} is private or inaccessible")]
    ChannelPrivate { channel_id: i64 },

    #[error("admin rights required in channel {channel_id}")]
    AdminRequired { channel_id: i64 },

    #[error("account is banned in channel {channel_id}")]
    UserBanned { channel_id: i64 },

    #[error("flood wait: retry after {seconds}s")]
    FloodWait { seconds: u64 },

    #[error("topic '{title}' already exists in channel {channel_id}")]
    TopicExists { channel_id: i64, title: String },

    #[error("topic {topic_id} is closed for posting")]
    TopicClosed { topic_id: i64 },

    #[error("topic {topic_id} has been deleted")]
    TopicDeleted { topic_id: i64 },

    #[error("duplicate content, group skipped")]
    DuplicateSkipped,

    #[error("deleting messages is forbidden in channel {channel_id}")]
    DeleteForbidden { channel_id: i64 },

    #[error("download failed for message {message_id}: {reason}")]
    DownloadFailed { message_id: i64, reason: String },

    #[error("content hash mismatch for file {file_id}")]
    HashMismatch { file_id: i64 },

    #[error("state store error: {message}")]
    StateStore { message: String },

    #[error("rate limited: {message}")]
    RateLimit { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("operation cancelled")]
    CancelRequested,

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl SpectraError {
    pub fn auth_invalid(session: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AccountAuthInvalid {
            session: session.into(),
            reason: reason.into(),
        }
    }

    pub fn resolve_failed(reference: impl Into<String>) -> Self {
        Self::EntityResolveFailed {
            reference: reference.into(),
        }
    }

    pub fn flood_wait(seconds: u64) -> Self {
        Self::FloodWait { seconds }
    }

    pub fn download_failed(message_id: i64, reason: impl Into<String>) -> Self {
        Self::DownloadFailed {
            message_id,
            reason: reason.into(),
        }
    }

    pub fn state_store(message: impl Into<String>) -> Self {
        Self::StateStore {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Permission and lookup failures that should skip the current channel or
    /// group without aborting a multi-channel run.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::ChannelPrivate { .. }
                | Self::AdminRequired { .. }
                | Self::UserBanned { .. }
                | Self::DeleteForbidden { .. }
        )
    }

    /// Errors a caller may reasonably retry after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FloodWait { .. } | Self::Transient { .. } | Self::RateLimit { .. }
        )
    }
}

impl From<sqlx::Error> for SpectraError {
    fn from(err: sqlx::Error) -> Self {
        Self::StateStore {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpectraError>;
