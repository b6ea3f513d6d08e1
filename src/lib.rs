//! SPECTRA engine: the forwarding and topic-organization core of a
//! multi-account Telegram archiving platform.
//!
//! The crate is organized around three subsystems and the state store that
//! backs them:
//!
//! - [`accounts`]: a pool of authenticated sessions with rotation,
//!   flood-wait cooldowns and a per-account channel-access index.
//! - [`forwarding`]: the pipeline: fetch, group, deduplicate by content
//!   hash, classify, route into forum topics, deliver, record.
//! - [`scheduler`]: cron-style recurring jobs (channel forwards, file
//!   forwards, mass migrations) plus the persistent file-forward queue.
//! - [`store`]: a single SQLite file (WAL, foreign keys) holding hash
//!   indexes, access maps, topic caches, queues and mirror progress.
//!
//! Telegram itself is reached only through the [`gateway::TelegramGateway`]
//! trait; a deployment links an adapter mapping it onto a real client
//! library. Front-ends drive the engine through the typed functions in
//! [`handlers`].

pub mod accounts;
pub mod config;
pub mod forwarding;
pub mod gateway;
pub mod handlers;
pub mod logging;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod types;

pub use accounts::{AccountLease, AccountPool, ChannelAccessIndexer};
pub use config::Config;
pub use forwarding::{
    ForwardOutcome, ForwardRequest, ForwardStats, Forwarder, QueueWorker,
};
pub use gateway::TelegramGateway;
pub use handlers::EngineContext;
pub use scheduler::{JobPayload, Scheduler};
pub use services::MirrorService;
pub use store::Store;
pub use types::error::{Result, SpectraError};
pub use types::message::{Entity, EntityKind, EntityRef, Message};
