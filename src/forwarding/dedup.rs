//! Content-hash deduplication of forwarded attachments.
//!
//! Two-level lookup: an in-memory digest set seeded from the state store at
//! construction, backed by the persistent `file_hashes` table. The group is
//! the atomic unit: one known member skips the whole group, which prevents
//! partial delivery of multi-part archives.

use std::collections::HashSet;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::gateway::TelegramGateway;
use crate::store::{HashStore, Store};
use crate::types::error::{Result, SpectraError};
use crate::types::message::Message;

const HASH_CHUNK_SIZE: usize = 8192;

/// Streaming SHA-256 of a file in 8 KiB chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct Deduplicator {
    hashes: HashStore,
    enabled: bool,
    seen: Mutex<HashSet<String>>,
}

impl Deduplicator {
    /// Build a deduplicator, seeding the in-memory set from the store.
    pub async fn new(store: &Store, enabled: bool) -> Result<Self> {
        let hashes = store.hashes();
        let mut seen = HashSet::new();
        if enabled {
            for digest in hashes.load_all_hashes().await? {
                seen.insert(digest);
            }
            info!(count = seen.len(), "seeded dedup set from state store");
        }
        Ok(Self {
            hashes,
            enabled,
            seen: Mutex::new(seen),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True when any file in the group is already known by content hash.
    ///
    /// Side-effect free with respect to the state store. Files that fail to
    /// download (or come back empty) are skipped with a warning and never
    /// counted as duplicates.
    pub async fn is_duplicate(
        &self,
        group: &[Message],
        gateway: &dyn TelegramGateway,
    ) -> Result<bool> {
        if !self.enabled || group.is_empty() {
            return Ok(false);
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| SpectraError::transient(format!("scratch dir: {e}")))?;

        for message in group {
            let Some(file) = &message.file else {
                continue;
            };
            let path = scratch.path().join(file.id.to_string());

            let digest = match self.download_and_hash(message, gateway, &path).await {
                Some(digest) => digest,
                None => continue,
            };

            if self.seen.lock().await.contains(&digest) {
                info!(
                    message_id = message.id,
                    digest = &digest[..10],
                    "duplicate file found in memory set"
                );
                return Ok(true);
            }

            if self.hashes.hash_exists(&digest).await? {
                info!(
                    message_id = message.id,
                    digest = &digest[..10],
                    "duplicate file found in state store"
                );
                self.seen.lock().await.insert(digest);
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Record every file in a confirmed-delivered group: a `file_hashes` row,
    /// an inventory row, and only then the in-memory set (write-through).
    /// Must be called only after successful delivery.
    pub async fn record_forwarded(
        &self,
        group: &[Message],
        origin_id: i64,
        dest_id: &str,
        gateway: &dyn TelegramGateway,
    ) -> Result<()> {
        if !self.enabled || group.is_empty() {
            return Ok(());
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| SpectraError::transient(format!("scratch dir: {e}")))?;

        for message in group {
            let Some(file) = &message.file else {
                continue;
            };
            let path = scratch.path().join(file.id.to_string());

            let digest = match self.download_and_hash(message, gateway, &path).await {
                Some(digest) => digest,
                None => continue,
            };

            self.hashes.upsert_hash(file.id, &digest).await?;
            // The digest may already be recorded under another file id; the
            // inventory row must reference the canonical one.
            let canonical_file_id = self
                .hashes
                .file_id_for_digest(&digest)
                .await?
                .unwrap_or(file.id);
            self.hashes
                .insert_inventory(
                    origin_id,
                    message.id,
                    canonical_file_id,
                    message.reply_to.as_ref().and_then(|r| r.topic_id),
                )
                .await?;
            self.seen.lock().await.insert(digest.clone());

            debug!(
                message_id = message.id,
                digest = &digest[..10],
                dest = dest_id,
                "recorded forwarded file"
            );
        }

        Ok(())
    }

    async fn download_and_hash(
        &self,
        message: &Message,
        gateway: &dyn TelegramGateway,
        path: &Path,
    ) -> Option<String> {
        match gateway.download_media(message, path).await {
            Ok(0) => {
                warn!(message_id = message.id, "downloaded file is empty, skipping");
                return None;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(message_id = message.id, error = %err, "download failed, skipping file");
                return None;
            }
        }

        match sha256_file(path).await {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(message_id = message.id, error = %err, "hashing failed, skipping file");
                None
            }
        }
    }
}
