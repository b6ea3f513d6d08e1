//! Channel-access indexer: records which channels each account can read.
//!
//! Idempotent and safe to re-run; per-account failures never abort the
//! sweep. Not on the forwarding hot path.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accounts::pool::AccountPool;
use crate::store::AccessStore;
use crate::types::error::{Result, SpectraError};
use crate::types::message::EntityKind;

#[derive(Clone, Debug, Default)]
pub struct IndexSummary {
    pub accounts_indexed: usize,
    pub accounts_skipped: usize,
    pub channels_recorded: usize,
}

pub struct ChannelAccessIndexer {
    access: AccessStore,
}

impl ChannelAccessIndexer {
    pub fn new(access: AccessStore) -> Self {
        Self { access }
    }

    /// Enumerate dialogs for every healthy account and upsert the
    /// `(account, channel)` map.
    pub async fn run(
        &self,
        pool: &AccountPool,
        cancel: &CancellationToken,
    ) -> Result<IndexSummary> {
        let mut summary = IndexSummary::default();
        let all_accounts = pool.stats().await.len();
        let sessions = pool.healthy_sessions().await;
        summary.accounts_skipped = all_accounts - sessions.len();

        for session in sessions {
            if cancel.is_cancelled() {
                return Err(SpectraError::CancelRequested);
            }

            let lease = match pool.select(Some(&session)).await {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(account = %session, error = %err, "skipping account");
                    summary.accounts_skipped += 1;
                    continue;
                }
            };

            let dialogs = match lease.gateway.iter_dialogs().await {
                Ok(dialogs) => dialogs,
                Err(err) => {
                    warn!(account = %session, error = %err, "dialog enumeration failed");
                    pool.record_error(&session, &err.to_string()).await;
                    summary.accounts_skipped += 1;
                    continue;
                }
            };

            let mut recorded = 0usize;
            for entity in dialogs {
                if !matches!(entity.kind, EntityKind::Channel | EntityKind::ForumChannel) {
                    continue;
                }
                self.access
                    .upsert_access(&session, entity.id, &entity.title)
                    .await?;
                recorded += 1;
            }

            info!(account = %session, channels = recorded, "indexed channel access");
            summary.accounts_indexed += 1;
            summary.channels_recorded += recorded;
        }

        Ok(summary)
    }
}
