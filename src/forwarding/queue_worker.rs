//! Drains the persistent file-forward queue.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accounts::pool::AccountPool;
use crate::config::Config;
use crate::forwarding::dedup::Deduplicator;
use crate::gateway::TelegramGateway;
use crate::store::{QueueEntry, QueueStatus, Store};
use crate::types::error::{Result, SpectraError};
use crate::types::message::EntityRef;

/// Hard deadline for one queue item.
const ITEM_DEADLINE: Duration = Duration::from_secs(300);

const DRAIN_BATCH: i64 = 100;

#[derive(Clone, Debug, Default)]
pub struct QueueDrainSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct QueueWorker {
    config: Arc<Config>,
    store: Store,
    pool: Arc<AccountPool>,
    dedup: Deduplicator,
}

impl QueueWorker {
    pub async fn new(config: Arc<Config>, store: Store, pool: Arc<AccountPool>) -> Result<Self> {
        let dedup = Deduplicator::new(&store, true).await?;
        Ok(Self {
            config,
            store,
            pool,
            dedup,
        })
    }

    /// Scan a source channel and enqueue matching files for later delivery.
    /// Known-duplicate files are filtered at enqueue time.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_from_source(
        &self,
        schedule_id: Option<i64>,
        source: &EntityRef,
        destination: Option<&str>,
        file_types: Option<&str>,
        min_file_size: Option<u64>,
        max_file_size: Option<u64>,
        account: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        use futures::StreamExt;

        let lease = self.pool.select(account).await?;
        let gateway = Arc::clone(&lease.gateway);
        let entity = gateway.resolve_entity(source).await?;

        let mut stream = gateway
            .iter_messages(
                &entity,
                crate::gateway::FetchOptions {
                    media_only: true,
                    reverse: true,
                    ..crate::gateway::FetchOptions::default()
                },
            )
            .await?;

        let mimes: Option<Vec<&str>> = file_types.map(|t| t.split(',').collect());
        let mut enqueued = 0usize;

        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(SpectraError::CancelRequested);
            }
            let message = item?;
            let Some(file) = message.file.clone() else {
                continue;
            };

            if let Some(mimes) = &mimes {
                let mime = file.mime.as_deref().unwrap_or("");
                if !mimes.contains(&mime) {
                    continue;
                }
            }
            if let Some(min) = min_file_size {
                if file.size < min {
                    continue;
                }
            }
            if let Some(max) = max_file_size {
                if file.size > max {
                    continue;
                }
            }

            if self
                .dedup
                .is_duplicate(std::slice::from_ref(&message), gateway.as_ref())
                .await?
            {
                continue;
            }

            self.store
                .queue()
                .enqueue_file(
                    schedule_id,
                    &entity.id.to_string(),
                    message.id,
                    file.id,
                    destination,
                )
                .await?;
            enqueued += 1;
        }

        info!(source = entity.id, enqueued, "files enqueued for forwarding");
        Ok(enqueued)
    }

    /// Drain pending entries in FIFO order within priority bands, forwarding
    /// each referenced message and updating the row status.
    pub async fn drain(
        &self,
        account: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<QueueDrainSummary> {
        let lease = self.pool.select(account).await?;
        let gateway = Arc::clone(&lease.gateway);
        let mut summary = QueueDrainSummary::default();

        loop {
            let batch = self.store.queue().dequeue_pending(DRAIN_BATCH).await?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                if cancel.is_cancelled() {
                    return Err(SpectraError::CancelRequested);
                }
                summary.processed += 1;

                let outcome =
                    tokio::time::timeout(ITEM_DEADLINE, self.process_entry(&entry, &gateway))
                        .await
                        .unwrap_or_else(|_| {
                            Err(SpectraError::transient("queue item deadline exceeded"))
                        });

                match outcome {
                    Ok(()) => {
                        self.store
                            .queue()
                            .update_status(entry.id, &QueueStatus::Success)
                            .await?;
                        summary.succeeded += 1;
                    }
                    Err(err) => {
                        warn!(queue_id = entry.id, error = %err, "queue item failed");
                        self.store
                            .queue()
                            .update_status(entry.id, &QueueStatus::Error(err.to_string()))
                            .await?;
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "queue drained"
        );
        Ok(summary)
    }

    async fn process_entry(
        &self,
        entry: &QueueEntry,
        gateway: &Arc<dyn TelegramGateway>,
    ) -> Result<()> {
        let destination_ref = match &entry.destination {
            Some(dest) => EntityRef::parse(dest)?,
            None => {
                let schedule_id = entry
                    .schedule_id
                    .ok_or_else(|| SpectraError::config("queue entry has no destination"))?;
                let schedule = self
                    .store
                    .queue()
                    .get_schedule(schedule_id)
                    .await?
                    .ok_or_else(|| SpectraError::config("schedule not found"))?;
                let params: serde_json::Value = serde_json::from_str(&schedule.params_json)
                    .map_err(|e| SpectraError::config(format!("bad schedule params: {e}")))?;
                let dest = params
                    .get("destination")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| SpectraError::config("schedule has no destination"))?;
                EntityRef::parse(dest)?
            }
        };

        let source = gateway
            .resolve_entity(&EntityRef::parse(&entry.origin_channel)?)
            .await?;
        let destination = gateway.resolve_entity(&destination_ref).await?;

        let message = gateway
            .get_message(&source, entry.message_id)
            .await?
            .ok_or_else(|| {
                SpectraError::resolve_failed(format!(
                    "message {} in {}",
                    entry.message_id, entry.origin_channel
                ))
            })?;

        gateway
            .forward_messages(&destination, &source, &[entry.message_id], None)
            .await?;

        self.dedup
            .record_forwarded(
                std::slice::from_ref(&message),
                source.id,
                &destination.id.to_string(),
                gateway.as_ref(),
            )
            .await?;

        // Bandwidth throttle: rest proportionally to the file size.
        let kbps = self.config.scheduler.bandwidth_limit_kbps;
        if kbps > 0 {
            if let Some(file) = &message.file {
                let delay = file.size as f64 / (kbps as f64 * 1024.0);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        Ok(())
    }
}
