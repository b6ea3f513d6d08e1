//! Cron-style recurring job runner.
//!
//! Single-threaded tick loop (1 s); jobs fire when their next occurrence is
//! due, at most one instance of each job runs at a time, and fire times
//! persist to the scheduler state file so a restart resumes cleanly.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accounts::pool::AccountPool;
use crate::config::Config;
use crate::forwarding::forwarder::{ForwardRequest, Forwarder};
use crate::forwarding::queue_worker::QueueWorker;
use crate::services::mirror::MirrorService;
use crate::store::Store;
use crate::types::error::{Result, SpectraError};
use crate::types::message::EntityRef;

/// Typed payload of a scheduled job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    ChannelForward {
        channel: String,
        destination: String,
    },
    FileForward {
        source: String,
        destination: String,
        #[serde(default)]
        file_types: Option<String>,
        #[serde(default)]
        min_file_size: Option<u64>,
        #[serde(default)]
        max_file_size: Option<u64>,
    },
    MassMigration {
        source: String,
        destination: String,
    },
    Generic {
        command: String,
    },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelForward { .. } => "channel_forward",
            Self::FileForward { .. } => "file_forward",
            Self::MassMigration { .. } => "mass_migration",
            Self::Generic { .. } => "generic",
        }
    }
}

/// Parse a cron expression. Standard 5-field expressions are normalized to
/// the 7-field form the `cron` crate expects (seconds pinned to 0).
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {expr} *"),
        _ => expr.to_string(),
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| SpectraError::config(format!("invalid cron expression '{expr}': {e}")))
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Persisted fire times, keyed by job name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub last_fire: HashMap<String, i64>,
}

impl SchedulerState {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        match serde_json::to_string_pretty(self) {
            Ok(raw) => {
                if let Err(err) = std::fs::write(path, raw) {
                    warn!(path = %path.display(), error = %err, "could not save scheduler state");
                }
            }
            Err(err) => warn!(error = %err, "could not serialize scheduler state"),
        }
    }
}

/// RAII guard removing a job from the in-flight set on drop, so a panicking
/// job never blocks its own next run.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.name);
    }
}

pub struct Scheduler {
    config: Arc<Config>,
    store: Store,
    pool: Arc<AccountPool>,
    state_path: PathBuf,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, store: Store, pool: Arc<AccountPool>) -> Self {
        let state_path = config.scheduler.state_file.clone();
        Self {
            config,
            store,
            pool,
            state_path,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register (or replace) a job. The cron expression is validated here so
    /// a bad schedule never reaches the tick loop.
    pub async fn add_job(
        &self,
        name: &str,
        cron_expr: &str,
        payload: &JobPayload,
        priority: i64,
    ) -> Result<i64> {
        parse_cron(cron_expr)?;
        let params = serde_json::to_string(payload)
            .map_err(|e| SpectraError::config(e.to_string()))?;
        let id = self
            .store
            .queue()
            .add_schedule(name, payload.kind(), cron_expr, &params, priority)
            .await?;
        info!(job = name, cron = cron_expr, kind = payload.kind(), "job registered");
        Ok(id)
    }

    pub async fn remove_job(&self, name: &str) -> Result<bool> {
        self.store.queue().remove_schedule(name).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<crate::store::ScheduleRecord>> {
        self.store.queue().list_schedules().await
    }

    /// Run the tick loop until cancelled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = SchedulerState::load(&self.state_path);
        let startup = Utc::now().timestamp();

        // Jobs with no recorded fire time start their schedule from now, so
        // a stale cron does not fire a backlog at boot.
        for record in self.store.queue().list_schedules().await? {
            state.last_fire.entry(record.name).or_insert(startup);
        }
        state.save(&self.state_path);

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(state = %self.state_path.display(), "scheduler running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = tick.tick() => {}
            }

            let now = Utc::now();
            let mut dirty = false;

            for record in self.store.queue().list_schedules().await? {
                if !record.enabled {
                    continue;
                }
                let schedule = match parse_cron(&record.cron_expr) {
                    Ok(schedule) => schedule,
                    Err(err) => {
                        warn!(job = %record.name, error = %err, "skipping job with bad cron");
                        continue;
                    }
                };

                let last = state
                    .last_fire
                    .get(&record.name)
                    .copied()
                    .unwrap_or(startup);
                let last_dt = Utc
                    .timestamp_opt(last, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                let Some(due) = next_fire(&schedule, last_dt) else {
                    continue;
                };
                if due > now {
                    continue;
                }

                if !self.in_flight.lock().unwrap().insert(record.name.clone()) {
                    warn!(job = %record.name, "previous run still active, skipping");
                    continue;
                }

                state.last_fire.insert(record.name.clone(), now.timestamp());
                dirty = true;
                self.store
                    .queue()
                    .touch_last_run(&record.name, now.timestamp())
                    .await?;

                let guard = InFlightGuard {
                    set: Arc::clone(&self.in_flight),
                    name: record.name.clone(),
                };
                let payload: JobPayload = match serde_json::from_str(&record.params_json) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(job = %record.name, error = %err, "bad job payload");
                        continue;
                    }
                };

                let config = Arc::clone(&self.config);
                let store = self.store.clone();
                let pool = Arc::clone(&self.pool);
                let job_cancel = cancel.child_token();
                let name = record.name.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    info!(job = %name, "job starting");
                    if let Err(err) =
                        Self::execute(payload, config, store, pool, &job_cancel).await
                    {
                        error!(job = %name, error = %err, "job failed");
                    } else {
                        info!(job = %name, "job finished");
                    }
                });
            }

            if dirty {
                state.save(&self.state_path);
            }
        }
    }

    async fn execute(
        payload: JobPayload,
        config: Arc<Config>,
        store: Store,
        pool: Arc<AccountPool>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match payload {
            JobPayload::ChannelForward {
                channel,
                destination,
            } => {
                let forwarder = Forwarder::new(config, store, pool).await?;
                let request = ForwardRequest::new(
                    EntityRef::parse(&channel)?,
                    EntityRef::parse(&destination)?,
                );
                forwarder.forward(&request, cancel).await?;
                Ok(())
            }
            JobPayload::FileForward {
                source,
                destination,
                file_types,
                min_file_size,
                max_file_size,
            } => {
                let worker = QueueWorker::new(config, store, pool).await?;
                worker
                    .enqueue_from_source(
                        None,
                        &EntityRef::parse(&source)?,
                        Some(destination.as_str()),
                        file_types.as_deref(),
                        min_file_size,
                        max_file_size,
                        None,
                        cancel,
                    )
                    .await?;
                worker.drain(None, cancel).await?;
                Ok(())
            }
            JobPayload::MassMigration {
                source,
                destination,
            } => {
                let service = MirrorService::new(store, pool);
                service
                    .mirror(
                        &EntityRef::parse(&source)?,
                        &EntityRef::parse(&destination)?,
                        None,
                        cancel,
                    )
                    .await?;
                Ok(())
            }
            JobPayload::Generic { command } => {
                let status = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .status()
                    .await
                    .map_err(|e| SpectraError::transient(format!("spawn failed: {e}")))?;
                if !status.success() {
                    return Err(SpectraError::transient(format!(
                        "command exited with {status}"
                    )));
                }
                Ok(())
            }
        }
    }
}
