//! Typed handler functions backing the operator command surface.
//!
//! Front-ends (CLI, TUI, service wrappers) call these with parsed arguments;
//! each handler returns a process exit code: 0 on success, 1 on error, 130
//! when cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::accounts::indexer::ChannelAccessIndexer;
use crate::accounts::pool::AccountPool;
use crate::config::{AccountConfig, Config, OrganizationSettings};
use crate::forwarding::forwarder::{ForwardRequest, Forwarder};
use crate::forwarding::queue_worker::QueueWorker;
use crate::forwarding::topic_manager::TopicManager;
use crate::gateway::TelegramGateway;
use crate::scheduler::{JobPayload, Scheduler};
use crate::services::mirror::MirrorService;
use crate::store::Store;
use crate::types::error::{Result, SpectraError};
use crate::types::message::EntityRef;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

/// Shared dependencies every handler needs.
pub struct EngineContext {
    pub config: Arc<Config>,
    pub config_path: Option<PathBuf>,
    pub store: Store,
    pub pool: Arc<AccountPool>,
}

impl EngineContext {
    /// Open the state store and register every configured account through
    /// the supplied gateway connector.
    pub async fn bootstrap(
        config: Config,
        config_path: Option<PathBuf>,
        connect: impl FnMut(&AccountConfig) -> Arc<dyn TelegramGateway>,
    ) -> anyhow::Result<Self> {
        let store = Store::open(&config.db_path).await?;
        let pool = Arc::new(AccountPool::new());
        let config = Arc::new(config);
        pool.register_from_config(&config, connect).await;
        Ok(Self {
            config,
            config_path,
            store,
            pool,
        })
    }
}

fn finish<T>(result: Result<T>) -> i32 {
    match result {
        Ok(_) => EXIT_SUCCESS,
        Err(SpectraError::CancelRequested) => EXIT_INTERRUPTED,
        Err(err) => {
            error!(error = %err, "command failed");
            EXIT_FAILURE
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ForwardArgs {
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub account: Option<String>,
    pub start_message_id: Option<i64>,
    pub topic_id: Option<i64>,
    /// Forward every accessible channel instead of a single origin.
    pub total_mode: bool,
}

/// `forward`: run the pipeline for one origin, or for every accessible
/// channel in total mode.
pub async fn forward(ctx: &EngineContext, args: ForwardArgs, cancel: &CancellationToken) -> i32 {
    let destination = match args
        .destination
        .or_else(|| ctx.config.forwarding.default_destination_id.clone())
    {
        Some(dest) => dest,
        None => {
            error!("destination required: pass one or set forwarding.default_destination_id");
            return EXIT_FAILURE;
        }
    };

    let run = async {
        let destination = EntityRef::parse(&destination)?;
        let forwarder =
            Forwarder::new(Arc::clone(&ctx.config), ctx.store.clone(), Arc::clone(&ctx.pool))
                .await?;

        if args.total_mode {
            let outcome = forwarder.forward_all_accessible(destination, cancel).await?;
            println!(
                "processed {} channel(s), {} failed, {} message(s) forwarded",
                outcome.channels_processed, outcome.channels_failed,
                outcome.stats.messages_forwarded
            );
            return Ok(());
        }

        let origin = args
            .origin
            .ok_or_else(|| SpectraError::config("origin required"))?;
        let request = ForwardRequest {
            origin: EntityRef::parse(&origin)?,
            destination,
            account: args.account,
            start_message_id: args.start_message_id,
            topic_override: args.topic_id,
        };
        let outcome = forwarder.forward(&request, cancel).await?;
        println!(
            "forwarded {} message(s), {} file(s), {} byte(s); last id {:?}",
            outcome.stats.messages_forwarded,
            outcome.stats.files_forwarded,
            outcome.stats.bytes_forwarded,
            outcome.last_message_id
        );
        Ok(())
    };
    finish(run.await)
}

#[derive(Clone, Debug)]
pub struct ArchiveArgs {
    pub origin: String,
    pub account: Option<String>,
    pub start_message_id: Option<i64>,
}

/// `archive`: forward an origin into the configured archive destination.
pub async fn archive(ctx: &EngineContext, args: ArchiveArgs, cancel: &CancellationToken) -> i32 {
    forward(
        ctx,
        ForwardArgs {
            origin: Some(args.origin),
            destination: None,
            account: args.account,
            start_message_id: args.start_message_id,
            topic_id: None,
            total_mode: false,
        },
        cancel,
    )
    .await
}

#[derive(Clone, Debug)]
pub enum TopicsCommand {
    List {
        channel: i64,
        include_inactive: bool,
    },
    Create {
        channel: String,
        title: String,
        account: Option<String>,
    },
    Update {
        channel: i64,
        topic_id: i64,
        category: Option<String>,
        description: Option<String>,
    },
    Delete {
        channel: i64,
        topic_id: i64,
    },
    Stats {
        channel: i64,
        date: String,
    },
    Report {
        channel: i64,
        days: i64,
    },
    ConfigGet {
        channel: i64,
    },
    ConfigSet {
        channel: i64,
        settings: Box<OrganizationSettings>,
    },
    Cleanup {
        channel: String,
        min_age_hours: u64,
        account: Option<String>,
    },
}

pub async fn topics(ctx: &EngineContext, command: TopicsCommand, cancel: &CancellationToken) -> i32 {
    if cancel.is_cancelled() {
        return EXIT_INTERRUPTED;
    }
    let run = async {
        match command {
            TopicsCommand::List {
                channel,
                include_inactive,
            } => {
                let topics = ctx
                    .store
                    .topics()
                    .topics_by_channel(channel, !include_inactive)
                    .await?;
                for topic in &topics {
                    println!(
                        "{}\t{}\t{}\t{}",
                        topic.topic_id,
                        topic.title,
                        topic.category.as_deref().unwrap_or("-"),
                        if topic.is_active { "active" } else { "inactive" }
                    );
                }
                println!("{} topic(s)", topics.len());
                Ok(())
            }
            TopicsCommand::Create {
                channel,
                title,
                account,
            } => {
                let lease = ctx.pool.select(account.as_deref()).await?;
                let entity = lease
                    .gateway
                    .resolve_entity(&EntityRef::parse(&channel)?)
                    .await?;
                let settings = &ctx.config.topic_organization;
                let manager = TopicManager::new(
                    Arc::clone(&lease.gateway),
                    ctx.store.topics(),
                    entity,
                    settings.topic_strategy,
                    Duration::from_secs(settings.topic_creation_cooldown_seconds),
                    settings.max_topics_per_channel,
                );
                manager.initialize().await;
                match manager.get_or_create_named(&title).await? {
                    Some(topic_id) => {
                        println!("topic {topic_id}: {title}");
                        Ok(())
                    }
                    None => Err(SpectraError::protocol("topic could not be created")),
                }
            }
            TopicsCommand::Update {
                channel,
                topic_id,
                category,
                description,
            } => {
                let mut record = ctx
                    .store
                    .topics()
                    .get_topic(channel, topic_id)
                    .await?
                    .ok_or_else(|| {
                        SpectraError::resolve_failed(format!("topic {topic_id} in {channel}"))
                    })?;
                if category.is_some() {
                    record.category = category;
                }
                if description.is_some() {
                    record.description = description;
                }
                ctx.store.topics().upsert_topic(&record).await?;
                Ok(())
            }
            TopicsCommand::Delete { channel, topic_id } => {
                if !ctx.store.topics().deactivate_topic(channel, topic_id).await? {
                    return Err(SpectraError::resolve_failed(format!(
                        "topic {topic_id} in {channel}"
                    )));
                }
                Ok(())
            }
            TopicsCommand::Stats { channel, date } => {
                match ctx.store.topics().get_stats(channel, &date).await? {
                    Some(stats) => {
                        println!(
                            "{date}: processed {}, topics created {}, assigned {}, failed {}, fallback {}",
                            stats.messages_processed,
                            stats.topics_created,
                            stats.successful_assignments,
                            stats.failed_assignments,
                            stats.fallback_used
                        );
                        for (category, count) in &stats.categories {
                            println!("  {category}: {count}");
                        }
                    }
                    None => println!("no stats for {date}"),
                }
                Ok(())
            }
            TopicsCommand::Report { channel, days } => {
                let report = ctx.store.topics().efficiency_report(channel, days).await?;
                println!(
                    "last {days}d: processed {}, assigned {} ({:.0}%), failed {}, fallback {}",
                    report.messages_processed,
                    report.successful_assignments,
                    report.success_rate * 100.0,
                    report.failed_assignments,
                    report.fallback_used
                );
                for row in ctx.store.topics().topic_performance(channel, 10).await? {
                    println!(
                        "  {}\t{}\t{}",
                        row.topic_id.map_or("-".to_string(), |id| id.to_string()),
                        row.topic_title.as_deref().unwrap_or("(no topic)"),
                        row.assignments
                    );
                }
                Ok(())
            }
            TopicsCommand::ConfigGet { channel } => {
                let settings = ctx
                    .store
                    .topics()
                    .get_org_config(channel)
                    .await?
                    .unwrap_or_else(|| ctx.config.topic_organization.clone());
                println!(
                    "mode={} strategy={} fallback={} threshold={} general=\"{}\"",
                    settings.mode.as_str(),
                    settings.topic_strategy.as_str(),
                    settings.fallback_strategy.as_str(),
                    settings.classification_confidence_threshold,
                    settings.general_topic_title
                );
                Ok(())
            }
            TopicsCommand::ConfigSet { channel, settings } => {
                ctx.store.topics().upsert_org_config(channel, &settings).await?;
                info!(channel, "organization config saved");
                Ok(())
            }
            TopicsCommand::Cleanup {
                channel,
                min_age_hours,
                account,
            } => {
                let lease = ctx.pool.select(account.as_deref()).await?;
                let entity = lease
                    .gateway
                    .resolve_entity(&EntityRef::parse(&channel)?)
                    .await?;
                let settings = &ctx.config.topic_organization;
                let manager = TopicManager::new(
                    Arc::clone(&lease.gateway),
                    ctx.store.topics(),
                    entity,
                    settings.topic_strategy,
                    Duration::from_secs(settings.topic_creation_cooldown_seconds),
                    settings.max_topics_per_channel,
                );
                let removed = manager
                    .cleanup_empty_topics(Duration::from_secs(min_age_hours * 3600))
                    .await?;
                println!("{removed} topic(s) cleaned up");
                Ok(())
            }
        }
    };
    finish(run.await)
}

#[derive(Clone, Debug)]
pub enum ScheduleCommand {
    Add {
        name: String,
        cron: String,
        command: String,
    },
    AddChannelForward {
        name: String,
        channel: String,
        destination: String,
        cron: String,
    },
    AddFileForward {
        name: String,
        source: String,
        destination: String,
        cron: String,
        file_types: Option<String>,
        min_file_size: Option<u64>,
        max_file_size: Option<u64>,
        priority: i64,
    },
    List,
    Remove {
        name: String,
    },
    Run,
    Report {
        schedule_id: i64,
    },
}

pub async fn schedule(
    ctx: &EngineContext,
    command: ScheduleCommand,
    cancel: &CancellationToken,
) -> i32 {
    let scheduler = Scheduler::new(
        Arc::clone(&ctx.config),
        ctx.store.clone(),
        Arc::clone(&ctx.pool),
    );

    let run = async {
        match command {
            ScheduleCommand::Add {
                name,
                cron,
                command,
            } => {
                scheduler
                    .add_job(&name, &cron, &JobPayload::Generic { command }, 0)
                    .await?;
                Ok(())
            }
            ScheduleCommand::AddChannelForward {
                name,
                channel,
                destination,
                cron,
            } => {
                scheduler
                    .add_job(
                        &name,
                        &cron,
                        &JobPayload::ChannelForward {
                            channel,
                            destination,
                        },
                        0,
                    )
                    .await?;
                Ok(())
            }
            ScheduleCommand::AddFileForward {
                name,
                source,
                destination,
                cron,
                file_types,
                min_file_size,
                max_file_size,
                priority,
            } => {
                scheduler
                    .add_job(
                        &name,
                        &cron,
                        &JobPayload::FileForward {
                            source,
                            destination,
                            file_types,
                            min_file_size,
                            max_file_size,
                        },
                        priority,
                    )
                    .await?;
                Ok(())
            }
            ScheduleCommand::List => {
                for job in scheduler.list_jobs().await? {
                    println!(
                        "{}\t{}\t{}\t{}\tlast run: {}",
                        job.name,
                        job.kind,
                        job.cron_expr,
                        if job.enabled { "enabled" } else { "disabled" },
                        job.last_run_at
                            .map_or("never".to_string(), |ts| ts.to_string())
                    );
                }
                Ok(())
            }
            ScheduleCommand::Remove { name } => {
                if !scheduler.remove_job(&name).await? {
                    return Err(SpectraError::resolve_failed(format!("schedule '{name}'")));
                }
                Ok(())
            }
            ScheduleCommand::Run => scheduler.run(cancel).await,
            ScheduleCommand::Report { schedule_id } => {
                let rows = ctx.store.queue().queue_report(schedule_id).await?;
                if rows.is_empty() {
                    println!("no files found for this schedule");
                } else {
                    for (message_id, file_id, status) in rows {
                        println!(
                            "message {message_id}, file {file_id}: {}",
                            status.render()
                        );
                    }
                }
                Ok(())
            }
        }
    };
    finish(run.await)
}

#[derive(Clone, Debug)]
pub enum AccountsCommand {
    List,
    Reset,
    Test,
    /// Merge accounts from another config document into the main one.
    Import {
        path: PathBuf,
    },
}

pub async fn accounts(ctx: &EngineContext, command: AccountsCommand) -> i32 {
    let run = async {
        match command {
            AccountsCommand::List => {
                let stats = ctx.pool.stats().await;
                if stats.is_empty() {
                    println!("no accounts configured");
                }
                for (index, account) in stats.iter().enumerate() {
                    let cooldown = account
                        .cooldown_until
                        .map(|until| format!(" (cooldown until {until})"))
                        .unwrap_or_default();
                    println!(
                        "{}. {}: usage {}, status {}{}",
                        index + 1,
                        account.session_name,
                        account.usage_count,
                        account.status.as_str(),
                        cooldown
                    );
                    if let Some(err) = &account.last_error {
                        println!("   last error: {err}");
                    }
                }
                Ok(())
            }
            AccountsCommand::Reset => {
                ctx.pool.reset_usage().await;
                println!("usage counters reset");
                Ok(())
            }
            AccountsCommand::Test => {
                let mut healthy = 0usize;
                for account in ctx.pool.stats().await {
                    match ctx.pool.select(Some(&account.session_name)).await {
                        Ok(lease) if lease.session_name == account.session_name => {
                            match lease.gateway.saved_messages().await {
                                Ok(_) => {
                                    healthy += 1;
                                    println!("{}: ok", account.session_name);
                                }
                                Err(err) => println!("{}: {err}", account.session_name),
                            }
                        }
                        _ => println!("{}: unavailable", account.session_name),
                    }
                }
                if healthy == 0 {
                    return Err(SpectraError::NoAccountAvailable);
                }
                println!("{healthy} account(s) responding");
                Ok(())
            }
            AccountsCommand::Import { path } => {
                let config_path = ctx
                    .config_path
                    .clone()
                    .ok_or_else(|| SpectraError::config("no config file to import into"))?;
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| SpectraError::config(format!("reading {}: {e}", path.display())))?;
                let imported: Vec<AccountConfig> = serde_json::from_str::<Config>(&raw)
                    .map(|c| c.accounts)
                    .or_else(|_| serde_json::from_str::<Vec<AccountConfig>>(&raw))
                    .map_err(|e| SpectraError::config(format!("parsing {}: {e}", path.display())))?;

                let mut merged = (*ctx.config).clone();
                let mut added = 0usize;
                for account in imported {
                    if merged.find_account(&account.session_name).is_none() {
                        merged.accounts.push(account);
                        added += 1;
                    }
                }
                let rendered = serde_json::to_string_pretty(&merged)
                    .map_err(|e| SpectraError::config(e.to_string()))?;
                std::fs::write(&config_path, rendered)
                    .map_err(|e| SpectraError::config(format!("writing config: {e}")))?;
                println!("imported {added} account(s)");
                Ok(())
            }
        }
    };
    finish(run.await)
}

/// `channels update-access`: refresh the per-account channel map.
pub async fn channels_update_access(ctx: &EngineContext, cancel: &CancellationToken) -> i32 {
    let indexer = ChannelAccessIndexer::new(ctx.store.access());
    let run = async {
        let summary = indexer.run(&ctx.pool, cancel).await?;
        println!(
            "indexed {} account(s) ({} skipped), {} channel record(s)",
            summary.accounts_indexed, summary.accounts_skipped, summary.channels_recorded
        );
        Ok(())
    };
    finish(run.await)
}

#[derive(Clone, Debug)]
pub struct MigrateArgs {
    pub source: String,
    pub destination: String,
    pub account: Option<String>,
}

/// `migrate`: mirror one channel into another with resumable progress.
pub async fn migrate(ctx: &EngineContext, args: MigrateArgs, cancel: &CancellationToken) -> i32 {
    let service = MirrorService::new(ctx.store.clone(), Arc::clone(&ctx.pool));
    let run = async {
        let report = service
            .mirror(
                &EntityRef::parse(&args.source)?,
                &EntityRef::parse(&args.destination)?,
                args.account.as_deref(),
                cancel,
            )
            .await?;
        println!(
            "mirrored {} message(s), mapped {} topic(s), last id {}",
            report.messages_mirrored, report.topics_mapped, report.last_message_id
        );
        Ok(())
    };
    finish(run.await)
}

/// `rollback`: undo a previous migration (best effort).
pub async fn rollback(ctx: &EngineContext, args: MigrateArgs, _cancel: &CancellationToken) -> i32 {
    let service = MirrorService::new(ctx.store.clone(), Arc::clone(&ctx.pool));
    let run = async {
        let deleted = service
            .rollback(
                &EntityRef::parse(&args.source)?,
                &EntityRef::parse(&args.destination)?,
                args.account.as_deref(),
            )
            .await?;
        println!("deleted {deleted} mirrored message(s)");
        Ok(())
    };
    finish(run.await)
}

/// Drain the persistent file-forward queue once.
pub async fn drain_queue(
    ctx: &EngineContext,
    account: Option<String>,
    cancel: &CancellationToken,
) -> i32 {
    let run = async {
        let worker = QueueWorker::new(
            Arc::clone(&ctx.config),
            ctx.store.clone(),
            Arc::clone(&ctx.pool),
        )
        .await?;
        let summary = worker.drain(account.as_deref(), cancel).await?;
        println!(
            "queue: {} processed, {} succeeded, {} failed",
            summary.processed, summary.succeeded, summary.failed
        );
        Ok(())
    };
    finish(run.await)
}
