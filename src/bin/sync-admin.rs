/// Operator tool for the sync pipeline.
///
/// Usage: sync-admin <COMMAND>
///   approve <ID>                 Approve an announcement and publish its jobs
///   reject <ID>                  Reject an announcement
///   dispatch                     Publish every pending outbox entry
///   requeue <QUEUE> [--max N]    Move rejected deliveries back to ready
///   stats <QUEUE>                Show ready/rejected counts
///   revocations [--limit N]      List scheduled revocations
///   cancel-revocation <UUID>     Drop a scheduled revocation
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use enchiridion_sync::config::Config;
use enchiridion_sync::db::{self, store::PgAnnouncementStore};
use enchiridion_sync::queue::{self, redis::RedisBroker, Broker};
use enchiridion_sync::services::approval::ApprovalService;
use enchiridion_sync::services::outbox::OutboxDispatcher;
use enchiridion_sync::services::revocation::{
    RedisTimerStore, RevocationScheduler, SchedulerSettings, SystemClock, TimerStore,
};

#[derive(Parser)]
#[command(name = "sync-admin", about = "Operate the announcement sync pipeline")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Approve an announcement and publish its sync and expiration jobs
    Approve { id: i32 },
    /// Reject an announcement
    Reject { id: i32 },
    /// Publish every pending outbox entry
    Dispatch,
    /// Move rejected deliveries of a queue back to ready
    Requeue {
        queue: String,
        #[arg(long, default_value_t = 1000)]
        max: usize,
    },
    /// Show ready/rejected counts of a queue
    Stats { queue: String },
    /// List scheduled revocations, soonest first
    Revocations {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Drop a scheduled revocation
    CancelRevocation { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let (errors_tx, errors_rx) = mpsc::channel(16);
    tokio::spawn(queue::log_transport_errors(errors_rx));
    let broker = RedisBroker::connect(&redis_client, "admin", errors_tx)
        .await
        .context("failed to open broker connection")?;
    let shared_broker: Arc<dyn Broker> = broker.clone();

    match args.command {
        Command::Approve { id } => decide(&config, shared_broker, id, true).await?,
        Command::Reject { id } => decide(&config, shared_broker, id, false).await?,
        Command::Dispatch => {
            let (_, dispatcher) = dispatcher(&config, shared_broker).await?;
            let published = dispatcher.dispatch_pending().await?;
            tracing::info!("Published {} outbox entry(ies)", published);
        }
        Command::Requeue { queue, max } => {
            let handle = broker.open_queue(&queue).await?;
            let returned = handle.return_rejected(max).await?;
            tracing::info!("Returned {} rejected delivery(ies) to {}", returned, queue);
        }
        Command::Stats { queue } => {
            let handle = broker.open_queue(&queue).await?;
            let stats = handle.stats().await?;
            println!("{queue}: ready={} rejected={}", stats.ready, stats.rejected);
        }
        Command::Revocations { limit } => {
            let timers = timer_store(&redis_client).await?;
            println!("{} revocation(s) pending", timers.pending().await?);
            for task in timers.list(limit).await? {
                println!(
                    "{}  due {}  device {}  {}  attempts={}",
                    task.id, task.due_at, task.job.device_id, task.job.filename, task.attempts
                );
            }
        }
        Command::CancelRevocation { id } => {
            let timers = timer_store(&redis_client).await?;
            let scheduler = RevocationScheduler::new(
                timers,
                shared_broker,
                Arc::new(SystemClock),
                SchedulerSettings {
                    poll_interval: config.revocation_poll_interval(),
                    claim_limit: config.revocation_claim_limit,
                    lease: config.revocation_lease(),
                },
            );
            if scheduler.cancel(id).await? {
                tracing::info!("Revocation {} cancelled", id);
            } else {
                anyhow::bail!("Revocation {} is not scheduled (unknown or already firing)", id);
            }
        }
    }

    Ok(())
}

async fn decide(
    config: &Config,
    broker: Arc<dyn Broker>,
    id: i32,
    approved: bool,
) -> anyhow::Result<()> {
    let (store, dispatcher) = dispatcher(config, broker).await?;
    let outcome = ApprovalService::new(store, dispatcher)
        .approve(id, approved)
        .await?;
    tracing::info!(
        "Announcement {} is now {} ({} job(s) queued, {} published)",
        outcome.announcement_id,
        outcome.status,
        outcome.jobs,
        outcome.dispatched
    );
    Ok(())
}

async fn dispatcher(
    config: &Config,
    broker: Arc<dyn Broker>,
) -> anyhow::Result<(Arc<PgAnnouncementStore>, Arc<OutboxDispatcher>)> {
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(PgAnnouncementStore::new(pool));
    let dispatcher = Arc::new(OutboxDispatcher::new(
        store.clone(),
        broker,
        config.outbox_batch_size,
    ));
    Ok((store, dispatcher))
}

async fn timer_store(client: &redis::Client) -> anyhow::Result<Arc<dyn TimerStore>> {
    let conn = client.get_multiplexed_async_connection().await?;
    Ok(Arc::new(RedisTimerStore::new(conn)))
}
