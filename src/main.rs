use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use enchiridion_sync::config::Config;
use enchiridion_sync::db::{self, store::PgAnnouncementStore};
use enchiridion_sync::models::job::EXPIRATION_QUEUE;
use enchiridion_sync::queue::{self, redis::RedisBroker, Broker};
use enchiridion_sync::services::expiration::ExpirationConsumer;
use enchiridion_sync::services::metrics;
use enchiridion_sync::services::outbox::OutboxDispatcher;
use enchiridion_sync::services::revocation::{
    RedisTimerStore, RevocationScheduler, SchedulerSettings, SystemClock, TimerStore,
};
use enchiridion_sync::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    let (errors_tx, errors_rx) = mpsc::channel(64);
    let error_logger = tokio::spawn(queue::log_transport_errors(errors_rx));

    let broker = RedisBroker::connect(&redis_client, &config.queue_connection_name, errors_tx)
        .await
        .context("failed to open broker connection")?;
    match broker.clean_dead_connections().await {
        Ok(0) => {}
        Ok(n) => info!("Returned {} unacked delivery(ies) from dead connections", n),
        Err(e) => warn!("Failed to clean dead connections: {}", e),
    }
    let shared_broker: Arc<dyn Broker> = broker.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Revocations
    let timers: Arc<dyn TimerStore> = Arc::new(RedisTimerStore::new(redis_conn.clone()));
    let scheduler = Arc::new(RevocationScheduler::new(
        timers.clone(),
        shared_broker.clone(),
        Arc::new(SystemClock),
        SchedulerSettings {
            poll_interval: config.revocation_poll_interval(),
            claim_limit: config.revocation_claim_limit,
            lease: config.revocation_lease(),
        },
    ));
    let scheduler_task = scheduler.clone().start(shutdown_rx.clone());

    // Outbox
    let store = Arc::new(PgAnnouncementStore::new(pool.clone()));
    let dispatcher = Arc::new(OutboxDispatcher::new(
        store,
        shared_broker.clone(),
        config.outbox_batch_size,
    ));
    let outbox_task = dispatcher.start(config.outbox_poll_interval(), shutdown_rx.clone());

    let metrics_task = metrics::start(timers, shutdown_rx.clone());

    // Expiration consumers
    let expirations = broker
        .open_queue(EXPIRATION_QUEUE)
        .await
        .context("failed to open expiration queue")?;
    expirations
        .start_consuming(config.queue_prefetch_limit, config.queue_poll_interval())
        .await
        .context("failed to start consuming expiration queue")?;
    for index in 0..config.expiration_consumers {
        let consumer = ExpirationConsumer::new(
            index,
            scheduler.clone(),
            config.expiration_settlement,
            config.report_batch_size,
        );
        let tag = consumer.name().to_string();
        expirations.add_consumer(&tag, Arc::new(consumer)).await?;
    }
    info!(
        "{} expiration consumer(s) started on {} ({} settlement)",
        config.expiration_consumers, EXPIRATION_QUEUE, config.expiration_settlement
    );

    // Ops server
    let app = routes::router(AppState {
        db: pool,
        redis: redis_conn,
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("sync-worker ops server listening on {}", addr);
    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, press Ctrl+C again to exit immediately");
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second interrupt, exiting");
            std::process::exit(1);
        }
    });

    broker.stop_all_consuming().await;
    let _ = shutdown_tx.send(true);

    for (name, task) in [
        ("revocation scheduler", scheduler_task),
        ("outbox dispatcher", outbox_task),
        ("metrics collector", metrics_task),
    ] {
        if let Err(e) = task.await {
            warn!("{} task failed: {}", name, e);
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Ops server error: {}", e),
        Err(e) => warn!("Ops server task failed: {}", e),
    }
    error_logger.abort();

    info!("sync-worker stopped");
    Ok(())
}
