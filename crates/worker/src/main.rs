use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use eventing_core::properties::payload_only;
use eventing_events::{EventBus, InMemoryEventBus, JobNotification};
use eventing_infra::JobHandlerConfig;
use eventing_infra::jobs::{
    BusDispatcher, InMemoryJobStore, JobCallbacks, JobConsumer, JobEventHandler, JobHandle, JobResult, JobStore,
    PostgresJobStore,
};

const CONSUMER_THREADS_ENV: &str = "EVENTING_CONSUMER_THREADS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventing_observability::init();

    let config = JobHandlerConfig::from_env();

    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPool::connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresJobStore::new(pool, tokio::runtime::Handle::current());
            store.ensure_schema().await.context("failed to prepare job table")?;
            tracing::info!("using Postgres job store");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; jobs are kept in memory only");
            InMemoryJobStore::arc()
        }
    };

    let dispatch_bus = Arc::new(InMemoryEventBus::<JobHandle>::requiring_subscriber());
    let notifications = Arc::new(InMemoryEventBus::<JobNotification>::new());
    let subscription = dispatch_bus.subscribe();

    let handler = Arc::new(
        JobEventHandler::builder(store, Arc::new(BusDispatcher::new(dispatch_bus)))
            .with_config(config.clone())
            .with_notifications(notifications)
            .start()
            .context("failed to start job handler")?,
    );

    let mut consumer = JobConsumer::new();
    consumer.register_handler("*", |job| {
        tracing::info!(
            job_path = %job.path,
            topic = %job.topic,
            retry_count = job.retry_count,
            payload = %serde_json::Value::Object(payload_only(&job.properties).into_iter().collect()),
            "processing job"
        );
        JobResult::Success
    });

    let consumer_threads = std::env::var(CONSUMER_THREADS_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(config.max_parallel_jobs);
    let callbacks: Arc<dyn JobCallbacks> = handler.clone();
    let consumer = consumer
        .spawn(subscription, callbacks, consumer_threads)
        .context("failed to start job consumer")?;

    tracing::info!(application = %handler.application_id(), "eventing worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    tokio::task::block_in_place(|| {
        handler.shutdown();
        consumer.shutdown();
    });
    Ok(())
}
