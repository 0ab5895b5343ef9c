//! Settlement worker process.
//!
//! Consumes transfer intents from Redis Streams, settles them against
//! PostgreSQL and dead-letters what cannot be settled. Configured through
//! `PAYFLOW_*` environment variables.

use std::sync::Arc;

use anyhow::{Context, bail};

use payflow_infra::event_bus::RedisStreamsBus;
use payflow_infra::store::postgres::connect;
use payflow_infra::{BusBackend, LedgerContext, PayflowConfig, PostgresLedgerStore};
use payflow_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PayflowConfig::from_env();

    let format = config.log.format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{e}; falling back to json");
        LogFormat::Json
    });
    payflow_observability::init_with(format, &config.log.level);

    if config.bus.backend != BusBackend::Redis {
        bail!("the settlement worker needs PAYFLOW_BUS_BACKEND=redis");
    }

    let pool = connect(&config.database)
        .await
        .context("connecting to postgres")?;
    let store = PostgresLedgerStore::new(pool);
    store.migrate().await.context("running migrations")?;

    let bus = Arc::new(
        RedisStreamsBus::connect(&config.bus)
            .await
            .context("connecting to redis")?,
    );

    tracing::info!(
        consumer = %config.bus.consumer,
        group = %config.bus.group,
        partitions = config.bus.partitions,
        concurrency = config.settlement.concurrency,
        "settlement worker starting"
    );

    let ctx = LedgerContext::new(store, bus.clone(), config);
    let handle = ctx.settlement_worker(bus).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested; draining in-flight settlements");

    let stats = handle.shutdown().await;
    tracing::info!(
        received = stats.received,
        committed = stats.committed,
        duplicates = stats.duplicates,
        retries = stats.retries,
        dead_lettered = stats.dead_lettered,
        ack_failures = stats.ack_failures,
        "settlement worker stopped"
    );
    Ok(())
}
