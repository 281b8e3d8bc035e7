//! Consume `PgQueue` jobs to run data syncs.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sync_common::metrics::{serve, setup_metrics_router};
use sync_common::pgqueue::PgQueue;
use sync_engine::catalog::StaticCatalog;
use sync_engine::pipeline::SyncPipeline;
use sync_engine::store::postgres::PgStore;
use sync_worker::config::Config;
use sync_worker::error::WorkerError;
use sync_worker::worker::SyncWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let catalog = StaticCatalog::from_file(&config.catalog_path)
        .map_err(WorkerError::from)
        .with_context(|| format!("failed to load catalog from {}", config.catalog_path))?;
    info!(interfaces = catalog.len(), "loaded interface catalog");

    let executions = PgStore::new(&config.database_url, config.max_pg_connections)
        .await
        .map_err(WorkerError::from)?;
    let source = PgStore::new(config.source_database_url(), config.max_pg_connections)
        .await
        .map_err(WorkerError::from)?;
    let target = PgStore::new(config.target_database_url(), config.max_pg_connections)
        .await
        .map_err(WorkerError::from)?;
    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await
    .map_err(WorkerError::from)?;

    let pipeline = SyncPipeline::new(
        Arc::new(catalog),
        Arc::new(source),
        Arc::new(target),
        Arc::new(executions),
    )
    .with_settings(config.pipeline_settings());
    let worker = SyncWorker::new(
        &config.worker_name,
        queue,
        pipeline,
        config.poll_interval.0,
    );

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = match setup_metrics_router() {
            Ok(router) => router,
            Err(e) => {
                error!(error = %e, "failed to install metrics recorder");
                return;
            }
        };
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, "failed to serve metrics");
        }
    });

    let shutdown = worker.shutdown_flag();
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    worker.run().await?;

    Ok(())
}
