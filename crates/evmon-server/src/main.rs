//! Event Monitoring Server - Main entry point

use anyhow::Result;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use evmon_common::logging::{init_logging, LogConfig};
use evmon_server::{
    api::{self, ApiState},
    config::Config,
    db::{self, DocumentStore, PgDocumentStore},
    ingest::{self, extract::FetchStep, IngestionLedger, LogPipeline, PollingJob},
    scheduler::JobScheduler,
    sfdc::{EventLogApi, SfdcClient},
    streaming::{self, SfdcPushChannel, StreamingJob},
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("evmon-server")
        .filter_directives("evmon_server=debug,tower_http=info,sqlx=warn")
        .build()
        .with_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting event monitoring server");

    let config = Config::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        database = %config.monitoring.db_name,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database).await?;
    db::migrate(&pool).await?;

    let store: Arc<dyn DocumentStore> =
        Arc::new(PgDocumentStore::new(pool.clone(), config.monitoring.db_name.clone()));
    let client = Arc::new(SfdcClient::new(config.sfdc.clone())?);
    let api: Arc<dyn EventLogApi> = client.clone();

    let ledger = Arc::new(IngestionLedger::new(
        store.clone(),
        config.polling.storage_collection.log_files.clone(),
    ));
    let registry = ingest::default_registry(api.clone(), store.clone(), config.polling.flat_file.clone());
    let pipeline = Arc::new(LogPipeline::from_config(
        Arc::new(FetchStep::new(api.clone())),
        &registry,
        &config.polling,
        ledger,
    ));
    info!(steps = ?pipeline.step_names(), "Pipeline assembled");

    let scheduler = Arc::new(JobScheduler::new(config.scheduler.clone()));
    let fatal = scheduler.fatal_signal();

    let push = Arc::new(SfdcPushChannel::new(client.clone(), config.streaming.clone()));
    for topic in &config.streaming.topics {
        scheduler.now(Arc::new(StreamingJob::new(topic.clone(), push.clone(), store.clone())));
    }

    let every = Duration::from_secs(config.polling.every_secs);
    for event_type in &config.polling.types {
        scheduler.every(
            every,
            Arc::new(PollingJob::new(
                event_type.clone(),
                config.sfdc.interval.clone(),
                api.clone(),
                pipeline.clone(),
            )),
        );
    }

    let app = api::router(ApiState {
        db: pool,
        scheduler: scheduler.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status API listening");

    let stop_serving = CancellationToken::new();
    let server = tokio::spawn({
        let stop = stop_serving.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }
    });

    let abort_reason = tokio::select! {
        _ = shutdown_signal() => None,
        reason = fatal.raised() => Some(reason),
    };

    stop_serving.cancel();

    let pattern = streaming::shutdown_pattern()?;
    scheduler.cancel_matching(&pattern);

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    if tokio::time::timeout(timeout, scheduler.stop()).await.is_err() {
        warn!(timeout_secs = timeout.as_secs(), "Jobs still running at shutdown timeout");
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Status API exited with an error"),
        Err(e) => warn!(error = %e, "Status API task failed"),
    }

    match abort_reason {
        Some(reason) => Err(anyhow::anyhow!("Aborted: {}", reason)),
        None => {
            info!("Server shut down gracefully");
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("Received terminate signal, starting graceful shutdown"),
    }
}
