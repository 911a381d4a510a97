use anyhow::{Context, Result};
use comicvault_cataloger::{
    api::{start_api_server, AppState},
    config::Config,
    retention::run_purge_loop,
    AzureOpenAiVisionClient, DeletionHandler, DeletionSaga, HttpSearchIndex, IngestionHandler,
    IngestionSettings, IngestionWorker, PgDocumentStore, S3ObjectStore, StatusQueryService,
};
use comicvault_pipeline::{ConsumerBuilder, PipelineProducer};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting ComicVault cataloger"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    config
        .kafka
        .validate()
        .context("Invalid Kafka configuration")?;

    // Initialize adapters
    let documents = Arc::new(
        PgDocumentStore::new(&config.database)
            .await
            .context("Failed to initialize document store")?,
    );

    if config.database.run_migrations {
        documents
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );
    let vision = Arc::new(
        AzureOpenAiVisionClient::new(&config.vision, config.vision_timeout())
            .context("Failed to initialize vision client")?,
    );
    let index = Arc::new(
        HttpSearchIndex::new(&config.search, config.search_timeout())
            .context("Failed to initialize search index client")?,
    );

    let producer = Arc::new(
        PipelineProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );

    // Workers
    let worker = Arc::new(IngestionWorker::new(
        objects.clone(),
        vision,
        documents.clone(),
        index.clone(),
        IngestionSettings::from(&config.ingestion),
    ));
    let saga = Arc::new(DeletionSaga::new(
        objects.clone(),
        documents.clone(),
        index.clone(),
    ));

    // One consumer group per queue
    let ingestion_consumer = Arc::new(
        ConsumerBuilder::new(config.kafka.clone())
            .group_suffix("ingestion")
            .with_dlq_producer(producer.clone())
            .build()
            .context("Failed to create ingestion consumer")?,
    );
    ingestion_consumer.subscribe(&[config.kafka.topics.image_uploaded.as_str()])?;

    let deletion_consumer = Arc::new(
        ConsumerBuilder::new(config.kafka.clone())
            .group_suffix("deletion")
            .with_dlq_producer(producer.clone())
            .build()
            .context("Failed to create deletion consumer")?,
    );
    deletion_consumer.subscribe(&[config.kafka.topics.delete_requested.as_str()])?;

    let cancel = CancellationToken::new();

    let ingestion_handle = {
        let consumer = ingestion_consumer.clone();
        let handler = Arc::new(IngestionHandler::new(worker));
        tokio::spawn(async move {
            if let Err(e) = consumer.run(handler).await {
                error!(error = %e, "Ingestion consumer error");
            }
        })
    };

    let deletion_handle = {
        let consumer = deletion_consumer.clone();
        let handler = Arc::new(DeletionHandler::new(saga));
        tokio::spawn(async move {
            if let Err(e) = consumer.run(handler).await {
                error!(error = %e, "Deletion consumer error");
            }
        })
    };

    let sweeper_handle = tokio::spawn(run_purge_loop(
        documents.clone(),
        config.purge_interval(),
        cancel.clone(),
    ));

    // API server
    let api_state = AppState {
        objects,
        documents: documents.clone(),
        status: Arc::new(StatusQueryService::new(documents.clone())),
        publisher: producer.clone(),
        owner_header: config.api.owner_header.clone(),
        max_upload_bytes: config.api.max_upload_bytes,
    };
    let api_config = config.api.clone();
    let api_shutdown = cancel.clone();
    let api_handle = tokio::spawn(async move {
        let shutdown = async move { api_shutdown.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Cataloger started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down cataloger");

    ingestion_consumer.shutdown();
    deletion_consumer.shutdown();
    cancel.cancel();

    for (name, handle) in [
        ("ingestion consumer", ingestion_handle),
        ("deletion consumer", deletion_handle),
        ("retention sweeper", sweeper_handle),
        ("api server", api_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, "Failed to flush pending events");
    }
    documents.close().await;

    info!("Cataloger stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
