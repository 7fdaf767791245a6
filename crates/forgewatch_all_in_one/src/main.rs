mod config;

use common::auth::{HmacSignatureService, ReplayWindow};
use common::clickhouse::{ClickHouseClient, ClickHouseSettings, ClickHouseTelemetryRepository};
use common::domain::{
    InMemoryDeviceRegistry, RecentTelemetry, TelemetryQueue, VolatileTelemetryQueue,
};
use common::nats::{JetStreamQueueConfig, JetStreamTelemetryQueue, NatsClient, StreamLimits};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use config::{QueueKind, ServiceConfig};
use forgewatch_runner::Runner;
use ingestion_api::domain::{
    AggregationService, AggregationSource, IngestionMetrics, IngestionService,
};
use ingestion_api::ingestion_api::IngestionApi;
use ingestion_api::rest::{ApiServerConfig, AppState, CorsConfig, HttpLoggingConfig};
use std::sync::Arc;
use std::time::Duration;
use telemetry_worker::domain::{BatchWorker, BatchWorkerConfig};
use telemetry_worker::telemetry_worker::TelemetryWorker;
use tracing::{debug, error, info, warn};

const JETSTREAM_FETCH_WAIT: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let queue_kind = match config.validate() {
        Ok(kind) => kind,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize telemetry (tracing + optional OpenTelemetry export)
    let telemetry_config =
        TelemetryConfig::new(config.otel_service_name.clone(), config.log_level.clone())
            .with_otlp_endpoint(config.otel_enabled.then(|| config.otel_endpoint.clone()));
    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&telemetry_config) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        queue_backend = ?queue_kind,
        store_configured = config.clickhouse_url().is_some(),
        otel_enabled = config.otel_enabled,
        "Starting forgewatch-all-in-one service"
    );
    debug!(
        http_port = config.http_port,
        nats_stream = %config.nats_stream,
        clickhouse_table = %config.clickhouse_table,
        "Configuration loaded"
    );

    if config.org_secret.is_empty() {
        warn!("org_secret is empty: every ingestion request will be rejected");
    }

    let deps = match initialize_shared_dependencies(&config, queue_kind).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize shared dependencies: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let io_timeout = Duration::from_millis(config.io_timeout_ms);
    let metrics = Arc::new(IngestionMetrics::new());

    let ingestion_service = Arc::new(IngestionService::new(
        deps.registry.clone(),
        deps.queue.clone(),
        Arc::new(HmacSignatureService::new()),
        ReplayWindow::from_millis(config.replay_window_ms),
        config.org_secret.clone(),
        io_timeout,
        metrics,
    ));

    let aggregation_source = match (&deps.repository, &deps.recent) {
        (Some(repository), _) => AggregationSource::Store(repository.clone()),
        (None, Some(recent)) => AggregationSource::Memory {
            recent: recent.clone(),
            lookback: Duration::from_secs(config.memory_lookback_secs),
        },
        (None, None) => {
            error!("No aggregation source available");
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };
    let aggregation_service = Arc::new(AggregationService::new(
        aggregation_source,
        io_timeout,
        config.max_buckets,
    ));

    // The worker only runs when there is a durable cursor to drain and a sink to drain into
    let telemetry_worker = match (queue_kind, &deps.repository) {
        (QueueKind::JetStream, Some(repository)) => {
            let worker = Arc::new(BatchWorker::new(
                deps.queue.clone(),
                repository.clone(),
                BatchWorkerConfig {
                    batch_size: config.worker_batch_size,
                    interval: Duration::from_millis(config.worker_interval_ms),
                    io_timeout,
                },
            ));
            Some(TelemetryWorker::new(worker, config.worker_autostart))
        }
        (QueueKind::Memory, Some(_)) => {
            warn!("ClickHouse is configured but the memory queue has no batch worker path; nothing will be persisted");
            None
        }
        _ => None,
    };

    let state = AppState {
        ingestion: ingestion_service,
        aggregation: aggregation_service,
        queue: deps.queue.clone(),
        worker: telemetry_worker.as_ref().map(TelemetryWorker::control),
        sink_configured: deps.repository.is_some(),
    };

    let api_config = ApiServerConfig {
        host: config.http_host.clone(),
        port: config.http_port,
        logging_config: HttpLoggingConfig::new(config.ignored_paths()),
        cors_config: CorsConfig::from_comma_separated(&config.cors_allowed_origins),
    };
    let ingestion_api = IngestionApi::new(state, api_config);

    // Build runner with all processes
    let mut runner = Runner::new()
        .with_named_process("ingestion_api", ingestion_api.into_runner_process());

    if let Some(worker) = telemetry_worker {
        runner = runner.with_named_process("telemetry_worker", worker.into_runner_process());
    }

    let nats_client = deps.nats_client;
    runner = runner
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            if let Some(client) = nats_client.and_then(|client| Arc::try_unwrap(client).ok()) {
                client.close().await;
            }

            // Shutdown telemetry and flush pending traces and logs
            shutdown_telemetry(telemetry_providers);

            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    let code = runner.run().await;
    std::process::exit(code);
}

struct SharedDependencies {
    registry: Arc<InMemoryDeviceRegistry>,
    queue: Arc<dyn TelemetryQueue>,
    /// Retained window, only available from the in-memory queue
    recent: Option<Arc<dyn RecentTelemetry>>,
    repository: Option<Arc<ClickHouseTelemetryRepository>>,
    nats_client: Option<Arc<NatsClient>>,
}

async fn initialize_shared_dependencies(
    config: &ServiceConfig,
    queue_kind: QueueKind,
) -> anyhow::Result<SharedDependencies> {
    let credentials = InMemoryDeviceRegistry::parse_credentials(&config.devices)?;
    info!(devices = credentials.len(), "Seeding device registry");
    let registry = Arc::new(InMemoryDeviceRegistry::new(credentials));

    let (queue, recent, nats_client): (
        Arc<dyn TelemetryQueue>,
        Option<Arc<dyn RecentTelemetry>>,
        Option<Arc<NatsClient>>,
    ) = match queue_kind {
        QueueKind::Memory => {
            info!(capacity = config.queue_capacity, "Using in-memory queue");
            let queue = Arc::new(VolatileTelemetryQueue::new(config.queue_capacity));
            (queue.clone(), Some(queue), None)
        }
        QueueKind::JetStream => {
            info!("Initializing NATS JetStream queue...");
            let client = Arc::new(
                NatsClient::connect(
                    &config.nats_url,
                    Duration::from_secs(config.startup_timeout_secs),
                )
                .await?,
            );
            client
                .ensure_stream(
                    &config.nats_stream,
                    &config.nats_subject,
                    StreamLimits {
                        max_age: Duration::from_secs(config.nats_max_age_secs),
                        max_bytes: config.nats_max_bytes,
                    },
                )
                .await?;
            let queue = JetStreamTelemetryQueue::new(
                client.create_consumer_client(),
                client.create_publisher_client(),
                JetStreamQueueConfig {
                    stream: config.nats_stream.clone(),
                    subject: config.nats_subject.clone(),
                    consumer_name: config.nats_consumer.clone(),
                    fetch_wait: JETSTREAM_FETCH_WAIT,
                },
            )
            .await?;
            (Arc::new(queue), None, Some(client))
        }
    };

    let repository = match config.clickhouse_url() {
        Some(url) => {
            info!("Initializing ClickHouse...");
            let client = ClickHouseClient::new(&ClickHouseSettings {
                url: url.to_string(),
                database: config.clickhouse_database.clone(),
                username: config.clickhouse_username.clone(),
                password: config.clickhouse_password.clone(),
            });
            client.ping().await?;
            Some(Arc::new(ClickHouseTelemetryRepository::new(
                client,
                config.clickhouse_table.clone(),
            )))
        }
        None => None,
    };

    Ok(SharedDependencies {
        registry,
        queue,
        recent,
        repository,
        nats_client,
    })
}
