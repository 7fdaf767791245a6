#![cfg(feature = "integration-tests")]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use common::auth::{sign_payload, HmacSignatureService, ReplayWindow};
use common::clickhouse::{ClickHouseClient, ClickHouseSettings, ClickHouseTelemetryRepository};
use common::domain::{DeviceCredential, InMemoryDeviceRegistry, TelemetryQueue, TelemetrySink};
use common::nats::{JetStreamQueueConfig, JetStreamTelemetryQueue, NatsClient, StreamLimits};
use http_body_util::BodyExt;
use ingestion_api::domain::{
    AggregationService, AggregationSource, IngestionMetrics, IngestionService,
};
use ingestion_api::rest::{build_router, ApiServerConfig, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use telemetry_worker::domain::{BatchWorker, BatchWorkerConfig, TickOutcome};
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, Image};
use testcontainers_modules::clickhouse::ClickHouse;
use tower::ServiceExt;

const ORG_SECRET: &str = "org-secret";
const DEVICE_SECRET: &str = "secret-001";

/// ClickHouse 24.10 exposing the HTTP interface
#[derive(Debug, Clone)]
struct ClickHouse24 {
    inner: ClickHouse,
    ports: Vec<ContainerPort>,
}

impl Default for ClickHouse24 {
    fn default() -> Self {
        Self {
            inner: ClickHouse::default(),
            ports: vec![ContainerPort::Tcp(8123)],
        }
    }
}

impl Image for ClickHouse24 {
    fn name(&self) -> &str {
        "clickhouse/clickhouse-server"
    }

    fn tag(&self) -> &str {
        "24.10"
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        self.inner.ready_conditions()
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<
        Item = (
            impl Into<std::borrow::Cow<'_, str>>,
            impl Into<std::borrow::Cow<'_, str>>,
        ),
    > {
        self.inner.env_vars()
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &self.ports
    }
}

#[derive(Debug, Clone)]
struct NatsWithJetStream {
    ports: Vec<ContainerPort>,
}

impl Default for NatsWithJetStream {
    fn default() -> Self {
        Self {
            ports: vec![ContainerPort::Tcp(4222)],
        }
    }
}

impl Image for NatsWithJetStream {
    fn name(&self) -> &str {
        "nats"
    }

    fn tag(&self) -> &str {
        "latest"
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        vec![WaitFor::seconds(3)]
    }

    fn cmd(&self) -> impl IntoIterator<Item = impl Into<std::borrow::Cow<'_, str>>> {
        vec!["--js"]
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &self.ports
    }
}

struct Pipeline {
    _nats: ContainerAsync<NatsWithJetStream>,
    _clickhouse: ContainerAsync<ClickHouse24>,
    clickhouse_client: ClickHouseClient,
    state: AppState,
    worker: Arc<BatchWorker>,
}

async fn setup() -> Pipeline {
    let nats = NatsWithJetStream::default().start().await.unwrap();
    let nats_host = nats.get_host().await.unwrap();
    let nats_port = nats.get_host_port_ipv4(4222).await.unwrap();
    let nats_client = NatsClient::connect(
        &format!("nats://{}:{}", nats_host, nats_port),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    nats_client
        .ensure_stream("telemetry", "telemetry.ingest", StreamLimits::default())
        .await
        .unwrap();

    let queue: Arc<dyn TelemetryQueue> = Arc::new(
        JetStreamTelemetryQueue::new(
            nats_client.create_consumer_client(),
            nats_client.create_publisher_client(),
            JetStreamQueueConfig {
                stream: "telemetry".to_string(),
                subject: "telemetry.ingest".to_string(),
                consumer_name: "telemetry-worker".to_string(),
                fetch_wait: Duration::from_millis(500),
            },
        )
        .await
        .unwrap(),
    );

    let clickhouse = ClickHouse24::default().start().await.unwrap();
    let ch_host = clickhouse.get_host().await.unwrap();
    let ch_port = clickhouse.get_host_port_ipv4(8123).await.unwrap();
    let clickhouse_client = ClickHouseClient::new(&ClickHouseSettings {
        url: format!("http://{}:{}", ch_host, ch_port),
        database: "default".to_string(),
        username: "default".to_string(),
        password: String::new(),
    });
    clickhouse_client.ping().await.unwrap();
    let repository = Arc::new(ClickHouseTelemetryRepository::new(
        clickhouse_client.clone(),
        "telemetry".to_string(),
    ));
    repository.ensure_schema().await.unwrap();

    let io_timeout = Duration::from_secs(5);
    let worker = Arc::new(BatchWorker::new(
        queue.clone(),
        repository.clone(),
        BatchWorkerConfig {
            batch_size: 50,
            // Never started; the tests drive ticks themselves
            interval: Duration::from_secs(3600),
            io_timeout,
        },
    ));

    let ingestion = IngestionService::new(
        Arc::new(InMemoryDeviceRegistry::new(vec![DeviceCredential {
            device_id: "dev-001".to_string(),
            shared_secret: DEVICE_SECRET.to_string(),
        }])),
        queue.clone(),
        Arc::new(HmacSignatureService::new()),
        ReplayWindow::default(),
        ORG_SECRET.to_string(),
        io_timeout,
        Arc::new(IngestionMetrics::new()),
    );
    let aggregation =
        AggregationService::new(AggregationSource::Store(repository), io_timeout, 10_080);

    let state = AppState {
        ingestion: Arc::new(ingestion),
        aggregation: Arc::new(aggregation),
        queue,
        worker: Some(worker.clone()),
        sink_configured: true,
    };

    Pipeline {
        _nats: nats,
        _clickhouse: clickhouse,
        clickhouse_client,
        state,
        worker,
    }
}

fn signed_request(power_w: f64) -> Request<Body> {
    let timestamp = Utc::now().to_rfc3339();
    let body = json!({
        "version": "1.0",
        "device_id": "dev-001",
        "ts": timestamp,
        "metrics": [
            {"name": "power_active_w", "value": power_w, "unit": "W"},
            {"name": "energy_kwh", "value": 0.5, "unit": "kWh"}
        ]
    });
    let signature =
        sign_payload(&HmacSignatureService::new(), DEVICE_SECRET, &timestamp, &body).unwrap();

    Request::builder()
        .method("POST")
        .uri("/api/telemetry")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", ORG_SECRET))
        .header("x-device-id", "dev-001")
        .header("x-timestamp", timestamp)
        .header("x-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let router = build_router(state.clone(), &ApiServerConfig::default());
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_ingested_telemetry_reaches_clickhouse() {
    // Arrange
    let pipeline = setup().await;

    // Act
    for power in [100.0, 200.0, 300.0] {
        let (status, body) = send(&pipeline.state, signed_request(power)).await;
        assert_eq!(status, StatusCode::OK, "unexpected body: {}", body);
    }
    let outcome = pipeline.worker.tick().await.unwrap();

    // Assert
    assert_eq!(outcome, TickOutcome::Written(3));

    let count: u64 = pipeline
        .clickhouse_client
        .inner()
        .query("SELECT count() FROM telemetry")
        .fetch_one()
        .await
        .unwrap();
    assert_eq!(count, 3);

    let request = Request::builder()
        .uri("/api/telemetry/aggregates?device_id=dev-001")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&pipeline.state, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "store");
    assert_eq!(body["kpis"]["currentPowerW"], 300.0);
}

#[tokio::test]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_worker_does_not_rewrite_committed_entries() {
    // Arrange
    let pipeline = setup().await;
    let (status, _) = send(&pipeline.state, signed_request(150.0)).await;
    assert_eq!(status, StatusCode::OK);

    // Act
    let first = pipeline.worker.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = pipeline.worker.tick().await.unwrap();

    // Assert
    assert_eq!(first, TickOutcome::Written(1));
    assert_eq!(second, TickOutcome::Empty);
}
