use crate::domain::BatchWorker;
use common::domain::WorkerControl;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runner module owning the batch worker's lifetime.
///
/// The worker can also be started and stopped at runtime through
/// [`WorkerControl`]; on shutdown it is always stopped and awaited.
pub struct TelemetryWorker {
    worker: Arc<BatchWorker>,
    autostart: bool,
}

impl TelemetryWorker {
    pub fn new(worker: Arc<BatchWorker>, autostart: bool) -> Self {
        debug!(autostart, "Initializing telemetry worker module");
        Self { worker, autostart }
    }

    pub fn control(&self) -> Arc<dyn WorkerControl> {
        self.worker.clone()
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(
        CancellationToken,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
    > {
        move |ctx| {
            Box::pin(async move {
                if self.autostart {
                    self.worker.start().await?;
                }

                ctx.cancelled().await;
                info!("stopping telemetry worker");
                self.worker.shutdown().await;
                Ok(())
            })
        }
    }
}
