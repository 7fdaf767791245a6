use crate::rest::{run_api_server, ApiServerConfig, AppState};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct IngestionApi {
    state: AppState,
    config: ApiServerConfig,
}

impl IngestionApi {
    pub fn new(state: AppState, config: ApiServerConfig) -> Self {
        debug!("Initializing ingestion API module");
        Self { state, config }
    }

    pub fn into_runner_process(
        self,
    ) -> impl FnOnce(
        CancellationToken,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
    > {
        move |ctx| Box::pin(async move { run_api_server(self.config, self.state, ctx).await })
    }
}
