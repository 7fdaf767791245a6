mod config;

use chrono::Utc;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use config::AgentConfig;
use edge_agent::{EdgeAgent, EdgeAgentConfig, LocalBuffer, ReadingSimulator, SubmitOutcome};
use forgewatch_runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let telemetry_providers = match init_telemetry(&TelemetryConfig::new(
        "forgewatch-edge-agent",
        config.log_level.clone(),
    )) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    let buffer_path = config.buffer_path();
    let agent = match EdgeAgent::new(
        EdgeAgentConfig {
            endpoint: config.endpoint.clone(),
            org_secret: config.org_secret.clone(),
            device_id: config.device_id.clone(),
            device_secret: config.device_secret.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        },
        LocalBuffer::new(&buffer_path, config.buffer_max_entries),
    ) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!("Failed to create edge agent: {}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    info!(
        device_id = %config.device_id,
        endpoint = %config.endpoint,
        buffer = %buffer_path,
        "Starting edge agent"
    );

    let simulator = ReadingSimulator::new(
        config.device_id.clone(),
        config.power_base_w,
        Duration::from_millis(config.interval_ms),
    );

    let code = Runner::new()
        .with_named_process("edge_agent", move |ctx| {
            Box::pin(run_agent(agent, simulator, config, ctx))
        })
        .with_closer(move || async move {
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .run()
        .await;

    std::process::exit(code);
}

async fn run_agent(
    agent: Arc<EdgeAgent>,
    mut simulator: ReadingSimulator,
    config: AgentConfig,
    ctx: CancellationToken,
) -> anyhow::Result<()> {
    let mut readings = tokio::time::interval(Duration::from_millis(config.interval_ms));
    readings.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flushes = tokio::time::interval(Duration::from_secs(config.flush_interval_secs.max(1)));
    flushes.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = readings.tick() => {
                let envelope = simulator.next_envelope(Utc::now());
                match agent.submit(&envelope).await {
                    // The gateway is reachable again; drain what piled up
                    Ok(SubmitOutcome::Accepted { .. }) => flush(&agent).await,
                    Ok(SubmitOutcome::Buffered) => {}
                    Err(e) => warn!(error = %e, "telemetry rejected"),
                }
            }
            _ = flushes.tick() => flush(&agent).await,
        }
    }

    info!("Edge agent stopped");
    Ok(())
}

async fn flush(agent: &EdgeAgent) {
    match agent.buffer().is_empty().await {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = agent.flush_buffer().await {
                warn!(error = %e, "buffer flush failed");
            }
        }
        Err(e) => warn!(error = %e, "cannot read local buffer"),
    }
}
