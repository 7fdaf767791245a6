use async_trait::async_trait;
use common::domain::{
    with_timeout, DomainResult, QueueBackend, TelemetryQueue, TelemetrySink, TimeSeriesRecord,
    WorkerControl, WorkerStats,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BatchWorkerConfig {
    /// Upper bound on entries drained per tick.
    pub batch_size: usize,
    pub interval: Duration,
    /// Bound on each queue and sink call.
    pub io_timeout: Duration,
}

impl Default for BatchWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_TICK_INTERVAL,
            io_timeout: Duration::from_secs(5),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The queue has no durable cursor to drain.
    Skipped,
    Empty,
    Written(usize),
    /// The sink rejected the batch; it was committed anyway.
    Dropped(usize),
}

#[derive(Default)]
struct Counters {
    batches_written: AtomicU64,
    records_written: AtomicU64,
    batches_dropped: AtomicU64,
}

struct Pipeline {
    queue: Arc<dyn TelemetryQueue>,
    sink: Arc<dyn TelemetrySink>,
    config: BatchWorkerConfig,
    counters: Counters,
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically drains the durable queue into the time-series sink.
///
/// `Stopped -> Running -> Stopped`. Ticks run inside a single task, so a
/// slow write delays the next tick instead of overlapping with it. A
/// failed write drops the batch: it is logged, counted and committed.
pub struct BatchWorker {
    pipeline: Arc<Pipeline>,
    running: Mutex<Option<RunningLoop>>,
}

impl BatchWorker {
    pub fn new(
        queue: Arc<dyn TelemetryQueue>,
        sink: Arc<dyn TelemetrySink>,
        config: BatchWorkerConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                queue,
                sink,
                config,
                counters: Counters::default(),
            }),
            running: Mutex::new(None),
        }
    }

    /// Run one drain cycle.
    pub async fn tick(&self) -> DomainResult<TickOutcome> {
        self.pipeline.tick().await
    }

    /// Stop and wait for the loop task, including any in-flight write.
    pub async fn shutdown(&self) {
        let running = self.take_running();
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                error!(error = %e, "batch worker task panicked");
            }
            info!("batch worker shut down");
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    fn take_running(&self) -> Option<RunningLoop> {
        match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn spawn_loop(&self) -> RunningLoop {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let pipeline = self.pipeline.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pipeline.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pipeline.tick().await {
                            warn!(error = %e, "batch worker tick failed");
                        }
                    }
                }
            }

            debug!("batch worker loop exited");
        });

        RunningLoop { token, handle }
    }
}

#[async_trait]
impl WorkerControl for BatchWorker {
    async fn start(&self) -> DomainResult<bool> {
        if self.is_running() {
            debug!("batch worker already running");
            return Ok(false);
        }

        with_timeout(
            "sink schema",
            self.pipeline.config.io_timeout,
            self.pipeline.sink.ensure_schema(),
        )
        .await?;

        let mut guard = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Another caller may have started the loop while the schema was checked
        if guard.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(false);
        }
        *guard = Some(self.spawn_loop());

        info!(
            batch_size = self.pipeline.config.batch_size,
            interval_ms = self.pipeline.config.interval.as_millis() as u64,
            "batch worker started"
        );
        Ok(true)
    }

    async fn stop(&self) -> bool {
        match self.take_running() {
            Some(running) => {
                // The task finishes a write in progress before it sees the cancellation
                running.token.cancel();
                info!("batch worker stopped");
                true
            }
            None => false,
        }
    }

    fn stats(&self) -> WorkerStats {
        let counters = &self.pipeline.counters;
        WorkerStats {
            running: self.is_running(),
            batches_written: counters.batches_written.load(Ordering::Relaxed),
            records_written: counters.records_written.load(Ordering::Relaxed),
            batches_dropped: counters.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Pipeline {
    async fn tick(&self) -> DomainResult<TickOutcome> {
        if self.queue.backend() != QueueBackend::Durable {
            return Ok(TickOutcome::Skipped);
        }

        let batch = with_timeout(
            "queue read",
            self.config.io_timeout,
            self.queue.read_batch(self.config.batch_size),
        )
        .await?;

        let Some(batch) = batch else {
            return Ok(TickOutcome::Skipped);
        };
        if batch.is_empty() {
            return Ok(TickOutcome::Empty);
        }

        let records: Vec<TimeSeriesRecord> =
            batch.entries.iter().map(TimeSeriesRecord::from).collect();
        let count = records.len();

        let outcome = if records.is_empty() {
            TickOutcome::Empty
        } else {
            match with_timeout(
                "sink write",
                self.config.io_timeout,
                self.sink.write_batch(records),
            )
            .await
            {
                Ok(()) => {
                    self.counters.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .records_written
                        .fetch_add(count as u64, Ordering::Relaxed);
                    info!(batch_size = count, "wrote telemetry batch");
                    TickOutcome::Written(count)
                }
                Err(e) => {
                    self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    error!(batch_size = count, error = %e, "sink write failed, dropping batch");
                    TickOutcome::Dropped(count)
                }
            }
        };

        with_timeout(
            "queue commit",
            self.config.io_timeout,
            self.queue.commit(&batch),
        )
        .await?;

        Ok(outcome)
    }
}
