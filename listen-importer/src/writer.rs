use std::sync::Arc;
use std::time;

use health::{ComponentStatus, HealthHandle, HealthRegistry};
use listen_common::retry::RetryPolicy;
use listen_common::store::{BatchWriter, ListenStore, StoreError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::dead_letter::DeadLetterFile;
use crate::error::ImportError;
use crate::queue::{BatchReceiver, Dequeued};
use crate::stats::ImportStats;

/// How long a writer may go without reporting before it is considered stalled.
/// Generous, since a single insert of a large batch can take a while.
const LIVENESS_DEADLINE_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stopped,
}

/// What a single writer did during the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub worker: usize,
    /// Whether the writer got a store connection at all.
    pub connected: bool,
    pub batches_written: u64,
    pub rows_inserted: u64,
    pub batches_failed: u64,
    pub retries: u64,
}

/// Settings shared by every writer of a pool.
#[derive(Clone)]
pub struct WriterOptions {
    /// How long to wait for a batch before reporting liveness and waiting again.
    pub idle_interval: time::Duration,
    pub retry_policy: RetryPolicy,
    pub dead_letter: Option<Arc<DeadLetterFile>>,
}

/// A set of writer tasks draining the same batch queue.
pub struct WriterPool {
    handles: Vec<JoinHandle<WriterReport>>,
}

impl WriterPool {
    /// Spawn `count` writers, each with its own connection from `store`.
    pub fn spawn<S>(
        count: usize,
        store: Arc<S>,
        receiver: BatchReceiver,
        options: WriterOptions,
        stats: Arc<ImportStats>,
        health: &HealthRegistry,
    ) -> Self
    where
        S: ListenStore + 'static,
    {
        let handles = (0..count)
            .map(|worker| {
                let liveness = health.register(
                    format!("writer-{worker}"),
                    ::time::Duration::seconds(LIVENESS_DEADLINE_SECONDS),
                );
                tokio::spawn(run_writer(
                    worker,
                    store.clone(),
                    receiver.clone(),
                    options.clone(),
                    stats.clone(),
                    liveness,
                ))
            })
            .collect();

        Self { handles }
    }

    /// Wait for every writer to drain the queue and stop.
    pub async fn join(self) -> Result<Vec<WriterReport>, ImportError> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let report = handle
                .await
                .map_err(|e| ImportError::WorkerPanicked(e.to_string()))?;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Drain the queue until it is closed and empty, inserting one batch at a time.
async fn run_writer<S: ListenStore>(
    worker: usize,
    store: Arc<S>,
    receiver: BatchReceiver,
    options: WriterOptions,
    stats: Arc<ImportStats>,
    liveness: HealthHandle,
) -> WriterReport {
    let mut report = WriterReport {
        worker,
        ..Default::default()
    };

    let mut writer = match store.writer().await {
        Ok(writer) => writer,
        Err(e) => {
            error!(worker, "failed to open a store connection: {}", e);
            liveness.report_status(ComponentStatus::Unhealthy);
            return report;
        }
    };

    report.connected = true;
    let mut state = WorkerState::Running;
    debug!(worker, ?state, "writer started");

    while state == WorkerState::Running {
        match receiver.recv_timeout(options.idle_interval).await {
            Dequeued::Idle => liveness.report_healthy(),
            Dequeued::Batch(batch) => {
                liveness.report_healthy();
                process_batch(worker, &mut writer, &batch, &options, &stats, &mut report).await;
                liveness.report_healthy();
            }
            Dequeued::Closed => state = WorkerState::Stopped,
        }
    }

    liveness.report_status(ComponentStatus::Stopped);
    debug!(worker, ?state, ?report, "writer stopped");
    report
}

async fn process_batch<W: BatchWriter>(
    worker: usize,
    writer: &mut W,
    batch: &Batch,
    options: &WriterOptions,
    stats: &ImportStats,
    report: &mut WriterReport,
) {
    let started = time::Instant::now();

    match insert_with_retry(worker, writer, batch, &options.retry_policy, report).await {
        Ok(inserted) => {
            let elapsed = started.elapsed().as_secs_f64();
            let rows = batch.len() as u64;
            stats.record_batch_written(rows, inserted);
            metrics::histogram!("listen_import_insert_duration_seconds").record(elapsed);
            report.batches_written += 1;
            report.rows_inserted += inserted;

            debug!(
                worker,
                batch = batch.sequence(),
                "inserted {} rows in {:.3}s, {} rows/s, total {}",
                inserted,
                elapsed,
                rows_per_second(rows, elapsed),
                stats.rows_written()
            );
        }
        Err(e) => {
            report.batches_failed += 1;
            let dead_lettered = dead_letter(worker, batch, options.dead_letter.as_deref(), &e).await;
            stats.record_batch_failed(dead_lettered);
        }
    }
}

async fn insert_with_retry<W: BatchWriter>(
    worker: usize,
    writer: &mut W,
    batch: &Batch,
    policy: &RetryPolicy,
    report: &mut WriterReport,
) -> Result<u64, StoreError> {
    let mut attempt = 1;
    loop {
        match writer.insert_batch(batch.listens()).await {
            Ok(inserted) => return Ok(inserted),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.retry_interval_with_jitter(attempt);
                warn!(
                    worker,
                    batch = batch.sequence(),
                    attempt,
                    "failed to insert batch, retrying in {:?}: {}",
                    delay,
                    e
                );
                report.retries += 1;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Park a failed batch in the dead letter file, or drop it when there is none.
/// Returns how many listens were kept.
async fn dead_letter(
    worker: usize,
    batch: &Batch,
    sink: Option<&DeadLetterFile>,
    cause: &StoreError,
) -> u64 {
    let Some(sink) = sink else {
        error!(
            worker,
            batch = batch.sequence(),
            "failed to insert rows, dropping {} listens: {}",
            batch.len(),
            cause
        );
        return 0;
    };

    match sink.write_batch(batch).await {
        Ok(written) => {
            error!(
                worker,
                batch = batch.sequence(),
                "failed to insert rows, wrote {} listens to {}: {}",
                written,
                sink.path().display(),
                cause
            );
            written
        }
        Err(e) => {
            error!(
                worker,
                batch = batch.sequence(),
                "failed to insert rows ({}) and to dead letter them, dropping {} listens: {}",
                cause,
                batch.len(),
                e
            );
            0
        }
    }
}

fn rows_per_second(rows: u64, elapsed_seconds: f64) -> u64 {
    if elapsed_seconds > 0.0 {
        (rows as f64 / elapsed_seconds) as u64
    } else {
        rows
    }
}

/// Log the per-writer totals once the pool is done.
pub fn log_reports(reports: &[WriterReport]) {
    for report in reports {
        info!(
            worker = report.worker,
            batches = report.batches_written,
            rows = report.rows_inserted,
            failed = report.batches_failed,
            retries = report.retries,
            "writer finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_per_second() {
        assert_eq!(rows_per_second(1000, 0.5), 2000);
        assert_eq!(rows_per_second(10, 0.0), 10);
    }
}
