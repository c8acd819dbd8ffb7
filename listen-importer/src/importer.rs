use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use listen_common::listen::{decode_line, Listen, ParseError};
use listen_common::store::ListenStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchAccumulator};
use crate::config::ImportConfig;
use crate::dead_letter::DeadLetterFile;
use crate::dedup::Deduplicator;
use crate::error::ImportError;
use crate::progress::ProgressReporter;
use crate::queue::{self, BatchSender, QueueError};
use crate::stats::{ImportStats, StatsSnapshot};
use crate::writer::{WriterOptions, WriterPool, WriterReport};

/// Outcome of a finished (or cancelled) import run.
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub stats: StatsSnapshot,
    pub writers: Vec<WriterReport>,
    pub elapsed: Duration,
    /// The run was stopped before the input was exhausted.
    pub cancelled: bool,
}

/// Runs one import: reads the dump, deduplicates it and feeds the writer pool.
pub struct Importer<S> {
    config: ImportConfig,
    store: Arc<S>,
    stats: Arc<ImportStats>,
    health: HealthRegistry,
    dead_letter: Option<Arc<DeadLetterFile>>,
    shutdown: CancellationToken,
}

impl<S: ListenStore + 'static> Importer<S> {
    pub fn new(config: ImportConfig, store: Arc<S>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(ImportStats::default()),
            health: HealthRegistry::new("liveness"),
            dead_letter: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterFile) -> Self {
        self.dead_letter = Some(Arc::new(dead_letter));
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Live counters, also readable while the import runs.
    pub fn stats(&self) -> Arc<ImportStats> {
        self.stats.clone()
    }

    pub async fn run<R>(self, mut input: R) -> Result<ImportSummary, ImportError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.config.validate()?;

        let (sender, receiver) = queue::bounded(self.config.queue_capacity);
        let pool = WriterPool::spawn(
            self.config.worker_count,
            self.store.clone(),
            receiver,
            WriterOptions {
                idle_interval: self.config.idle_interval,
                retry_policy: self.config.retry_policy,
                dead_letter: self.dead_letter.clone(),
            },
            self.stats.clone(),
            &self.health,
        );

        let mut producer = Producer {
            dedup: Deduplicator::new(self.config.dedup.clone(), self.stats.clone()),
            accumulator: BatchAccumulator::new(self.config.batch_size),
            progress: ProgressReporter::new(self.config.update_interval),
            stats: self.stats.clone(),
            sender,
            shutdown: self.shutdown.clone(),
        };

        info!(
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            queue_capacity = self.config.queue_capacity,
            "starting import"
        );

        let produced = producer.run(&mut input).await;
        let progress = producer.close();

        // Workers drain what was queued before the producer stopped, whatever the outcome.
        let writers = pool.join().await?;
        let outcome = produced?;
        if !writers.iter().any(|writer| writer.connected) {
            return Err(ImportError::NoWriters);
        }

        Ok(ImportSummary {
            stats: self.stats.snapshot(),
            writers,
            elapsed: progress.elapsed(),
            cancelled: outcome == ProducerOutcome::Cancelled,
        })
    }
}

/// Import a whole dump with the default health registry and no dead letter file.
pub async fn run_import<S, R>(
    config: ImportConfig,
    store: Arc<S>,
    input: R,
) -> Result<ImportSummary, ImportError>
where
    S: ListenStore + 'static,
    R: AsyncBufRead + Unpin,
{
    Importer::new(config, store).run(input).await
}

#[derive(Debug, PartialEq, Eq)]
enum ProducerOutcome {
    Exhausted,
    Cancelled,
}

/// Whether the producer may keep going after handing off listens.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

/// The sequential half of the pipeline: decode, sanitize, deduplicate, batch, enqueue.
struct Producer {
    dedup: Deduplicator,
    accumulator: BatchAccumulator,
    progress: ProgressReporter,
    stats: Arc<ImportStats>,
    sender: BatchSender,
    shutdown: CancellationToken,
}

impl Producer {
    async fn run<R>(&mut self, input: &mut R) -> Result<ProducerOutcome, ImportError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        let mut emitted = Vec::new();
        let mut line_number: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(self.cancelled());
            }

            line.clear();
            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(self.cancelled()),
                read = input.read_until(b'\n', &mut line) => read?,
            };
            if read == 0 {
                break;
            }
            line_number += 1;

            self.admit(&line, line_number, &mut emitted);
            if self.enqueue(&mut emitted).await? == Flow::Cancelled {
                return Ok(self.cancelled());
            }
        }

        self.dedup.finish(&mut emitted);
        if self.enqueue(&mut emitted).await? == Flow::Cancelled {
            return Ok(self.cancelled());
        }
        if let Some(batch) = self.accumulator.flush() {
            if self.send(batch).await? == Flow::Cancelled {
                return Ok(self.cancelled());
            }
        }

        debug!(lines = line_number, "input exhausted");
        Ok(ProducerOutcome::Exhausted)
    }

    /// Decode and sanitize one raw line and hand it to the deduplicator.
    fn admit(&mut self, line: &[u8], line_number: u64, emitted: &mut Vec<Listen>) {
        let decoded = std::str::from_utf8(line)
            .map_err(|_| ParseError::InvalidUtf8)
            .and_then(decode_line);

        match decoded {
            Ok(mut listen) => {
                self.stats.record_parsed();
                listen.sanitize();
                self.dedup.push(listen, emitted);
            }
            Err(e) => {
                self.stats.record_parse_error();
                debug!(line = line_number, "skipping line: {}", e);
            }
        }
    }

    /// Move finalized listens into batches and queue every sealed batch.
    async fn enqueue(&mut self, emitted: &mut Vec<Listen>) -> Result<Flow, ImportError> {
        for listen in emitted.drain(..) {
            self.progress.observe(self.stats.unique());
            if let Some(batch) = self.accumulator.push(listen) {
                if self.send(batch).await? == Flow::Cancelled {
                    return Ok(Flow::Cancelled);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Wait for room in the queue, giving up if the import is cancelled meanwhile.
    async fn send(&self, batch: Batch) -> Result<Flow, ImportError> {
        let sequence = batch.sequence();
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(batch = sequence, "import cancelled while waiting for the queue");
                Ok(Flow::Cancelled)
            }
            sent = self.sender.send(batch) => match sent {
                Ok(()) => Ok(Flow::Continue),
                Err(QueueError::Closed(batch)) => {
                    warn!(
                        batch = sequence,
                        "no writer left, {} listens were not written",
                        batch.len()
                    );
                    Err(ImportError::NoWriters)
                }
            },
        }
    }

    fn cancelled(&self) -> ProducerOutcome {
        warn!(
            buffered = self.dedup.buffered(),
            pending = self.accumulator.pending(),
            "import cancelled, discarding listens not yet queued"
        );
        ProducerOutcome::Cancelled
    }

    /// Close the queue so the writers stop once it is drained.
    fn close(self) -> ProgressReporter {
        if !self.sender.is_empty() {
            debug!(queued = self.sender.len(), "waiting for writers to drain the queue");
        }
        self.sender.close();
        self.progress
    }
}
