//! Stream processor execution
//!
//! The [`StreamProcessor`] owns a static topology:
//!
//! ```text
//! sources ──poll──▶ coordinator ──route(hash(key) % N)──▶ partition workers ──▶ sink stage ──▶ sink
//!                        │                                   (operator + state)        │
//!                        └──── watermarks, checkpoint barriers ───────────▶            └─ acks ─▶ coordinator
//! ```
//!
//! The coordinator is the only producer into the worker queues, so records
//! of one partition are processed in arrival order. Every queue is a credit
//! channel: when the sink stalls, the queues fill and the coordinator stops
//! polling sources.
//!
//! Checkpoints are barrier aligned. A barrier is broadcast after the records
//! it covers; each worker snapshots its store when the barrier arrives and
//! the sink stage acknowledges once everything before the barrier is
//! written. When every partition has acknowledged, the checkpoint is saved
//! and the source positions are committed.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::worker::{OutputMessage, PartitionWorker, WorkerMessage};
use crate::backpressure::{self, CreditReceiver, CreditSender};
use crate::config::PipelineConfig;
use crate::core::{partition_for, JoinSide, Payload, Record};
use crate::error::{EngineError, Result};
use crate::operator::{OperatorSpec, Output, SideOutput};
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::source::{PositionToken, Source};
use crate::state::{
    open_backend, Checkpoint, CheckpointStorage, PartitionSnapshot, SourcePosition, StateSnapshot,
    StateStore,
};
use crate::watermark::{Watermark, WatermarkTracker};
use crate::window::{LateRecordStats, LateRecordTracker};

/// Sleep between polls when no source had data
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often task health is checked while waiting on acknowledgements
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// How long the sink stage may take to drain after a shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live counters shared by the coordinator, workers and sink stage
#[derive(Debug, Default)]
pub struct StatsCollector {
    records_in: AtomicU64,
    records_processed: AtomicU64,
    outputs_written: AtomicU64,
    side_outputs: AtomicU64,
    poison_records: AtomicU64,
    sink_retries: AtomicU64,
    dead_lettered: AtomicU64,
    checkpoints_completed: AtomicU64,
    last_checkpoint_id: AtomicU64,
    restarts: AtomicU64,
    current_watermark: AtomicI64,
}

impl StatsCollector {
    pub(crate) fn records_in(&self, count: usize) {
        self.records_in.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn poison_record(&self) {
        self.poison_records.fetch_add(1, Ordering::Relaxed);
    }

    fn outputs_written(&self, count: usize) {
        self.outputs_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn side_outputs(&self, count: usize) {
        self.side_outputs.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn sink_retry(&self) {
        self.sink_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn dead_lettered(&self, count: usize) {
        self.dead_lettered.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn checkpoint_completed(&self, checkpoint_id: u64) {
        self.checkpoints_completed.fetch_add(1, Ordering::Relaxed);
        self.last_checkpoint_id.store(checkpoint_id, Ordering::Relaxed);
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn watermark(&self, watermark: Watermark) {
        self.current_watermark.store(watermark.timestamp, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_processed: self.records_processed.load(Ordering::Relaxed),
            outputs_written: self.outputs_written.load(Ordering::Relaxed),
            side_outputs: self.side_outputs.load(Ordering::Relaxed),
            poison_records: self.poison_records.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            checkpoints_completed: self.checkpoints_completed.load(Ordering::Relaxed),
            last_checkpoint_id: self.last_checkpoint_id.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            current_watermark: self.current_watermark.load(Ordering::Relaxed),
        }
    }
}

/// Statistics for the stream processor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Records pulled from sources (replays included)
    pub records_in: u64,
    /// Records folded or joined by an operator
    pub records_processed: u64,
    /// Outputs accepted by the main or dead-letter sink
    pub outputs_written: u64,
    /// Late and poison records delivered to the side-output stage
    pub side_outputs: u64,
    pub poison_records: u64,
    pub sink_retries: u64,
    /// Outputs routed to the dead-letter sink
    pub dead_lettered: u64,
    pub checkpoints_completed: u64,
    pub last_checkpoint_id: u64,
    pub restarts: u64,
    /// Last global watermark broadcast to the workers
    pub current_watermark: i64,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every source reached end of stream and a final checkpoint was taken
    Completed,
    /// Stopped by a shutdown signal
    Stopped,
}

/// Result of [`StreamProcessor::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub outcome: RunOutcome,
    /// Checkpoint the last attempt restored from
    pub restored_from: Option<u64>,
    pub stats: ExecutorStats,
    pub late_records: LateRecordStats,
    pub duration_ms: u64,
}

/// Cloneable handle that stops a running processor
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub(crate) fn new(tx: Arc<watch::Sender<bool>>) -> Self {
        Self { tx }
    }

    /// Ask the processor to stop; workers finish their current element
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A source and the join side it feeds
pub(crate) struct SourceSlot<V> {
    pub(crate) source: Box<dyn Source<V>>,
    pub(crate) side: Option<JoinSide>,
    pub(crate) initial: Option<PositionToken>,
}

/// Sink stage acknowledgement of a barrier
#[derive(Debug)]
struct Ack {
    checkpoint_id: u64,
    partition: u32,
    snapshot: StateSnapshot,
}

#[derive(Debug)]
struct PendingCheckpoint {
    checkpoint_id: u64,
    positions: Vec<SourcePosition>,
    snapshots: Vec<PartitionSnapshot>,
    started: Instant,
}

struct WorkerHandle<V> {
    partition: u32,
    tx: CreditSender<WorkerMessage<V>>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Running tasks and coordinator bookkeeping for one attempt
struct Topology<V> {
    workers: Vec<WorkerHandle<V>>,
    sink_task: Option<JoinHandle<Result<()>>>,
    acks: mpsc::UnboundedReceiver<Ack>,
    tracker: WatermarkTracker,
    finished: Vec<bool>,
    broadcast: Watermark,
    pending: Option<PendingCheckpoint>,
    next_checkpoint_id: u64,
    shutdown: watch::Receiver<bool>,
    stats: Arc<StatsCollector>,
}

impl<V: Payload> Topology<V> {
    fn partitions(&self) -> u32 {
        self.workers.len() as u32
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn route(&self, side: Option<JoinSide>, record: Record<V>) -> Result<()> {
        let partition = partition_for(&record.key, self.partitions());
        trace!(key = %record.key, partition, "Routing record");
        self.workers[partition as usize]
            .tx
            .send_or_shutdown(WorkerMessage::Record { side, record }, &self.shutdown)
            .await
    }

    /// Broadcast the global watermark if it moved
    async fn advance_watermark(&mut self) -> Result<()> {
        let global = self.tracker.global();
        if global <= self.broadcast {
            return Ok(());
        }
        self.broadcast = global;
        self.stats.watermark(global);
        debug!(watermark = %global, "Global watermark advanced");
        for worker in &self.workers {
            worker
                .tx
                .send_or_shutdown(WorkerMessage::Watermark(global), &self.shutdown)
                .await?;
        }
        Ok(())
    }

    /// Where every source stands right now
    fn positions(&self, sources: &[SourceSlot<V>]) -> Result<Vec<SourcePosition>> {
        let mut positions = Vec::with_capacity(sources.len());
        for (idx, slot) in sources.iter().enumerate() {
            positions.push(SourcePosition {
                source_id: slot.source.id().to_string(),
                position: slot.source.position(),
                watermark: self.tracker.source_watermark(idx)?,
            });
        }
        Ok(positions)
    }

    async fn inject_barrier(&mut self, positions: Vec<SourcePosition>) -> Result<()> {
        let checkpoint_id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;

        self.pending = Some(PendingCheckpoint {
            checkpoint_id,
            positions,
            snapshots: Vec::with_capacity(self.workers.len()),
            started: Instant::now(),
        });

        debug!(checkpoint_id, "Injecting checkpoint barrier");
        for worker in &self.workers {
            worker
                .tx
                .send_or_shutdown(WorkerMessage::Barrier(checkpoint_id), &self.shutdown)
                .await?;
        }
        Ok(())
    }

    fn on_ack(&mut self, ack: Ack) {
        match self.pending.as_mut() {
            Some(pending) if pending.checkpoint_id == ack.checkpoint_id => {
                trace!(checkpoint_id = ack.checkpoint_id, partition = ack.partition, "Barrier acknowledged");
                pending.snapshots.push(PartitionSnapshot {
                    partition_id: ack.partition,
                    state_snapshot: ack.snapshot,
                });
            }
            _ => warn!(checkpoint_id = ack.checkpoint_id, "Ignoring acknowledgement for unknown checkpoint"),
        }
    }

    /// The pending checkpoint, once every partition acknowledged it
    fn take_completed(&mut self) -> Option<PendingCheckpoint> {
        let complete = self
            .pending
            .as_ref()
            .map_or(false, |p| p.snapshots.len() == self.workers.len());
        if complete {
            self.pending.take()
        } else {
            None
        }
    }

    fn drain_acks(&mut self) -> Option<PendingCheckpoint> {
        while let Ok(ack) = self.acks.try_recv() {
            self.on_ack(ack);
        }
        self.take_completed()
    }

    /// Wait until the pending checkpoint is acknowledged by every partition
    async fn wait_for_pending(&mut self) -> Result<Option<PendingCheckpoint>> {
        if self.pending.is_none() {
            return Ok(None);
        }
        loop {
            if let Some(done) = self.drain_acks() {
                return Ok(Some(done));
            }
            if self.is_shutdown() {
                return Err(EngineError::Shutdown);
            }
            tokio::select! {
                ack = self.acks.recv() => match ack {
                    Some(ack) => self.on_ack(ack),
                    // only the sink stage holds the sender
                    None => return Err(self.join_sink().await),
                },
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {
                    if let Some(e) = self.failure().await {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Non-blocking check for a task that stopped on its own
    async fn failure(&mut self) -> Option<EngineError> {
        if self.is_shutdown() {
            return None;
        }
        if self.sink_task.as_ref().map_or(false, JoinHandle::is_finished) {
            return Some(self.join_sink().await);
        }
        let finished = self
            .workers
            .iter()
            .position(|w| w.task.as_ref().map_or(false, JoinHandle::is_finished));
        match finished {
            Some(idx) => Some(self.join_worker(idx).await),
            None => None,
        }
    }

    /// Turn a closed-queue error into the failure that closed it
    async fn explain(&mut self, error: EngineError) -> EngineError {
        if !matches!(error, EngineError::ChannelClosed(_)) {
            return error;
        }
        if self.sink_task.as_ref().map_or(false, JoinHandle::is_finished) {
            return self.join_sink().await;
        }
        match self.workers.iter().position(|w| w.tx.is_closed()) {
            Some(idx) => self.join_worker(idx).await,
            None => error,
        }
    }

    async fn join_sink(&mut self) -> EngineError {
        match self.sink_task.take() {
            Some(task) => match task.await {
                Ok(Ok(())) => EngineError::ChannelClosed("sink stage".to_string()),
                Ok(Err(e)) => e,
                Err(e) => EngineError::Unexpected(format!("sink stage failed: {}", join_reason(e))),
            },
            None => EngineError::ChannelClosed("sink stage".to_string()),
        }
    }

    async fn join_worker(&mut self, idx: usize) -> EngineError {
        let partition = self.workers[idx].partition;
        let Some(task) = self.workers[idx].task.take() else {
            return EngineError::WorkerFailed {
                partition,
                reason: "worker already stopped".to_string(),
            };
        };
        match task.await {
            Ok(Ok(())) => EngineError::WorkerFailed {
                partition,
                reason: "worker exited unexpectedly".to_string(),
            },
            // output queue closed underneath the worker: the sink stage is the cause
            Ok(Err(EngineError::ChannelClosed(_))) if self.sink_task.is_some() => self.join_sink().await,
            Ok(Err(e)) => EngineError::WorkerFailed {
                partition,
                reason: e.to_string(),
            },
            Err(e) => EngineError::WorkerFailed {
                partition,
                reason: join_reason(e),
            },
        }
    }

    /// Close the worker queues and wait for every task to drain
    async fn close(mut self) -> Result<()> {
        let workers = std::mem::take(&mut self.workers);
        let mut tasks = Vec::with_capacity(workers.len());
        for worker in workers {
            drop(worker.tx);
            if let Some(task) = worker.task {
                tasks.push((worker.partition, task));
            }
        }
        for (partition, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(EngineError::WorkerFailed {
                        partition,
                        reason: e.to_string(),
                    })
                }
                Err(e) => {
                    return Err(EngineError::WorkerFailed {
                        partition,
                        reason: join_reason(e),
                    })
                }
            }
        }

        if let Some(mut task) = self.sink_task.take() {
            let result = if self.is_shutdown() {
                match tokio::time::timeout(SHUTDOWN_GRACE * 2, &mut task).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Sink stage did not drain in time; abandoning buffered outputs");
                        task.abort();
                        return Ok(());
                    }
                }
            } else {
                task.await
            };
            match result {
                Ok(result) => result?,
                Err(e) => return Err(EngineError::Unexpected(format!("sink stage failed: {}", join_reason(e)))),
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        for worker in &mut self.workers {
            if let Some(task) = worker.task.take() {
                task.abort();
            }
        }
        if let Some(task) = self.sink_task.take() {
            task.abort();
        }
    }
}

fn join_reason(error: JoinError) -> String {
    if error.is_panic() {
        panic_message(error.into_panic())
    } else {
        "task cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Batches outputs into the sinks and acknowledges barriers
struct SinkStage<V> {
    sink: Arc<dyn Sink<Output<V>>>,
    side_output_sink: Option<Arc<dyn Sink<SideOutput<V>>>>,
    dead_letter_sink: Option<Arc<dyn Sink<Output<V>>>>,
    retry: RetryPolicy,
    batch_size: usize,
    acks: mpsc::UnboundedSender<Ack>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<StatsCollector>,
    outputs: Vec<Output<V>>,
    side_outputs: Vec<SideOutput<V>>,
}

impl<V: Payload> SinkStage<V> {
    async fn run(mut self, mut input: CreditReceiver<OutputMessage<V>>) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return self.stop().await;
                    }
                    continue;
                }
                message = input.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let mut stopping = self.shutdown.clone();
            tokio::select! {
                biased;
                handled = self.handle(message, &input) => handled?,
                Ok(()) = async { stopping.wait_for(|requested| *requested).await.map(|_| ()) } => {
                    warn!("Shutdown interrupted a sink write; the batch replays from the last checkpoint");
                    return self.stop().await;
                }
            }
        }
        self.flush().await
    }

    async fn handle(&mut self, message: OutputMessage<V>, input: &CreditReceiver<OutputMessage<V>>) -> Result<()> {
        match message {
            OutputMessage::Emitted(emitted) => {
                self.outputs.extend(emitted.outputs);
                self.side_outputs.extend(emitted.side_outputs);
                if self.outputs.len() >= self.batch_size {
                    self.flush().await?;
                }
            }
            OutputMessage::Barrier {
                checkpoint_id,
                partition,
                snapshot,
            } => {
                self.flush().await?;
                // a dropped receiver means the attempt is over
                let _ = self.acks.send(Ack {
                    checkpoint_id,
                    partition,
                    snapshot,
                });
            }
        }

        // nothing queued behind: write what we have rather than hold it back
        if input.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush what is still buffered, giving the sinks at most the grace period
    async fn stop(&mut self) -> Result<()> {
        match tokio::time::timeout(SHUTDOWN_GRACE, self.flush()).await {
            Ok(flushed) => flushed,
            Err(_) => {
                warn!(
                    outputs = self.outputs.len(),
                    side_outputs = self.side_outputs.len(),
                    "Sink did not drain within the shutdown grace period"
                );
                Ok(())
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.outputs.is_empty() {
            let outputs = std::mem::take(&mut self.outputs);
            for batch in outputs.chunks(self.batch_size) {
                self.write_outputs(batch).await?;
            }
        }

        if !self.side_outputs.is_empty() {
            let side_outputs = std::mem::take(&mut self.side_outputs);
            match &self.side_output_sink {
                Some(sink) => {
                    write_with_retry(sink.as_ref(), &side_outputs, self.retry, &self.stats).await?;
                    self.stats.side_outputs(side_outputs.len());
                }
                None => debug!(count = side_outputs.len(), "No side-output sink configured, discarding"),
            }
        }
        Ok(())
    }

    async fn write_outputs(&self, batch: &[Output<V>]) -> Result<()> {
        match write_with_retry(self.sink.as_ref(), batch, self.retry, &self.stats).await {
            Ok(()) => {
                self.stats.outputs_written(batch.len());
                Ok(())
            }
            Err(e) => match &self.dead_letter_sink {
                Some(dlq) => {
                    warn!(
                        error = %e,
                        count = batch.len(),
                        dead_letter_sink = dlq.name(),
                        "Routing batch to dead-letter sink"
                    );
                    write_with_retry(dlq.as_ref(), batch, self.retry, &self.stats).await?;
                    self.stats.dead_lettered(batch.len());
                    self.stats.outputs_written(batch.len());
                    Ok(())
                }
                None => {
                    error!(error = %e, "Sink write failed, halting pipeline");
                    Err(e)
                }
            },
        }
    }
}

/// Write a batch, retrying with backoff; exhaustion yields [`EngineError::SinkWrite`]
async fn write_with_retry<O: Sync>(
    sink: &dyn Sink<O>,
    batch: &[O],
    policy: RetryPolicy,
    stats: &StatsCollector,
) -> Result<()> {
    let mut retries = 0;
    loop {
        match sink.write(batch).await {
            Ok(()) => {
                if retries > 0 {
                    debug!(sink = sink.name(), retries, "Batch written after retries");
                }
                return Ok(());
            }
            Err(e) => {
                if retries >= policy.max_retries {
                    return Err(EngineError::SinkWrite {
                        attempts: retries + 1,
                        reason: e.to_string(),
                    });
                }
                retries += 1;
                stats.sink_retry();
                let backoff = policy.backoff(retries);
                warn!(
                    sink = sink.name(),
                    "Write failed (attempt {}/{}), retrying in {:?}: {}",
                    retries,
                    policy.max_attempts(),
                    backoff,
                    e
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Event-time stream processor
///
/// Built with [`StreamProcessorBuilder`](super::StreamProcessorBuilder).
/// [`run`](Self::run) drives the pipeline until every source is exhausted or
/// a shutdown is requested, restarting from the last checkpoint after a
/// worker failure.
pub struct StreamProcessor<V: Payload> {
    pub(crate) name: String,
    pub(crate) config: PipelineConfig,
    pub(crate) spec: OperatorSpec,
    pub(crate) sources: Vec<SourceSlot<V>>,
    pub(crate) sink: Arc<dyn Sink<Output<V>>>,
    pub(crate) side_output_sink: Option<Arc<dyn Sink<SideOutput<V>>>>,
    pub(crate) dead_letter_sink: Option<Arc<dyn Sink<Output<V>>>>,
    pub(crate) checkpoints: Arc<dyn CheckpointStorage>,
    pub(crate) shutdown: Arc<watch::Sender<bool>>,
    pub(crate) late_records: Arc<LateRecordTracker>,
    pub(crate) stats: Arc<StatsCollector>,
}

impl<V: Payload> std::fmt::Debug for StreamProcessor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("name", &self.name)
            .field("operator", &self.spec)
            .field("sources", &self.sources.len())
            .field("partitions", &self.config.partition_count)
            .finish()
    }
}

impl<V: Payload> StreamProcessor<V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for stopping the processor from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(Arc::clone(&self.shutdown))
    }

    /// Current statistics
    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }

    /// Shared view of the statistics, readable while [`run`](Self::run) is in progress
    pub fn stats_handle(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    pub fn late_record_stats(&self) -> LateRecordStats {
        self.late_records.stats()
    }

    /// Run until the sources are exhausted or a shutdown is requested
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        info!(
            pipeline = %self.name,
            partitions = self.config.partition_count,
            sources = self.sources.len(),
            operator = ?self.spec,
            "Starting stream processor"
        );

        for slot in &mut self.sources {
            if slot.initial.is_none() {
                slot.initial = Some(slot.source.position());
            }
        }

        let mut restarts = 0;
        let result = loop {
            match self.run_attempt(restarts > 0).await {
                Ok(done) => break Ok(done),
                Err(e) if e.is_recoverable() && restarts < self.config.max_restarts => {
                    restarts += 1;
                    self.stats.restart();
                    warn!(
                        error = %e,
                        restart = restarts,
                        max_restarts = self.config.max_restarts,
                        "Restarting from last checkpoint"
                    );
                }
                Err(e) => {
                    error!(pipeline = %self.name, error = %e, "Stream processor failed");
                    break Err(e);
                }
            }
        };

        self.close_endpoints().await;
        let (outcome, restored_from) = result?;

        let summary = RunSummary {
            pipeline: self.name.clone(),
            outcome,
            restored_from,
            stats: self.stats.snapshot(),
            late_records: self.late_records.stats(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            pipeline = %self.name,
            outcome = ?summary.outcome,
            records_in = summary.stats.records_in,
            outputs = summary.stats.outputs_written,
            checkpoints = summary.stats.checkpoints_completed,
            duration_ms = summary.duration_ms,
            "Stream processor finished"
        );
        Ok(summary)
    }

    async fn run_attempt(&mut self, is_restart: bool) -> Result<(RunOutcome, Option<u64>)> {
        let checkpoint = self.checkpoints.load_latest().await?;
        let restored_from = checkpoint.as_ref().map(|c| c.checkpoint_id);
        let mut topology = self.start_topology(checkpoint, is_restart).await?;

        let outcome = match self.drive(&mut topology).await {
            Ok(outcome) => outcome,
            Err(_) if topology.is_shutdown() => RunOutcome::Stopped,
            Err(e) => {
                let e = topology.explain(e).await;
                topology.abort();
                return Err(e);
            }
        };

        match topology.close().await {
            Ok(()) => Ok((outcome, restored_from)),
            Err(_) if outcome == RunOutcome::Stopped => Ok((outcome, restored_from)),
            Err(e) => Err(e),
        }
    }

    /// Restore state and sources, then spawn the workers and the sink stage
    async fn start_topology(&mut self, checkpoint: Option<Checkpoint>, is_restart: bool) -> Result<Topology<V>> {
        let partitions = self.config.partition_count;
        let tracker = WatermarkTracker::new(
            self.sources
                .iter()
                .map(|s| s.source.id().to_string())
                .collect(),
        );

        match &checkpoint {
            Some(checkpoint) => {
                if checkpoint.per_partition.len() != partitions as usize {
                    return Err(EngineError::config(format!(
                        "checkpoint {} has {} partitions but the pipeline has {}",
                        checkpoint.checkpoint_id,
                        checkpoint.per_partition.len(),
                        partitions
                    )));
                }
                for (idx, slot) in self.sources.iter_mut().enumerate() {
                    match checkpoint.source_position(slot.source.id()) {
                        Some(position) => {
                            slot.source.seek(&position.position).await?;
                            tracker.advance(idx, position.watermark)?;
                        }
                        None => {
                            warn!(source = slot.source.id(), "Source missing from checkpoint, reading from its start");
                            if let Some(initial) = &slot.initial {
                                slot.source.seek(initial).await?;
                            }
                        }
                    }
                }
                info!(checkpoint_id = checkpoint.checkpoint_id, "Restoring from checkpoint");
            }
            None if is_restart => {
                for slot in &mut self.sources {
                    if let Some(initial) = &slot.initial {
                        slot.source.seek(initial).await?;
                    }
                }
                info!("No checkpoint yet, replaying sources from the start");
            }
            None => {}
        }

        let shutdown = self.shutdown.subscribe();
        let capacity = self.config.queue_capacity;
        let (output_tx, output_rx) = backpressure::channel("sink", capacity);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let backend = open_backend(self.config.state_backend, &self.config.state_dir, partition).await?;
            let store = StateStore::new(backend);
            let watermark = match checkpoint.as_ref().and_then(|c| c.partition(partition)) {
                Some(snapshot) => {
                    store.restore(snapshot).await?;
                    snapshot.watermark
                }
                None => {
                    store.backend().clear().await?;
                    Watermark::min()
                }
            };
            let operator = self.spec.build(store, partition, Arc::clone(&self.late_records));
            let (tx, rx) = backpressure::channel(format!("partition-{}", partition), capacity);
            let worker = PartitionWorker::new(
                partition,
                operator,
                rx,
                output_tx.clone(),
                shutdown.clone(),
                watermark,
                self.config.max_record_attempts,
                Arc::clone(&self.stats),
            );
            workers.push(WorkerHandle {
                partition,
                tx,
                task: Some(tokio::spawn(worker.run())),
            });
        }
        drop(output_tx);

        let stage = SinkStage {
            sink: Arc::clone(&self.sink),
            side_output_sink: self.side_output_sink.clone(),
            dead_letter_sink: self.dead_letter_sink.clone(),
            retry: self.config.sink_retry_policy(),
            batch_size: self.config.sink_batch_size,
            acks: ack_tx,
            shutdown: shutdown.clone(),
            stats: Arc::clone(&self.stats),
            outputs: Vec::new(),
            side_outputs: Vec::new(),
        };
        let sink_task = tokio::spawn(stage.run(output_rx));

        let broadcast = tracker.global();
        Ok(Topology {
            workers,
            sink_task: Some(sink_task),
            acks: ack_rx,
            finished: vec![false; self.sources.len()],
            tracker,
            broadcast: if checkpoint.is_some() { broadcast } else { Watermark::min() },
            pending: None,
            next_checkpoint_id: checkpoint.map_or(1, |c| c.checkpoint_id + 1),
            shutdown,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Coordinator loop
    async fn drive(&mut self, topology: &mut Topology<V>) -> Result<RunOutcome> {
        let interval = self.config.checkpoint_interval();
        let mut last_checkpoint = Instant::now();
        let mut shutdown = topology.shutdown.clone();

        loop {
            if topology.is_shutdown() {
                info!(pipeline = %self.name, "Coordinator stopping on shutdown");
                return Ok(RunOutcome::Stopped);
            }

            if let Some(done) = topology.drain_acks() {
                self.persist(done).await?;
                last_checkpoint = Instant::now();
            }

            if let Some(e) = topology.failure().await {
                return Err(e);
            }

            if topology.finished.iter().all(|f| *f) {
                break;
            }

            if topology.pending.is_none() && last_checkpoint.elapsed() >= interval {
                let positions = topology.positions(&self.sources)?;
                topology.inject_barrier(positions).await?;
            }

            if self.poll_sources(topology).await? {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        // every source is exhausted: flush all windows and take a final checkpoint
        topology.advance_watermark().await?;
        if let Some(done) = topology.wait_for_pending().await? {
            self.persist(done).await?;
        }
        let positions = topology.positions(&self.sources)?;
        topology.inject_barrier(positions).await?;
        if let Some(done) = topology.wait_for_pending().await? {
            self.persist(done).await?;
        }
        info!(pipeline = %self.name, "All sources exhausted");
        Ok(RunOutcome::Completed)
    }

    /// Poll every live source once; true if anything arrived
    async fn poll_sources(&mut self, topology: &mut Topology<V>) -> Result<bool> {
        let mut progressed = false;
        for idx in 0..self.sources.len() {
            if topology.finished[idx] {
                continue;
            }
            let slot = &mut self.sources[idx];
            let batch = slot.source.poll().await?;

            if !batch.records.is_empty() {
                progressed = true;
                self.stats.records_in(batch.records.len());
                for record in batch.records {
                    topology.route(slot.side, record).await?;
                }
            }
            if let Some(watermark) = batch.watermark {
                topology.tracker.advance(idx, watermark)?;
            }
            if batch.end_of_stream {
                progressed = true;
                topology.finished[idx] = true;
                topology.tracker.finish(idx)?;
                info!(source = slot.source.id(), position = %slot.source.position(), "Source reached end of stream");
            }
        }
        topology.advance_watermark().await?;
        Ok(progressed)
    }

    /// Save a fully acknowledged checkpoint and commit the source positions
    async fn persist(&mut self, done: PendingCheckpoint) -> Result<()> {
        let checkpoint = Checkpoint::new(done.checkpoint_id, done.positions, done.snapshots)?;
        self.checkpoints.save(&checkpoint).await?;

        for slot in &mut self.sources {
            if let Some(position) = checkpoint.source_position(slot.source.id()) {
                slot.source.commit_position(&position.position).await?;
            }
        }
        self.stats.checkpoint_completed(checkpoint.checkpoint_id);
        info!(
            checkpoint_id = checkpoint.checkpoint_id,
            entries = checkpoint.entry_count(),
            duration_ms = done.started.elapsed().as_millis() as u64,
            "Checkpoint completed"
        );
        Ok(())
    }

    async fn close_endpoints(&mut self) {
        let grace = (*self.shutdown.borrow()).then_some(SHUTDOWN_GRACE);
        for slot in &mut self.sources {
            if let Err(e) = within(grace, slot.source.close()).await {
                warn!(source = slot.source.id(), error = %e, "Failed to close source");
            }
        }
        if let Err(e) = within(grace, self.sink.close()).await {
            warn!(sink = self.sink.name(), error = %e, "Failed to close sink");
        }
        if let Some(sink) = &self.side_output_sink {
            if let Err(e) = within(grace, sink.close()).await {
                warn!(sink = sink.name(), error = %e, "Failed to close side-output sink");
            }
        }
        if let Some(sink) = &self.dead_letter_sink {
            if let Err(e) = within(grace, sink.close()).await {
                warn!(sink = sink.name(), error = %e, "Failed to close dead-letter sink");
            }
        }
    }
}

/// Await `fut`, giving up with [`EngineError::Shutdown`] after `grace`
async fn within<F>(grace: Option<Duration>, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match grace {
        Some(grace) => tokio::time::timeout(grace, fut)
            .await
            .unwrap_or(Err(EngineError::Shutdown)),
        None => fut.await,
    }
}
