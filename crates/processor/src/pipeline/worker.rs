//! Partition worker
//!
//! One tokio task per partition. It drains its input queue in order and
//! drives the partition's operator. Everything it emits, including the
//! state snapshot taken at a checkpoint barrier, goes into the shared output
//! queue in the same order, so the sink stage sees every pre-barrier output
//! before the barrier itself.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::executor::StatsCollector;
use crate::backpressure::{CreditReceiver, CreditSender};
use crate::core::{JoinSide, Payload, Record};
use crate::error::{EngineError, Result};
use crate::operator::{Emitted, Operator, SideOutput};
use crate::state::StateSnapshot;
use crate::watermark::Watermark;

/// Coordinator to worker
#[derive(Debug)]
pub(crate) enum WorkerMessage<V> {
    Record {
        side: Option<JoinSide>,
        record: Record<V>,
    },
    Watermark(Watermark),
    Barrier(u64),
}

/// Worker to sink stage
#[derive(Debug)]
pub(crate) enum OutputMessage<V> {
    Emitted(Emitted<V>),
    Barrier {
        checkpoint_id: u64,
        partition: u32,
        snapshot: StateSnapshot,
    },
}

pub(crate) struct PartitionWorker<V> {
    partition: u32,
    operator: Operator<V>,
    input: CreditReceiver<WorkerMessage<V>>,
    output: CreditSender<OutputMessage<V>>,
    shutdown: watch::Receiver<bool>,
    watermark: Watermark,
    max_record_attempts: u32,
    stats: Arc<StatsCollector>,
}

impl<V: Payload> PartitionWorker<V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        partition: u32,
        operator: Operator<V>,
        input: CreditReceiver<WorkerMessage<V>>,
        output: CreditSender<OutputMessage<V>>,
        shutdown: watch::Receiver<bool>,
        watermark: Watermark,
        max_record_attempts: u32,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            partition,
            operator,
            input,
            output,
            shutdown,
            watermark,
            max_record_attempts: max_record_attempts.max(1),
            stats,
        }
    }

    /// Process messages until the queue closes or shutdown is signalled
    pub(crate) async fn run(mut self) -> Result<()> {
        debug!(partition = self.partition, watermark = %self.watermark, "Partition worker started");
        loop {
            let message = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(partition = self.partition, "Partition worker stopping on shutdown");
                        break;
                    }
                    continue;
                }
                message = self.input.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match self.handle(message).await {
                Err(EngineError::Shutdown) => {
                    info!(partition = self.partition, "Partition worker stopping on shutdown");
                    break;
                }
                handled => handled?,
            }
        }
        debug!(partition = self.partition, "Partition worker finished");
        Ok(())
    }

    async fn handle(&mut self, message: WorkerMessage<V>) -> Result<()> {
        match message {
            WorkerMessage::Record { side, record } => self.process_record(side, record).await,
            WorkerMessage::Watermark(watermark) => {
                if watermark <= self.watermark {
                    return Ok(());
                }
                self.watermark = watermark;
                trace!(partition = self.partition, %watermark, "Worker watermark advanced");
                let emitted = self.operator.on_watermark(watermark).await?;
                self.forward(emitted).await
            }
            WorkerMessage::Barrier(checkpoint_id) => {
                let snapshot = self.operator.snapshot(self.watermark).await?;
                debug!(
                    partition = self.partition,
                    checkpoint_id,
                    entries = snapshot.len(),
                    "Barrier reached worker"
                );
                self.output
                    .send_or_shutdown(
                        OutputMessage::Barrier {
                            checkpoint_id,
                            partition: self.partition,
                            snapshot,
                        },
                        &self.shutdown,
                    )
                    .await
            }
        }
    }

    /// Run the operator on one record, retrying record-level failures
    async fn process_record(&mut self, side: Option<JoinSide>, record: Record<V>) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.operator.process_record(side, &record, self.watermark).await {
                Ok(emitted) => {
                    self.stats.record_processed();
                    return self.forward(emitted).await;
                }
                Err(e) if is_record_error(&e) => {
                    if attempts < self.max_record_attempts {
                        debug!(partition = self.partition, key = %record.key, attempts, error = %e, "Retrying record");
                        continue;
                    }
                    let poison = EngineError::PoisonRecord {
                        key: record.key.clone(),
                        attempts,
                        reason: e.to_string(),
                    };
                    warn!(partition = self.partition, error = %poison, "Diverting poison record");
                    self.stats.poison_record();
                    return self
                        .forward(Emitted::side_output(SideOutput::Poison {
                            record,
                            attempts,
                            reason: e.to_string(),
                        }))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn forward(&self, emitted: Emitted<V>) -> Result<()> {
        if emitted.is_empty() {
            return Ok(());
        }
        self.output
            .send_or_shutdown(OutputMessage::Emitted(emitted), &self.shutdown)
            .await
    }
}

/// Failures caused by the record itself rather than the engine
fn is_record_error(error: &EngineError) -> bool {
    matches!(error, EngineError::Aggregation(_) | EngineError::Window(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateFunction;
    use crate::backpressure;
    use crate::operator::{Output, OperatorSpec};
    use crate::state::{MemoryStateBackend, StateStore};
    use crate::window::{LateRecordPolicy, LateRecordTracker, WindowAssigner};

    fn spawn_worker(
        shutdown: watch::Receiver<bool>,
    ) -> (
        CreditSender<WorkerMessage<serde_json::Value>>,
        CreditReceiver<OutputMessage<serde_json::Value>>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let spec = OperatorSpec::Aggregate {
            assigner: WindowAssigner::tumbling(10).unwrap(),
            function: AggregateFunction::Sum,
            allowed_lateness_ms: 0,
            late_policy: LateRecordPolicy::Drop,
        };
        let store = StateStore::new(Arc::new(MemoryStateBackend::new()));
        let operator = spec.build(store, 0, Arc::new(LateRecordTracker::new()));
        let (in_tx, in_rx) = backpressure::channel("input", 8);
        let (out_tx, out_rx) = backpressure::channel("output", 8);
        let worker = PartitionWorker::new(
            0,
            operator,
            in_rx,
            out_tx,
            shutdown,
            Watermark::min(),
            2,
            Arc::new(StatsCollector::default()),
        );
        (in_tx, out_rx, tokio::spawn(worker.run()))
    }

    #[tokio::test]
    async fn test_outputs_precede_barrier() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx, handle) = spawn_worker(shutdown_rx);

        let record = |v: i64, t| WorkerMessage::Record {
            side: None,
            record: Record::new("k", serde_json::json!(v), t),
        };
        tx.send(record(1, 1)).await.unwrap();
        tx.send(record(2, 5)).await.unwrap();
        tx.send(WorkerMessage::Watermark(Watermark::new(10))).await.unwrap();
        tx.send(WorkerMessage::Barrier(7)).await.unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        match rx.recv().await.unwrap() {
            OutputMessage::Emitted(emitted) => {
                let result = emitted.outputs[0].as_window().map(|r| r.value.as_f64());
                assert_eq!(result, Some(Some(3.0)));
            }
            other => panic!("expected window result, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            OutputMessage::Barrier {
                checkpoint_id,
                snapshot,
                ..
            } => {
                assert_eq!(checkpoint_id, 7);
                assert!(snapshot.is_empty());
                assert_eq!(snapshot.watermark, Watermark::new(10));
            }
            other => panic!("expected barrier, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poison_record_is_diverted() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, mut rx, handle) = spawn_worker(shutdown_rx);

        tx.send(WorkerMessage::Record {
            side: None,
            record: Record::new("bad", serde_json::json!([1, 2]), 1),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap().unwrap();

        match rx.recv().await.unwrap() {
            OutputMessage::Emitted(emitted) => {
                assert!(emitted.outputs.iter().all(|o| !matches!(o, Output::Window(_))));
                assert!(matches!(
                    &emitted.side_outputs[0],
                    SideOutput::Poison { attempts: 2, record, .. } if record.key == "bad"
                ));
            }
            other => panic!("expected poison side output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_tx, _rx, handle) = spawn_worker(shutdown_rx);
        shutdown_tx.send_replace(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker_blocked_on_full_output() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, _rx, handle) = spawn_worker(shutdown_rx);

        // ten windows close one by one; the output queue holds eight results
        for t in 0..10 {
            tx.send(WorkerMessage::Record {
                side: None,
                record: Record::new("k", serde_json::json!(1), t * 10),
            })
            .await
            .unwrap();
            tx.send(WorkerMessage::Watermark(Watermark::new(t * 10 + 10))).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        shutdown_tx.send_replace(true);
        let stopped = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        stopped.unwrap().unwrap().unwrap();
    }
}
