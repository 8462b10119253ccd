//! In-memory sink
//!
//! Keeps every write in a shared buffer. Clones share the buffer, so a test
//! can hand one clone to the processor and inspect the other. Writes can be
//! made to fail or to stall.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::trace;

use super::Sink;
use crate::aggregation::AggregateValue;
use crate::error::{EngineError, Result};
use crate::operator::{Output, ResultKind};
use crate::window::WindowId;

#[derive(Debug)]
struct Inner<O> {
    items: Mutex<Vec<O>>,
    batches: AtomicU64,
    failures_left: AtomicU32,
    failed_writes: AtomicU64,
    paused: watch::Sender<bool>,
    closed: AtomicU64,
}

/// Sink collecting outputs in memory
#[derive(Debug)]
pub struct MemorySink<O> {
    name: String,
    inner: Arc<Inner<O>>,
}

impl<O> Clone for MemorySink<O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> Default for MemorySink<O> {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl<O> MemorySink<O> {
    pub fn new(name: impl Into<String>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            name: name.into(),
            inner: Arc::new(Inner {
                items: Mutex::new(Vec::new()),
                batches: AtomicU64::new(0),
                failures_left: AtomicU32::new(0),
                failed_writes: AtomicU64::new(0),
                paused,
                closed: AtomicU64::new(0),
            }),
        }
    }

    fn items(&self) -> MutexGuard<'_, Vec<O>> {
        self.inner.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` writes
    pub fn fail_next(&self, count: u32) {
        self.inner.failures_left.store(count, Ordering::SeqCst);
    }

    /// Block writes until [`resume`](Self::resume)
    pub fn stall(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    /// Successful write calls
    pub fn batch_count(&self) -> u64 {
        self.inner.batches.load(Ordering::SeqCst)
    }

    /// Write calls rejected by [`fail_next`](Self::fail_next)
    pub fn failed_writes(&self) -> u64 {
        self.inner.failed_writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// How many times `close` was called
    pub fn close_count(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl<O: Clone> MemorySink<O> {
    /// Copy of everything written so far
    pub fn outputs(&self) -> Vec<O> {
        self.items().clone()
    }
}

impl<V: Clone> MemorySink<Output<V>> {
    /// Every window value written, grouped by window id in write order
    ///
    /// A window with more than one distinct final value points at a
    /// duplicate delivery that disagrees with the first delivery.
    pub fn results_by_window(&self) -> BTreeMap<WindowId, Vec<(ResultKind, AggregateValue<V>)>> {
        let mut grouped: BTreeMap<WindowId, Vec<(ResultKind, AggregateValue<V>)>> = BTreeMap::new();
        for output in self.items().iter() {
            if let Output::Window(result) = output {
                grouped
                    .entry(result.window_id.clone())
                    .or_default()
                    .push((result.kind, result.value.clone()));
            }
        }
        grouped
    }
}

#[async_trait]
impl<O: Clone + Send + Sync + 'static> Sink<O> for MemorySink<O> {
    async fn write(&self, batch: &[O]) -> Result<()> {
        let mut paused = self.inner.paused.subscribe();
        paused
            .wait_for(|p| !*p)
            .await
            .map_err(|_| EngineError::ChannelClosed(self.name.clone()))?;

        let injected = self
            .inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.inner.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("sink '{}' rejected the batch", self.name),
            )));
        }

        self.items().extend(batch.iter().cloned());
        self.inner.batches.fetch_add(1, Ordering::SeqCst);
        trace!(sink = %self.name, items = batch.len(), "Batch written");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::WindowResult;
    use crate::window::WindowKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clones_share_buffer() {
        let sink: MemorySink<u32> = MemorySink::new("test");
        let handle = sink.clone();
        sink.write(&[1, 2]).await.unwrap();
        sink.write(&[3]).await.unwrap();
        assert_eq!(handle.outputs(), vec![1, 2, 3]);
        assert_eq!(handle.batch_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sink: MemorySink<u32> = MemorySink::new("test");
        sink.fail_next(2);
        assert!(sink.write(&[1]).await.is_err());
        assert!(sink.write(&[1]).await.is_err());
        sink.write(&[1]).await.unwrap();
        assert_eq!(sink.outputs(), vec![1]);
        assert_eq!(sink.failed_writes(), 2);
    }

    #[tokio::test]
    async fn test_stall_blocks_until_resume() {
        let sink: MemorySink<u32> = MemorySink::new("test");
        sink.stall();
        let writer = tokio::spawn({
            let sink = sink.clone();
            async move { sink.write(&[7]).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!writer.is_finished());
        assert!(sink.is_empty());

        sink.resume();
        writer.await.unwrap().unwrap();
        assert_eq!(sink.outputs(), vec![7]);
    }

    #[tokio::test]
    async fn test_results_by_window_groups_duplicates() {
        let sink: MemorySink<Output<f64>> = MemorySink::new("test");
        let result = |start, value| {
            Output::Window(WindowResult {
                window_id: WindowId {
                    key: "k".to_string(),
                    start,
                    end: start + 10,
                },
                window_kind: WindowKind::Tumbling,
                value: AggregateValue::Count(value),
                kind: ResultKind::Final,
            })
        };
        sink.write(&[result(0, 3), result(10, 1)]).await.unwrap();
        sink.write(&[result(0, 3)]).await.unwrap();

        let grouped = sink.results_by_window();
        assert_eq!(grouped.len(), 2);
        let first = grouped.values().next().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, v)| *v == AggregateValue::Count(3)));
    }
}
