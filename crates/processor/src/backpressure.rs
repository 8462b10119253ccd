//! Credit-based backpressure
//!
//! A bounded queue where the producer must hold a credit to enqueue. The
//! queue starts with `capacity` credits; every dequeue returns one. With no
//! credits left, [`CreditSender::send`] suspends the producer until the
//! consumer catches up, so nothing is ever dropped and the queue never holds
//! more than `capacity` items.
//!
//! Buffer utilization is tracked as a [`BufferLevel`] and every level change
//! is logged.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore, TryAcquireError};
use tracing::{debug, info, trace, warn};

use crate::error::{EngineError, Result};

const WARNING_THRESHOLD_PERCENT: usize = 80;
const CRITICAL_THRESHOLD_PERCENT: usize = 95;

/// Buffer utilization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferLevel {
    /// Buffer usage is normal
    Normal,
    /// Buffer usage is high (warning threshold exceeded)
    Warning,
    /// Buffer usage is critical
    Critical,
    /// No credits left; producers wait
    Full,
}

impl BufferLevel {
    /// Level for `len` items in a queue of `capacity`
    pub fn for_utilization(len: usize, capacity: usize) -> Self {
        if len >= capacity {
            BufferLevel::Full
        } else if len * 100 >= capacity * CRITICAL_THRESHOLD_PERCENT {
            BufferLevel::Critical
        } else if len * 100 >= capacity * WARNING_THRESHOLD_PERCENT {
            BufferLevel::Warning
        } else {
            BufferLevel::Normal
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Full => "full",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::Full => 3,
        }
    }
}

/// Counters for one credit channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub name: String,
    pub capacity: usize,
    pub len: usize,
    pub credits: usize,
    pub level: BufferLevel,
    /// Items enqueued
    pub sent: u64,
    /// Items dequeued
    pub received: u64,
    /// Sends that had to wait for a credit
    pub blocked_sends: u64,
}

/// Error returned by [`CreditSender::try_send`]
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No credit available
    Full(T),
    /// The receiver is gone
    Closed(T),
}

#[derive(Debug)]
struct Shared {
    name: String,
    capacity: usize,
    credits: Semaphore,
    len: AtomicUsize,
    level: AtomicU8,
    sent: AtomicU64,
    received: AtomicU64,
    blocked_sends: AtomicU64,
}

impl Shared {
    fn update_level(&self) {
        let len = self.len.load(Ordering::Acquire);
        let level = BufferLevel::for_utilization(len, self.capacity);
        let previous = self.level.swap(level.as_u8(), Ordering::AcqRel);
        if previous == level.as_u8() {
            return;
        }
        match level {
            BufferLevel::Normal => {
                debug!(queue = %self.name, len, capacity = self.capacity, "Buffer level: NORMAL")
            }
            BufferLevel::Warning => {
                info!(queue = %self.name, len, capacity = self.capacity, "Buffer level: WARNING")
            }
            BufferLevel::Critical => {
                warn!(queue = %self.name, len, capacity = self.capacity, "Buffer level: CRITICAL")
            }
            BufferLevel::Full => {
                warn!(queue = %self.name, len, capacity = self.capacity, "Buffer level: FULL, producer suspended")
            }
        }
    }

    fn on_enqueue(&self) {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.update_level();
    }

    fn on_dequeue(&self) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.received.fetch_add(1, Ordering::Relaxed);
        self.credits.add_permits(1);
        self.update_level();
    }

    fn closed(&self) -> EngineError {
        EngineError::ChannelClosed(self.name.clone())
    }
}

/// Create a credit channel of the given capacity (at least 1)
pub fn channel<T>(name: impl Into<String>, capacity: usize) -> (CreditSender<T>, CreditReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        name: name.into(),
        capacity,
        credits: Semaphore::new(capacity),
        len: AtomicUsize::new(0),
        level: AtomicU8::new(BufferLevel::Normal.as_u8()),
        sent: AtomicU64::new(0),
        received: AtomicU64::new(0),
        blocked_sends: AtomicU64::new(0),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CreditSender {
            tx,
            shared: Arc::clone(&shared),
        },
        CreditReceiver { rx, shared },
    )
}

/// Producing half of a credit channel
#[derive(Debug)]
pub struct CreditSender<T> {
    tx: mpsc::UnboundedSender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for CreditSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> CreditSender<T> {
    /// Enqueue an item, waiting for a credit if none is available
    pub async fn send(&self, item: T) -> Result<()> {
        let permit = match self.shared.credits.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.shared.blocked_sends.fetch_add(1, Ordering::Relaxed);
                trace!(queue = %self.shared.name, "Waiting for credit");
                self.shared
                    .credits
                    .acquire()
                    .await
                    .map_err(|_| self.shared.closed())?
            }
            Err(TryAcquireError::Closed) => return Err(self.shared.closed()),
        };
        permit.forget();
        self.enqueue(item).map_err(|_| self.shared.closed())
    }

    /// Like [`send`](Self::send), but gives up with [`EngineError::Shutdown`]
    /// once `shutdown` turns true while waiting for a credit
    pub async fn send_or_shutdown(&self, item: T, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let mut shutdown = shutdown.clone();
        tokio::select! {
            biased;
            sent = self.send(item) => sent,
            Ok(_) = shutdown.wait_for(|stop| *stop) => {
                debug!(queue = %self.shared.name, "Send abandoned on shutdown");
                Err(EngineError::Shutdown)
            }
        }
    }

    /// Enqueue without waiting
    pub fn try_send(&self, item: T) -> std::result::Result<(), TrySendError<T>> {
        match self.shared.credits.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Err(TrySendError::Full(item)),
            Err(TryAcquireError::Closed) => return Err(TrySendError::Closed(item)),
        }
        self.enqueue(item).map_err(TrySendError::Closed)
    }

    fn enqueue(&self, item: T) -> std::result::Result<(), T> {
        self.shared.on_enqueue();
        if let Err(mpsc::error::SendError(item)) = self.tx.send(item) {
            self.shared.len.fetch_sub(1, Ordering::AcqRel);
            self.shared.credits.add_permits(1);
            return Err(item);
        }
        Ok(())
    }

    /// Credits currently available to producers
    pub fn credits(&self) -> usize {
        self.shared.credits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a send would have to wait
    pub fn is_backpressured(&self) -> bool {
        self.credits() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> BackpressureStats {
        stats_of(&self.shared)
    }
}

/// Consuming half of a credit channel
#[derive(Debug)]
pub struct CreditReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    shared: Arc<Shared>,
}

impl<T> CreditReceiver<T> {
    /// Wait for the next item; `None` once all senders are gone and the queue is empty
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.shared.on_dequeue();
        Some(item)
    }

    /// Dequeue without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.shared.on_dequeue();
                Some(item)
            }
            Err(_) => None,
        }
    }

    /// Stop accepting new items; queued items can still be received
    pub fn close(&mut self) {
        self.rx.close();
        self.shared.credits.close();
    }

    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn credits(&self) -> usize {
        self.shared.credits.available_permits()
    }

    pub fn is_backpressured(&self) -> bool {
        self.credits() == 0
    }

    pub fn stats(&self) -> BackpressureStats {
        stats_of(&self.shared)
    }
}

impl<T> Drop for CreditReceiver<T> {
    fn drop(&mut self) {
        // wake producers blocked on a credit
        self.shared.credits.close();
    }
}

fn stats_of(shared: &Shared) -> BackpressureStats {
    let len = shared.len.load(Ordering::Acquire);
    BackpressureStats {
        name: shared.name.clone(),
        capacity: shared.capacity,
        len,
        credits: shared.credits.available_permits(),
        level: BufferLevel::for_utilization(len, shared.capacity),
        sent: shared.sent.load(Ordering::Relaxed),
        received: shared.received.load(Ordering::Relaxed),
        blocked_sends: shared.blocked_sends.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_buffer_levels() {
        assert_eq!(BufferLevel::for_utilization(0, 100), BufferLevel::Normal);
        assert_eq!(BufferLevel::for_utilization(79, 100), BufferLevel::Normal);
        assert_eq!(BufferLevel::for_utilization(80, 100), BufferLevel::Warning);
        assert_eq!(BufferLevel::for_utilization(95, 100), BufferLevel::Critical);
        assert_eq!(BufferLevel::for_utilization(100, 100), BufferLevel::Full);
    }

    #[tokio::test]
    async fn test_credits_are_consumed_and_returned() {
        let (tx, mut rx) = channel("test", 2);
        assert_eq!(tx.credits(), 2);

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(tx.credits(), 0);
        assert!(tx.is_backpressured());
        assert_eq!(tx.len(), 2);
        assert!(matches!(tx.try_send(3), Err(TrySendError::Full(3))));

        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(tx.credits(), 1);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.try_recv(), None);
        assert_eq!(tx.credits(), 2);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_send_suspends_at_zero_credits() {
        let (tx, mut rx) = channel("test", 1);
        tx.send(1u32).await.unwrap();

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(2).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(rx.len(), 1);

        assert_eq!(rx.recv().await, Some(1));
        producer.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(tx.stats().blocked_sends, 1);
    }

    #[tokio::test]
    async fn test_queue_never_exceeds_capacity() {
        let (tx, mut rx) = channel("test", 4);
        let producer = tokio::spawn(async move {
            for i in 0..100u32 {
                tx.send(i).await.unwrap();
                assert!(tx.len() <= tx.capacity());
            }
        });

        let mut received = Vec::new();
        while let Some(item) = rx.recv().await {
            assert!(rx.len() <= rx.capacity());
            received.push(item);
            if received.len() % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        producer.await.unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dropped_receiver_wakes_blocked_sender() {
        let (tx, rx) = channel("test", 1);
        tx.send(1u8).await.unwrap();
        let producer = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(2).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);
        let result = producer.await.unwrap();
        assert!(matches!(result, Err(EngineError::ChannelClosed(_))));
        assert!(matches!(tx.try_send(3), Err(TrySendError::Closed(3))));
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_sender() {
        let (tx, rx) = channel("test", 1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(1u8).await.unwrap();

        let producer = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send_or_shutdown(2, &shutdown_rx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        shutdown_tx.send_replace(true);
        let result = tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::Shutdown)));
        assert_eq!(rx.len(), 1);
        assert_eq!(tx.credits(), 0);
    }
}
