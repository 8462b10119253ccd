//! In-memory source
//!
//! Replays a fixed list of records (and optionally explicit watermarks).
//! The position is the index of the next item, so a seek replays exactly
//! the items after a checkpoint.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{PositionToken, Source, SourceBatch};
use crate::core::Record;
use crate::error::{EngineError, Result};
use crate::watermark::{BoundedOutOfOrdernessWatermark, Watermark, WatermarkGenerator};

const DEFAULT_BATCH_SIZE: usize = 64;

/// One element of a scripted source
#[derive(Debug, Clone)]
pub enum SourceItem<V> {
    Record(Record<V>),
    /// Explicit watermark; ends the batch it appears in
    Watermark(Watermark),
}

impl<V> From<Record<V>> for SourceItem<V> {
    fn from(record: Record<V>) -> Self {
        SourceItem::Record(record)
    }
}

/// Source over an in-memory list of items
#[derive(Debug)]
pub struct MemorySource<V> {
    id: String,
    items: Vec<SourceItem<V>>,
    offset: usize,
    batch_size: usize,
    generator: Option<BoundedOutOfOrdernessWatermark>,
    committed: Option<PositionToken>,
    polls: Arc<AtomicU64>,
    closed: bool,
}

impl<V: Clone> MemorySource<V> {
    /// Source whose watermark trails the largest event time seen, with no delay
    pub fn new(id: impl Into<String>, records: Vec<Record<V>>) -> Self {
        Self {
            id: id.into(),
            items: records.into_iter().map(SourceItem::Record).collect(),
            offset: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            generator: Some(BoundedOutOfOrdernessWatermark::new(Duration::ZERO)),
            committed: None,
            polls: Arc::new(AtomicU64::new(0)),
            closed: false,
        }
    }

    /// Source driven only by the explicit watermarks among `items`
    pub fn from_items(id: impl Into<String>, items: Vec<SourceItem<V>>) -> Self {
        Self {
            generator: None,
            items,
            ..Self::new(id, Vec::new())
        }
    }

    /// Derive watermarks from event times, trailing by `delay`
    pub fn with_out_of_orderness(mut self, delay: Duration) -> Self {
        self.generator = Some(BoundedOutOfOrdernessWatermark::new(delay));
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Shared counter of `poll()` invocations
    pub fn poll_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.polls)
    }

    /// Last position passed to `commit_position`
    pub fn committed_position(&self) -> Option<&PositionToken> {
        self.committed.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Items not yet returned
    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.offset)
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Source<V> for MemorySource<V> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn poll(&mut self) -> Result<SourceBatch<V>> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if self.offset >= self.items.len() {
            return Ok(SourceBatch::end_of_stream());
        }

        let mut records = Vec::new();
        let mut watermark = None;
        while self.offset < self.items.len() && records.len() < self.batch_size {
            let item = &self.items[self.offset];
            self.offset += 1;
            match item {
                SourceItem::Record(record) => {
                    if let Some(generator) = self.generator.as_mut() {
                        if let Some(wm) = generator.on_event(record.event_time) {
                            watermark = Some(wm);
                        }
                    }
                    records.push(record.clone());
                }
                SourceItem::Watermark(wm) => {
                    watermark = Some(watermark.map_or(*wm, |w| std::cmp::max(w, *wm)));
                    break;
                }
            }
        }

        trace!(source = %self.id, records = records.len(), offset = self.offset, "Polled memory source");
        let mut batch = SourceBatch::new(records).with_watermark(watermark);
        batch.end_of_stream = self.offset >= self.items.len();
        Ok(batch)
    }

    fn position(&self) -> PositionToken {
        PositionToken::from_u64(self.offset as u64)
    }

    async fn commit_position(&mut self, token: &PositionToken) -> Result<()> {
        self.committed = Some(token.clone());
        Ok(())
    }

    async fn seek(&mut self, token: &PositionToken) -> Result<()> {
        let offset = token
            .as_u64()
            .ok_or_else(|| EngineError::Unexpected(format!("invalid memory source position {}", token)))?
            as usize;
        if offset > self.items.len() {
            return Err(EngineError::Unexpected(format!(
                "memory source '{}' has {} items, cannot seek to {}",
                self.id,
                self.items.len(),
                offset
            )));
        }
        self.offset = offset;
        if let Some(generator) = self.generator.as_mut() {
            generator.reset();
        }
        debug!(source = %self.id, offset, "Memory source repositioned");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
