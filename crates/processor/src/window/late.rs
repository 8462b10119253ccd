//! Late record detection and policy

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::watermark::Watermark;

/// What to do with a record behind `watermark - allowed_lateness`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateRecordPolicy {
    /// Count, log at debug and discard
    #[default]
    Drop,
    /// Route to the side-output sink
    SideOutput,
    /// Fold into its windows and re-emit the closed ones as updates
    UpdateAndReemit,
}

/// A record is late when `event_time < watermark - allowed_lateness`
pub fn is_late(event_time: i64, watermark: Watermark, allowed_lateness: i64) -> bool {
    if watermark.is_min() {
        return false;
    }
    event_time < watermark.timestamp.saturating_sub(allowed_lateness)
}

/// Counters for late record handling
#[derive(Debug, Default)]
pub struct LateRecordTracker {
    dropped: AtomicU64,
    side_output: AtomicU64,
    reemitted: AtomicU64,
    total_lateness_ms: AtomicU64,
}

impl LateRecordTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a late arrival handled under `policy`
    pub fn record(&self, policy: LateRecordPolicy, lateness_ms: i64, partition: u32) {
        let counter = match policy {
            LateRecordPolicy::Drop => &self.dropped,
            LateRecordPolicy::SideOutput => &self.side_output,
            LateRecordPolicy::UpdateAndReemit => &self.reemitted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_lateness_ms
            .fetch_add(lateness_ms.max(0) as u64, Ordering::Relaxed);

        if policy == LateRecordPolicy::Drop {
            debug!(lateness_ms, partition, "Dropping late record");
        }
    }

    pub fn stats(&self) -> LateRecordStats {
        let dropped = self.dropped.load(Ordering::Relaxed);
        let side_output = self.side_output.load(Ordering::Relaxed);
        let reemitted = self.reemitted.load(Ordering::Relaxed);
        let total = dropped + side_output + reemitted;
        let total_lateness = self.total_lateness_ms.load(Ordering::Relaxed);

        LateRecordStats {
            dropped,
            side_output,
            reemitted,
            average_lateness_ms: if total > 0 { total_lateness / total } else { 0 },
        }
    }
}

/// Snapshot of [`LateRecordTracker`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateRecordStats {
    pub dropped: u64,
    pub side_output: u64,
    pub reemitted: u64,
    pub average_lateness_ms: u64,
}
