//! Watermarks for event-time progress
//!
//! A watermark asserts that no record with a smaller event time is expected
//! any more. Each source produces its own watermark. The [`WatermarkTracker`]
//! keeps one monotonic watermark per source and exposes the global watermark,
//! the minimum over all sources.
//!
//! # Example
//!
//! ```rust
//! use stream_processor::watermark::{BoundedOutOfOrdernessWatermark, WatermarkGenerator};
//! use std::time::Duration;
//!
//! let mut generator = BoundedOutOfOrdernessWatermark::new(Duration::from_millis(500));
//! generator.on_event(1_000);
//! assert_eq!(generator.current_watermark().timestamp, 500);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{WatermarkError, WatermarkResult};

/// Represents a watermark timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, if representable
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// The initial watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// The final watermark, emitted once every source is exhausted
    pub fn max() -> Self {
        Self { timestamp: i64::MAX }
    }

    /// Checks if this watermark is before the given timestamp
    pub fn is_before(&self, timestamp: i64) -> bool {
        self.timestamp < timestamp
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Returns true if this is the maximum watermark
    pub fn is_max(&self) -> bool {
        self.timestamp == i64::MAX
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            write!(f, "Watermark(-inf)")
        } else if self.is_max() {
            write!(f, "Watermark(+inf)")
        } else {
            write!(f, "Watermark({})", self.timestamp)
        }
    }
}

/// Trait for generating watermarks from a single record stream
pub trait WatermarkGenerator: Send + Sync {
    /// Called for each record. Returns the new watermark if it advanced.
    fn on_event(&mut self, timestamp: i64) -> Option<Watermark>;

    /// Gets the current watermark without advancing it
    fn current_watermark(&self) -> Watermark;

    /// Resets the generator to its initial state
    fn reset(&mut self);
}

/// Bounded out-of-orderness watermark generator
///
/// Tracks the maximum event time seen and trails it by a fixed delay.
/// Records up to `max_out_of_orderness` behind the maximum are not late.
#[derive(Debug, Clone)]
pub struct BoundedOutOfOrdernessWatermark {
    max_out_of_orderness: Duration,
    max_timestamp: i64,
    current: Watermark,
}

impl BoundedOutOfOrdernessWatermark {
    /// Creates a new generator with the given delay
    pub fn new(max_out_of_orderness: Duration) -> Self {
        Self {
            max_out_of_orderness,
            max_timestamp: i64::MIN,
            current: Watermark::min(),
        }
    }

    /// Maximum event time seen so far
    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp
    }

    fn compute_watermark(&self) -> Watermark {
        let delay_ms = self.max_out_of_orderness.as_millis() as i64;
        Watermark::new(self.max_timestamp.saturating_sub(delay_ms))
    }
}

impl WatermarkGenerator for BoundedOutOfOrdernessWatermark {
    fn on_event(&mut self, timestamp: i64) -> Option<Watermark> {
        trace!(timestamp, "Processing event for watermark");
        if timestamp <= self.max_timestamp {
            return None;
        }
        self.max_timestamp = timestamp;

        let candidate = self.compute_watermark();
        if candidate > self.current {
            self.current = candidate;
            Some(candidate)
        } else {
            None
        }
    }

    fn current_watermark(&self) -> Watermark {
        self.current
    }

    fn reset(&mut self) {
        self.max_timestamp = i64::MIN;
        self.current = Watermark::min();
        debug!("Watermark generator reset");
    }
}

/// Per-source watermark bookkeeping
///
/// Each source watermark only moves forward (`fetch_max`). The global
/// watermark is the minimum over all sources, so it is non-decreasing too.
#[derive(Debug)]
pub struct WatermarkTracker {
    source_ids: Vec<String>,
    watermarks: Vec<AtomicI64>,
}

impl WatermarkTracker {
    /// Creates a tracker for the given sources, all starting at [`Watermark::min`]
    pub fn new(source_ids: Vec<String>) -> Self {
        let watermarks = source_ids
            .iter()
            .map(|_| AtomicI64::new(i64::MIN))
            .collect();
        Self {
            source_ids,
            watermarks,
        }
    }

    /// Number of tracked sources
    pub fn source_count(&self) -> usize {
        self.watermarks.len()
    }

    fn slot(&self, source: usize) -> WatermarkResult<&AtomicI64> {
        self.watermarks
            .get(source)
            .ok_or_else(|| WatermarkError::UnknownSource {
                source_id: format!("#{}", source),
            })
    }

    /// Index of a source by id
    pub fn index_of(&self, source_id: &str) -> WatermarkResult<usize> {
        self.source_ids
            .iter()
            .position(|id| id == source_id)
            .ok_or_else(|| WatermarkError::UnknownSource {
                source_id: source_id.to_string(),
            })
    }

    /// Advance a source watermark. Regressions are ignored.
    ///
    /// Returns the source watermark after the update.
    pub fn advance(&self, source: usize, watermark: Watermark) -> WatermarkResult<Watermark> {
        let slot = self.slot(source)?;
        let previous = slot.fetch_max(watermark.timestamp, Ordering::AcqRel);
        if watermark.timestamp < previous {
            trace!(
                source = %self.source_ids[source],
                current = previous,
                proposed = watermark.timestamp,
                "Ignoring watermark regression"
            );
        }
        Ok(Watermark::new(previous.max(watermark.timestamp)))
    }

    /// Mark a source as exhausted; it no longer holds back the global watermark
    pub fn finish(&self, source: usize) -> WatermarkResult<()> {
        self.slot(source)?.store(i64::MAX, Ordering::Release);
        Ok(())
    }

    /// Current watermark of one source
    pub fn source_watermark(&self, source: usize) -> WatermarkResult<Watermark> {
        Ok(Watermark::new(self.slot(source)?.load(Ordering::Acquire)))
    }

    /// Global watermark: minimum over all sources
    pub fn global(&self) -> Watermark {
        self.watermarks
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .min()
            .map(Watermark::new)
            .unwrap_or_else(Watermark::max)
    }

    /// Per-source watermarks in registration order
    pub fn snapshot(&self) -> Vec<Watermark> {
        self.watermarks
            .iter()
            .map(|w| Watermark::new(w.load(Ordering::Acquire)))
            .collect()
    }

    /// Restore per-source watermarks from a checkpoint
    pub fn restore(&self, watermarks: &[Watermark]) {
        for (slot, wm) in self.watermarks.iter().zip(watermarks) {
            slot.fetch_max(wm.timestamp, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_ordering() {
        let wm1 = Watermark::new(1000);
        let wm2 = Watermark::new(2000);
        assert!(wm1 < wm2);
        assert!(wm1.is_before(1001));
        assert!(Watermark::min() < wm1);
        assert!(Watermark::max() > wm2);
    }

    #[test]
    fn test_watermark_display() {
        assert_eq!(Watermark::new(12).to_string(), "Watermark(12)");
        assert_eq!(Watermark::max().to_string(), "Watermark(+inf)");
    }

    #[test]
    fn test_bounded_watermark_basic() {
        let mut generator = BoundedOutOfOrdernessWatermark::new(Duration::from_secs(5));
        generator.on_event(10_000);
        generator.on_event(15_000);
        generator.on_event(20_000);
        assert_eq!(generator.current_watermark().timestamp, 15_000);
    }

    #[test]
    fn test_bounded_watermark_out_of_order() {
        let mut generator = BoundedOutOfOrdernessWatermark::new(Duration::from_secs(10));
        generator.on_event(30_000);
        assert!(generator.on_event(20_000).is_none());
        assert!(generator.on_event(25_000).is_none());
        assert_eq!(generator.current_watermark().timestamp, 20_000);
    }

    #[test]
    fn test_bounded_watermark_reset() {
        let mut generator = BoundedOutOfOrdernessWatermark::new(Duration::ZERO);
        generator.on_event(5);
        generator.reset();
        assert!(generator.current_watermark().is_min());
    }

    #[test]
    fn test_tracker_global_is_min_of_sources() {
        let tracker = WatermarkTracker::new(vec!["a".into(), "b".into()]);
        assert!(tracker.global().is_min());

        tracker.advance(0, Watermark::new(100)).unwrap();
        assert!(tracker.global().is_min());

        tracker.advance(1, Watermark::new(40)).unwrap();
        assert_eq!(tracker.global(), Watermark::new(40));

        tracker.finish(1).unwrap();
        assert_eq!(tracker.global(), Watermark::new(100));

        tracker.finish(0).unwrap();
        assert!(tracker.global().is_max());
    }

    #[test]
    fn test_tracker_unknown_source() {
        let tracker = WatermarkTracker::new(vec!["a".into()]);
        assert!(tracker.advance(3, Watermark::new(1)).is_err());
        assert!(tracker.index_of("missing").is_err());
        assert_eq!(tracker.index_of("a").unwrap(), 0);
    }

    #[test]
    fn test_watermark_is_non_decreasing_under_any_interleaving() {
        // Deterministic pseudo-random interleavings of out-of-order proposals
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..50 {
            let tracker = WatermarkTracker::new(vec!["s0".into(), "s1".into(), "s2".into()]);
            let mut last_global = tracker.global();
            let mut last_per_source = tracker.snapshot();
            for _ in 0..200 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let source = (seed % 3) as usize;
                let proposed = ((seed >> 8) % 10_000) as i64;
                let current = tracker.advance(source, Watermark::new(proposed)).unwrap();

                assert!(current >= last_per_source[source]);
                last_per_source[source] = current;

                let global = tracker.global();
                assert!(global >= last_global);
                last_global = global;
            }
        }
    }

    #[test]
    fn test_tracker_restore() {
        let tracker = WatermarkTracker::new(vec!["a".into(), "b".into()]);
        tracker.restore(&[Watermark::new(7), Watermark::new(9)]);
        assert_eq!(tracker.global(), Watermark::new(7));
        assert_eq!(tracker.source_watermark(1).unwrap(), Watermark::new(9));
    }
}
