//! Windowed aggregation operator
//!
//! Records are assigned to windows and folded into per-window accumulators
//! held in the partition [`StateStore`]. A window fires once the watermark
//! reaches its end; a session fires once the watermark passes it. With allowed lateness, the fired accumulator is kept
//! until `end + allowed_lateness` so that stragglers can update it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{Emitted, Output, SideOutput};
use crate::aggregation::{Accumulator, AggregateFunction, AggregateValue};
use crate::core::{Payload, Record};
use crate::error::Result;
use crate::state::{StateStore, StoredWindow, WindowSlot};
use crate::watermark::Watermark;
use crate::window::{
    is_late, merge_sessions, LateRecordPolicy, LateRecordTracker, Window, WindowAssigner,
    WindowId, WindowKind,
};

/// Whether a result is the first emission of its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Final,
    /// Re-emission after a late or straggling record changed the window
    Update,
    /// Contribution of a late record to a window whose state was already
    /// purged. Not the window's value; consumers combine it with the `Final`.
    Delta,
}

/// Finalized value of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult<V> {
    pub window_id: WindowId,
    pub window_kind: WindowKind,
    pub value: AggregateValue<V>,
    pub kind: ResultKind,
}

impl<V> WindowResult<V> {
    pub fn key(&self) -> &str {
        &self.window_id.key
    }

    pub fn is_update(&self) -> bool {
        self.kind == ResultKind::Update
    }

    pub fn is_delta(&self) -> bool {
        self.kind == ResultKind::Delta
    }
}

/// Window aggregation over one partition
#[derive(Debug)]
pub struct AggregationOperator<V> {
    assigner: WindowAssigner,
    function: AggregateFunction,
    allowed_lateness: i64,
    late_policy: LateRecordPolicy,
    store: StateStore<V>,
    partition: u32,
    late_records: Arc<LateRecordTracker>,
}

impl<V: Payload> AggregationOperator<V> {
    pub fn new(
        assigner: WindowAssigner,
        function: AggregateFunction,
        store: StateStore<V>,
        partition: u32,
    ) -> Self {
        Self {
            assigner,
            function,
            allowed_lateness: 0,
            late_policy: LateRecordPolicy::Drop,
            store,
            partition,
            late_records: Arc::new(LateRecordTracker::new()),
        }
    }

    pub fn with_lateness(mut self, allowed_lateness_ms: i64, policy: LateRecordPolicy) -> Self {
        self.allowed_lateness = allowed_lateness_ms.max(0);
        self.late_policy = policy;
        self
    }

    pub fn with_late_tracker(mut self, tracker: Arc<LateRecordTracker>) -> Self {
        self.late_records = tracker;
        self
    }

    pub fn store(&self) -> &StateStore<V> {
        &self.store
    }

    pub fn late_records(&self) -> &LateRecordTracker {
        &self.late_records
    }

    /// Fold one record into its windows
    pub async fn process_record(&mut self, record: &Record<V>, watermark: Watermark) -> Result<Emitted<V>> {
        // reject non-numeric input before any state is touched
        self.function.fold(None, record)?;

        let late = is_late(record.event_time, watermark, self.allowed_lateness);
        if late {
            let lateness = watermark.timestamp.saturating_sub(record.event_time);
            self.late_records.record(self.late_policy, lateness, self.partition);
            match self.late_policy {
                LateRecordPolicy::Drop => return Ok(Emitted::new()),
                LateRecordPolicy::SideOutput => {
                    return Ok(Emitted::side_output(SideOutput::LateRecord {
                        record: record.clone(),
                        watermark,
                    }))
                }
                LateRecordPolicy::UpdateAndReemit => {}
            }
        }

        trace!(partition = self.partition, key = %record.key, event_time = record.event_time, "Aggregating record");
        if self.assigner.is_session() {
            return self.process_session(record, watermark, late).await;
        }

        let mut emitted = Emitted::new();
        for window in self.assigner.assign(record.event_time)? {
            if let Some(result) = self.fold_into(window, record, watermark, late).await? {
                emitted.outputs.push(Output::Window(result));
            }
        }
        Ok(emitted)
    }

    async fn fold_into(
        &self,
        window: Window,
        record: &Record<V>,
        watermark: Watermark,
        late: bool,
    ) -> Result<Option<WindowResult<V>>> {
        let key = record.key.as_str();
        if !window.is_closed_by(watermark) {
            let existing = self.store.get_window(WindowSlot::Open, key, &window).await?;
            let accumulator = self.function.fold(existing.map(|s| s.accumulator), record)?;
            self.store
                .put_window(WindowSlot::Open, key, &StoredWindow { window, accumulator })
                .await?;
            return Ok(None);
        }

        let fired = self.store.get_window(WindowSlot::Fired, key, &window).await?;
        let kind = match (&fired, late) {
            (Some(_), _) => ResultKind::Update,
            (None, true) => ResultKind::Delta,
            (None, false) => ResultKind::Final,
        };
        let accumulator = self.function.fold(fired.map(|s| s.accumulator), record)?;
        let result = self.result(key, &window, &accumulator, kind)?;
        if kind == ResultKind::Delta {
            debug!(partition = self.partition, window = %result.window_id, "Emitting late delta for purged window");
            return Ok(Some(result));
        }
        self.store
            .put_window(WindowSlot::Fired, key, &StoredWindow { window, accumulator })
            .await?;
        debug!(partition = self.partition, window = %result.window_id, "Re-emitting closed window");
        Ok(Some(result))
    }

    /// Merge the record's session proposal with every session it touches
    async fn process_session(&self, record: &Record<V>, watermark: Watermark, late: bool) -> Result<Emitted<V>> {
        let key = record.key.as_str();
        let proposal = self
            .assigner
            .assign(record.event_time)?
            .into_iter()
            .next()
            .ok_or_else(|| crate::error::WindowError::InvalidTimestamp {
                timestamp: record.event_time,
                reason: "no session proposal".to_string(),
            })?;

        let open = self.store.windows_for_key(WindowSlot::Open, key).await?;
        let fired = self.store.windows_for_key(WindowSlot::Fired, key).await?;
        let candidates: Vec<Window> = open.iter().chain(fired.iter()).map(|s| s.window).collect();
        let (merged, absorbed) = merge_sessions(proposal, &candidates);

        let mut accumulator: Option<Accumulator<V>> = None;
        let mut absorbed_fired = false;
        for stored in open.iter().chain(fired.iter()) {
            if !absorbed.contains(&stored.window) {
                continue;
            }
            let slot = if open.iter().any(|o| o.window == stored.window) {
                WindowSlot::Open
            } else {
                absorbed_fired = true;
                WindowSlot::Fired
            };
            accumulator = Some(match accumulator {
                None => stored.accumulator.clone(),
                Some(acc) => self.function.merge(acc, &stored.accumulator)?,
            });
            self.store.delete_window(slot, key, &stored.window).await?;
        }
        let accumulator = self.function.fold(accumulator, record)?;

        if absorbed.len() > 1 {
            debug!(partition = self.partition, key, session = %merged, merged = absorbed.len(), "Merged sessions");
        }

        if !merged.is_closed_by(watermark) {
            self.store
                .put_window(WindowSlot::Open, key, &StoredWindow { window: merged, accumulator })
                .await?;
            return Ok(Emitted::new());
        }

        let kind = match (absorbed_fired, late) {
            (true, _) => ResultKind::Update,
            (false, true) => ResultKind::Delta,
            (false, false) => ResultKind::Final,
        };
        let result = self.result(key, &merged, &accumulator, kind)?;
        if kind == ResultKind::Delta {
            return Ok(Emitted::output(Output::Window(result)));
        }
        self.store
            .put_window(WindowSlot::Fired, key, &StoredWindow { window: merged, accumulator })
            .await?;
        Ok(Emitted::output(Output::Window(result)))
    }

    /// Fire every open window the watermark closed, purge expired fired ones
    pub async fn on_watermark(&mut self, watermark: Watermark) -> Result<Emitted<V>> {
        let mut emitted = Emitted::new();

        for (id, stored) in self.store.all_windows(WindowSlot::Open).await? {
            if !stored.window.is_closed_by(watermark) {
                continue;
            }
            let result = self.result(&id.key, &stored.window, &stored.accumulator, ResultKind::Final)?;
            debug!(partition = self.partition, window = %id, %watermark, "Window fired");
            self.store.delete_window(WindowSlot::Open, &id.key, &stored.window).await?;
            if !self.is_expired(&stored.window, watermark) {
                self.store.put_window(WindowSlot::Fired, &id.key, &stored).await?;
            }
            emitted.outputs.push(Output::Window(result));
        }

        for (id, stored) in self.store.all_windows(WindowSlot::Fired).await? {
            if self.is_expired(&stored.window, watermark) {
                trace!(partition = self.partition, window = %id, "Purging fired window");
                self.store.delete_window(WindowSlot::Fired, &id.key, &stored.window).await?;
            }
        }

        Ok(emitted)
    }

    /// Past the allowed lateness; nothing can update it any more
    fn is_expired(&self, window: &Window, watermark: Watermark) -> bool {
        window.is_past(window.end.saturating_add(self.allowed_lateness), watermark)
    }

    fn result(
        &self,
        key: &str,
        window: &Window,
        accumulator: &Accumulator<V>,
        kind: ResultKind,
    ) -> Result<WindowResult<V>> {
        Ok(WindowResult {
            window_id: window.id(key),
            window_kind: window.kind,
            value: self.function.finalize(accumulator)?,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateBackend;

    fn operator(assigner: WindowAssigner, function: AggregateFunction) -> AggregationOperator<f64> {
        let store = StateStore::new(Arc::new(MemoryStateBackend::new()));
        AggregationOperator::new(assigner, function, store, 0)
    }

    fn windows(emitted: &Emitted<f64>) -> Vec<(i64, i64, Option<f64>, ResultKind)> {
        emitted
            .outputs
            .iter()
            .filter_map(Output::as_window)
            .map(|r| (r.window_id.start, r.window_id.end, r.value.as_f64(), r.kind))
            .collect()
    }

    #[tokio::test]
    async fn test_tumbling_count_fires_on_watermark() {
        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Count);
        for t in [1, 3, 9, 11] {
            let emitted = op.process_record(&Record::new("k1", 1.0, t), Watermark::min()).await.unwrap();
            assert!(emitted.is_empty());
        }

        let emitted = op.on_watermark(Watermark::new(12)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(3.0), ResultKind::Final)]);

        let emitted = op.on_watermark(Watermark::max()).await.unwrap();
        assert_eq!(windows(&emitted), vec![(10, 20, Some(1.0), ResultKind::Final)]);
        assert_eq!(op.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sliding_sum_lands_in_every_window() {
        let mut op = operator(WindowAssigner::sliding(60_000, 20_000).unwrap(), AggregateFunction::Sum);
        op.process_record(&Record::new("k", 2.0, 50_000), Watermark::min()).await.unwrap();
        op.process_record(&Record::new("k", 3.0, 65_000), Watermark::min()).await.unwrap();

        let emitted = op.on_watermark(Watermark::max()).await.unwrap();
        assert_eq!(
            windows(&emitted),
            vec![
                (0, 60_000, Some(2.0), ResultKind::Final),
                (20_000, 80_000, Some(5.0), ResultKind::Final),
                (40_000, 100_000, Some(5.0), ResultKind::Final),
                (60_000, 120_000, Some(3.0), ResultKind::Final),
            ]
        );
    }

    #[tokio::test]
    async fn test_late_record_policies() {
        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Count);
        let late = Record::new("k", 1.0, 2);
        assert!(op.process_record(&late, Watermark::new(20)).await.unwrap().is_empty());
        assert_eq!(op.late_records().stats().dropped, 1);

        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Count)
            .with_lateness(0, LateRecordPolicy::SideOutput);
        let emitted = op.process_record(&late, Watermark::new(20)).await.unwrap();
        assert!(emitted.outputs.is_empty());
        assert!(matches!(
            &emitted.side_outputs[0],
            SideOutput::LateRecord { watermark, .. } if *watermark == Watermark::new(20)
        ));

        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Count)
            .with_lateness(0, LateRecordPolicy::UpdateAndReemit);
        let emitted = op.process_record(&late, Watermark::new(20)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(1.0), ResultKind::Delta)]);
        assert_eq!(op.late_records().stats().reemitted, 1);
        assert_eq!(op.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reemit_after_purge_never_replaces_final_value() {
        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Count)
            .with_lateness(0, LateRecordPolicy::UpdateAndReemit);
        for t in [1, 5] {
            op.process_record(&Record::new("k", 1.0, t), Watermark::min()).await.unwrap();
        }
        let emitted = op.on_watermark(Watermark::new(10)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(2.0), ResultKind::Final)]);

        // two late records each report only their own contribution
        for _ in 0..2 {
            let emitted = op.process_record(&Record::new("k", 1.0, 3), Watermark::new(10)).await.unwrap();
            assert_eq!(windows(&emitted), vec![(0, 10, Some(1.0), ResultKind::Delta)]);
            assert!(emitted.outputs.iter().filter_map(Output::as_window).all(|r| !r.is_update()));
        }
        assert_eq!(op.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reemit_within_lateness_updates_full_value() {
        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Count)
            .with_lateness(5, LateRecordPolicy::UpdateAndReemit);
        for t in [1, 5] {
            op.process_record(&Record::new("k", 1.0, t), Watermark::min()).await.unwrap();
        }
        op.on_watermark(Watermark::new(10)).await.unwrap();

        let emitted = op.process_record(&Record::new("k", 1.0, 3), Watermark::new(12)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(3.0), ResultKind::Update)]);
    }

    #[tokio::test]
    async fn test_allowed_lateness_updates_fired_window() {
        let mut op = operator(WindowAssigner::tumbling(10).unwrap(), AggregateFunction::Sum)
            .with_lateness(5, LateRecordPolicy::Drop);
        op.process_record(&Record::new("k", 1.0, 4), Watermark::min()).await.unwrap();
        let emitted = op.on_watermark(Watermark::new(10)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(1.0), ResultKind::Final)]);

        // within lateness: updates the fired window
        let emitted = op.process_record(&Record::new("k", 2.0, 7), Watermark::new(11)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(3.0), ResultKind::Update)]);

        // purged at end + lateness
        op.on_watermark(Watermark::new(15)).await.unwrap();
        assert_eq!(op.store().len().await.unwrap(), 0);

        // now late and dropped
        let emitted = op.process_record(&Record::new("k", 2.0, 8), Watermark::new(15)).await.unwrap();
        assert!(emitted.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_merge_and_fire() {
        let mut op = operator(WindowAssigner::session(5).unwrap(), AggregateFunction::Count);
        op.process_record(&Record::new("u", 1.0, 0), Watermark::min()).await.unwrap();
        op.process_record(&Record::new("u", 1.0, 20), Watermark::min()).await.unwrap();
        assert_eq!(op.store().len().await.unwrap(), 2);

        // bridges nothing: 10 touches neither [0,5) nor [20,25)
        op.process_record(&Record::new("u", 1.0, 10), Watermark::min()).await.unwrap();
        assert_eq!(op.store().len().await.unwrap(), 3);

        // 4 extends [0,5) to [0,9); 9 joins [0,9) and [10,15) into [0,15)
        op.process_record(&Record::new("u", 1.0, 4), Watermark::min()).await.unwrap();
        op.process_record(&Record::new("u", 1.0, 9), Watermark::min()).await.unwrap();

        let emitted = op.on_watermark(Watermark::max()).await.unwrap();
        assert_eq!(
            windows(&emitted),
            vec![(0, 15, Some(4.0), ResultKind::Final), (20, 25, Some(1.0), ResultKind::Final)]
        );
    }

    #[tokio::test]
    async fn test_record_at_session_gap_boundary_extends_session() {
        let mut op = operator(WindowAssigner::session(5).unwrap(), AggregateFunction::Sum);
        op.process_record(&Record::new("u", 1.0, 0), Watermark::min()).await.unwrap();

        // watermark at last + gap does not close the session
        let emitted = op.on_watermark(Watermark::new(5)).await.unwrap();
        assert!(emitted.is_empty());

        let emitted = op.process_record(&Record::new("u", 1.0, 5), Watermark::new(5)).await.unwrap();
        assert!(emitted.is_empty());

        let emitted = op.on_watermark(Watermark::max()).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 10, Some(2.0), ResultKind::Final)]);
    }

    #[tokio::test]
    async fn test_session_fires_once_watermark_passes_gap() {
        let mut op = operator(WindowAssigner::session(5).unwrap(), AggregateFunction::Count);
        op.process_record(&Record::new("u", 1.0, 0), Watermark::min()).await.unwrap();
        assert!(op.on_watermark(Watermark::new(5)).await.unwrap().is_empty());

        let emitted = op.on_watermark(Watermark::new(6)).await.unwrap();
        assert_eq!(windows(&emitted), vec![(0, 5, Some(1.0), ResultKind::Final)]);

        // one past the gap starts a new session
        let emitted = op.process_record(&Record::new("u", 1.0, 6), Watermark::new(6)).await.unwrap();
        assert!(emitted.is_empty());
        let emitted = op.on_watermark(Watermark::max()).await.unwrap();
        assert_eq!(windows(&emitted), vec![(6, 11, Some(1.0), ResultKind::Final)]);
    }

    #[tokio::test]
    async fn test_non_numeric_value_fails_without_state_change() {
        let store = StateStore::new(Arc::new(MemoryStateBackend::new()));
        let mut op: AggregationOperator<serde_json::Value> = AggregationOperator::new(
            WindowAssigner::tumbling(10).unwrap(),
            AggregateFunction::Sum,
            store,
            0,
        );
        let bad = Record::new("k", serde_json::json!({"nested": true}), 1);
        assert!(op.process_record(&bad, Watermark::min()).await.is_err());
        assert_eq!(op.store().len().await.unwrap(), 0);
    }
}
