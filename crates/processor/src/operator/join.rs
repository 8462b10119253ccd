//! Interval join of two keyed streams
//!
//! Both sides are buffered in the partition [`StateStore`]. A record from one
//! side joins every buffered record of the other side with the same key whose
//! event time is within `skew`. Buffered records expire at
//! `event_time + skew` and are purged once the watermark passes that point.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

use super::{Emitted, Output};
use crate::core::{JoinSide, Payload, Record};
use crate::error::Result;
use crate::state::{JoinEntry, StateStore};
use crate::watermark::Watermark;

/// Which unmatched records survive expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Only matched pairs
    #[default]
    Inner,
    /// Unmatched left records are emitted with no right partner
    Left,
    /// Unmatched right records are emitted with no left partner
    Right,
    /// Unmatched records of both sides are emitted
    Full,
}

impl JoinType {
    /// Whether unmatched records of `side` are emitted on expiry
    pub fn preserves(&self, side: JoinSide) -> bool {
        matches!(
            (self, side),
            (JoinType::Full, _) | (JoinType::Left, JoinSide::Left) | (JoinType::Right, JoinSide::Right)
        )
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "inner"),
            JoinType::Left => write!(f, "left"),
            JoinType::Right => write!(f, "right"),
            JoinType::Full => write!(f, "full"),
        }
    }
}

/// One join result; outer joins leave the missing side empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedPair<V> {
    pub key: String,
    pub left: Option<Record<V>>,
    pub right: Option<Record<V>>,
}

impl<V> JoinedPair<V> {
    pub fn matched(left: Record<V>, right: Record<V>) -> Self {
        Self {
            key: left.key.clone(),
            left: Some(left),
            right: Some(right),
        }
    }

    fn unmatched(side: JoinSide, record: Record<V>) -> Self {
        let key = record.key.clone();
        match side {
            JoinSide::Left => Self {
                key,
                left: Some(record),
                right: None,
            },
            JoinSide::Right => Self {
                key,
                left: None,
                right: Some(record),
            },
        }
    }

    pub fn is_matched(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

/// Stream-stream equi-join over one partition
#[derive(Debug)]
pub struct JoinOperator<V> {
    join_type: JoinType,
    skew: i64,
    store: StateStore<V>,
    partition: u32,
}

impl<V: Payload> JoinOperator<V> {
    pub fn new(join_type: JoinType, skew_ms: i64, store: StateStore<V>, partition: u32) -> Self {
        Self {
            join_type,
            skew: skew_ms.max(0),
            store,
            partition,
        }
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn store(&self) -> &StateStore<V> {
        &self.store
    }

    fn within_skew(&self, a: i64, b: i64) -> bool {
        (a as i128 - b as i128).abs() <= self.skew as i128
    }

    /// Buffer the record and join it with the opposite side
    pub async fn process_record(
        &mut self,
        side: JoinSide,
        record: &Record<V>,
        _watermark: Watermark,
    ) -> Result<Emitted<V>> {
        let mut emitted = Emitted::new();
        let mut matched = false;

        for (entry_key, mut other) in self
            .store
            .join_entries_for_key(side.opposite(), &record.key)
            .await?
        {
            if !self.within_skew(record.event_time, other.record.event_time) {
                continue;
            }
            matched = true;
            let pair = match side {
                JoinSide::Left => JoinedPair::matched(record.clone(), other.record.clone()),
                JoinSide::Right => JoinedPair::matched(other.record.clone(), record.clone()),
            };
            emitted.outputs.push(Output::Join(pair));
            if !other.matched {
                other.matched = true;
                self.store.update_join_entry(&entry_key, &other).await?;
            }
        }

        let entry = JoinEntry {
            side,
            record: record.clone(),
            expiry: record.event_time.saturating_add(self.skew),
            matched,
        };
        self.store.insert_join_entry(&entry).await?;

        trace!(
            partition = self.partition,
            key = %record.key,
            %side,
            matches = emitted.outputs.len(),
            "Join record buffered"
        );
        Ok(emitted)
    }

    /// Purge entries whose expiry the watermark passed
    pub async fn on_watermark(&mut self, watermark: Watermark) -> Result<Emitted<V>> {
        let mut emitted = Emitted::new();
        let mut purged = 0usize;

        for side in [JoinSide::Left, JoinSide::Right] {
            for (entry_key, entry) in self.store.join_entries(side).await? {
                if !(watermark.is_max() || entry.expiry < watermark.timestamp) {
                    continue;
                }
                self.store.delete_join_entry(&entry_key).await?;
                purged += 1;
                if !entry.matched && self.join_type.preserves(side) {
                    emitted
                        .outputs
                        .push(Output::Join(JoinedPair::unmatched(side, entry.record)));
                }
            }
        }

        if purged > 0 {
            debug!(
                partition = self.partition,
                purged,
                unmatched = emitted.outputs.len(),
                %watermark,
                "Expired join buffer entries"
            );
        }
        Ok(emitted)
    }
}
