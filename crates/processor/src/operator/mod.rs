//! Keyed operators
//!
//! A partition worker drives exactly one operator. Operators read and write
//! the partition's [`StateStore`] and return what they emit synchronously,
//! either from a record ([`Operator::process_record`]) or from a watermark
//! advance ([`Operator::on_watermark`]).

pub mod aggregate;
pub mod join;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::aggregation::AggregateFunction;
use crate::core::{JoinSide, Payload, Record};
use crate::error::{EngineError, Result};
use crate::state::{StateSnapshot, StateStore};
use crate::watermark::Watermark;
use crate::window::{LateRecordPolicy, LateRecordTracker, WindowAssigner};

pub use aggregate::{AggregationOperator, ResultKind, WindowResult};
pub use join::{JoinOperator, JoinType, JoinedPair};

/// Result delivered to the main sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output<V> {
    Window(WindowResult<V>),
    Join(JoinedPair<V>),
}

impl<V> Output<V> {
    pub fn as_window(&self) -> Option<&WindowResult<V>> {
        match self {
            Output::Window(result) => Some(result),
            Output::Join(_) => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinedPair<V>> {
        match self {
            Output::Join(pair) => Some(pair),
            Output::Window(_) => None,
        }
    }
}

/// Record diverted from the main flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideOutput<V> {
    /// Record behind `watermark - allowed_lateness` under the side-output policy
    LateRecord { record: Record<V>, watermark: Watermark },
    /// Record whose processing failed on every attempt
    Poison {
        record: Record<V>,
        attempts: u32,
        reason: String,
    },
}

impl<V> SideOutput<V> {
    pub fn record(&self) -> &Record<V> {
        match self {
            SideOutput::LateRecord { record, .. } | SideOutput::Poison { record, .. } => record,
        }
    }
}

/// Everything one operator call produced
#[derive(Debug, Clone, PartialEq)]
pub struct Emitted<V> {
    pub outputs: Vec<Output<V>>,
    pub side_outputs: Vec<SideOutput<V>>,
}

impl<V> Default for Emitted<V> {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            side_outputs: Vec::new(),
        }
    }
}

impl<V> Emitted<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(output: Output<V>) -> Self {
        Self {
            outputs: vec![output],
            side_outputs: Vec::new(),
        }
    }

    pub fn side_output(side: SideOutput<V>) -> Self {
        Self {
            outputs: Vec::new(),
            side_outputs: vec![side],
        }
    }

    pub fn extend(&mut self, other: Emitted<V>) {
        self.outputs.extend(other.outputs);
        self.side_outputs.extend(other.side_outputs);
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.side_outputs.is_empty()
    }
}

/// Static description of the operator stage
#[derive(Debug, Clone)]
pub enum OperatorSpec {
    Aggregate {
        assigner: WindowAssigner,
        function: AggregateFunction,
        allowed_lateness_ms: i64,
        late_policy: LateRecordPolicy,
    },
    Join {
        join_type: JoinType,
        skew_ms: i64,
    },
}

impl OperatorSpec {
    pub fn is_join(&self) -> bool {
        matches!(self, OperatorSpec::Join { .. })
    }

    /// Instantiate the operator for one partition
    pub fn build<V: Payload>(
        &self,
        store: StateStore<V>,
        partition: u32,
        late_records: Arc<LateRecordTracker>,
    ) -> Operator<V> {
        match self {
            OperatorSpec::Aggregate {
                assigner,
                function,
                allowed_lateness_ms,
                late_policy,
            } => Operator::Aggregate(AggregationOperator::new(
                *assigner,
                function.clone(),
                store,
                partition,
            )
            .with_lateness(*allowed_lateness_ms, *late_policy)
            .with_late_tracker(late_records)),
            OperatorSpec::Join { join_type, skew_ms } => {
                Operator::Join(JoinOperator::new(*join_type, *skew_ms, store, partition))
            }
        }
    }
}

/// Operator owned by one partition worker
#[derive(Debug)]
pub enum Operator<V> {
    Aggregate(AggregationOperator<V>),
    Join(JoinOperator<V>),
}

impl<V: Payload> Operator<V> {
    /// Process one record; `side` is required by joins and ignored by aggregations
    pub async fn process_record(
        &mut self,
        side: Option<JoinSide>,
        record: &Record<V>,
        watermark: Watermark,
    ) -> Result<Emitted<V>> {
        match self {
            Operator::Aggregate(op) => op.process_record(record, watermark).await,
            Operator::Join(op) => {
                let side = side.ok_or_else(|| {
                    EngineError::config(format!(
                        "join record with key '{}' arrived without a side",
                        record.key
                    ))
                })?;
                op.process_record(side, record, watermark).await
            }
        }
    }

    /// Fire or expire everything the watermark has passed
    pub async fn on_watermark(&mut self, watermark: Watermark) -> Result<Emitted<V>> {
        match self {
            Operator::Aggregate(op) => op.on_watermark(watermark).await,
            Operator::Join(op) => op.on_watermark(watermark).await,
        }
    }

    pub fn store(&self) -> &StateStore<V> {
        match self {
            Operator::Aggregate(op) => op.store(),
            Operator::Join(op) => op.store(),
        }
    }

    /// Snapshot of the operator state
    pub async fn snapshot(&self, watermark: Watermark) -> Result<StateSnapshot> {
        Ok(self.store().snapshot(watermark).await?)
    }
}
