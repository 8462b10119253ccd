//! Event-time stream processing engine
//!
//! Keyed records flow from pluggable sources through one stateful operator
//! (windowed aggregation or an interval join) into pluggable sinks:
//!
//! - Tumbling, sliding and session windows driven by watermarks
//! - Allowed lateness with drop, side-output or re-emit policies
//! - Inner and outer interval joins
//! - Credit-based backpressure between every stage
//! - Barrier-aligned checkpoints with restart from the latest one
//! - Sink retries with exponential backoff and a dead-letter sink

pub mod aggregation;
pub mod backpressure;
pub mod config;
pub mod core;
pub mod error;
pub mod operator;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use crate::core::{partition_for, JoinSide, Payload, Record, ToF64};

pub use aggregation::{AggregateFunction, AggregateValue, Reducer};

pub use config::{OperatorKind, PipelineConfig, WindowType};

pub use error::{
    AggregationError, EngineError, Result, StateError, WatermarkError, WindowError,
};

pub use operator::{
    JoinType, JoinedPair, OperatorSpec, Output, ResultKind, SideOutput, WindowResult,
};

pub use pipeline::{
    ExecutorStats, RunOutcome, RunSummary, ShutdownHandle, StreamProcessor,
    StreamProcessorBuilder,
};

pub use retry::RetryPolicy;

pub use sink::{JsonLinesSink, MemorySink, Sink};

pub use source::{JsonLinesSource, MemorySource, PositionToken, Source, SourceBatch};

pub use state::{
    Checkpoint, CheckpointStorage, FileCheckpointStorage, InMemoryCheckpointStorage,
    StateBackendKind,
};

pub use watermark::Watermark;

pub use window::{LateRecordPolicy, LateRecordStats, Window, WindowAssigner, WindowId, WindowKind};
