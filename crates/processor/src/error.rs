//! Error types for the stream processor
//!
//! The top-level [`EngineError`] carries the failure taxonomy of the engine
//! (source reads, sink writes, state corruption, poison records) and wraps the
//! narrower per-concern errors for windowing, aggregation, state and
//! watermarks.

use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    /// A source could not be read after the adapter exhausted its retries
    #[error("source '{source_id}' read failed after {attempts} attempt(s): {reason}")]
    SourceRead {
        source_id: String,
        attempts: u32,
        reason: String,
    },

    /// A sink rejected a batch after the processor exhausted its retries
    #[error("sink write failed after {attempts} attempt(s): {reason}")]
    SinkWrite { attempts: u32, reason: String },

    /// A checkpoint failed its integrity check on restore
    #[error("state corruption in checkpoint {checkpoint_id}: {reason}")]
    StateCorruption { checkpoint_id: u64, reason: String },

    /// A record failed operator processing on every attempt
    #[error("poison record with key '{key}' after {attempts} attempt(s): {reason}")]
    PoisonRecord {
        key: String,
        attempts: u32,
        reason: String,
    },

    /// Window-related errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Aggregation-related errors
    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// State backend errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Watermark errors
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A partition worker stopped abnormally
    #[error("worker for partition {partition} failed: {reason}")]
    WorkerFailed { partition: u32, reason: String },

    /// The pipeline was asked to stop
    #[error("pipeline shut down")]
    Shutdown,

    /// A queue between two stages was closed while still in use
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl EngineError {
    /// Build a configuration error from a message
    pub fn config<S: Into<String>>(message: S) -> Self {
        EngineError::Configuration {
            source: message.into().into(),
        }
    }

    /// Whether the processor may restart from the last checkpoint after this error
    ///
    /// Only worker crashes are restartable. Source/sink exhaustion and state
    /// corruption are surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::WorkerFailed { .. })
    }
}

/// Window assignment and management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// Window size is invalid
    #[error("invalid window size: {size}ms, must be greater than 0")]
    InvalidWindowSize { size: i64 },

    /// Slide size is invalid for sliding windows
    #[error("invalid slide size: {slide}ms, must be greater than 0 and less than or equal to window size {window}ms")]
    InvalidSlideSize { slide: i64, window: i64 },

    /// Gap size is invalid for session windows
    #[error("invalid gap size: {gap}ms, must be greater than 0")]
    InvalidGapSize { gap: i64 },

    /// Window bounds would overflow the timestamp range
    #[error("invalid event timestamp: {timestamp}, reason: {reason}")]
    InvalidTimestamp { timestamp: i64, reason: String },

    /// Window merge operation failed
    #[error("window merge failed: {reason}")]
    MergeFailed { reason: String },
}

/// Aggregation computation errors
#[derive(Error, Debug)]
pub enum AggregationError {
    /// Invalid metric value (NaN, Inf, non-numeric)
    #[error("invalid value for {function}: {reason}")]
    InvalidValue { function: String, reason: String },

    /// Accumulator does not belong to the aggregate function
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Finalize was called on an accumulator that never saw a value
    #[error("insufficient data for {function}")]
    InsufficientData { function: String },
}

/// State backend operation errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State serialization failed
    #[error("state serialization failed for key '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for key '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// State backend storage error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },

    /// A state key could not be decoded
    #[error("malformed state key: {reason}")]
    MalformedKey { reason: String },

    /// Checkpoint creation failed
    #[error("checkpoint failed at {checkpoint_id}: {reason}")]
    CheckpointFailed { checkpoint_id: u64, reason: String },

    /// Checkpoint restoration failed
    #[error("restore failed from checkpoint {checkpoint_id}: {reason}")]
    RestoreFailed { checkpoint_id: u64, reason: String },
}

/// Watermark errors
#[derive(Error, Debug)]
pub enum WatermarkError {
    /// Watermark went backwards
    #[error("watermark regression: new watermark {new_watermark} is before current {current_watermark}")]
    WatermarkRegression {
        current_watermark: i64,
        new_watermark: i64,
    },

    /// Source is not registered with the tracker
    #[error("unknown source: {source_id}")]
    UnknownSource { source_id: String },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for window operations
pub type WindowResult<T> = std::result::Result<T, WindowError>;

/// Result type alias for aggregation operations
pub type AggregationResult<T> = std::result::Result<T, AggregationError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type alias for watermark operations
pub type WatermarkResult<T> = std::result::Result<T, WatermarkError>;

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Unexpected(err.to_string())
    }
}

impl From<sled::Error> for StateError {
    fn from(err: sled::Error) -> Self {
        StateError::StorageError {
            backend_type: "sled".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_error_display() {
        let err = WindowError::InvalidWindowSize { size: 0 };
        assert!(err.to_string().contains("invalid window size"));
    }

    #[test]
    fn test_state_corruption_display() {
        let err = EngineError::StateCorruption {
            checkpoint_id: 7,
            reason: "checksum mismatch".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("checkpoint 7"));
        assert!(message.contains("checksum mismatch"));
    }

    #[test]
    fn test_engine_error_from_window_error() {
        let window_err = WindowError::InvalidGapSize { gap: -1 };
        let engine_err: EngineError = window_err.into();
        assert!(matches!(engine_err, EngineError::Window(_)));
    }

    #[test]
    fn test_only_worker_failures_are_recoverable() {
        let crash = EngineError::WorkerFailed {
            partition: 2,
            reason: "panicked".to_string(),
        };
        assert!(crash.is_recoverable());

        let sink = EngineError::SinkWrite {
            attempts: 3,
            reason: "timeout".to_string(),
        };
        assert!(!sink.is_recoverable());
        assert!(!EngineError::config("bad").is_recoverable());
    }
}
