//! Stream processor builder
//!
//! Fluent configuration of sources, the operator stage, sinks and checkpoint
//! storage. Settings not given explicitly come from the [`PipelineConfig`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::executor::{SourceSlot, StatsCollector, StreamProcessor};
use crate::aggregation::AggregateFunction;
use crate::config::{OperatorKind, PipelineConfig, WindowType};
use crate::core::{JoinSide, Payload};
use crate::error::{EngineError, Result};
use crate::operator::{JoinType, OperatorSpec, Output, SideOutput};
use crate::sink::Sink;
use crate::source::Source;
use crate::state::{CheckpointStorage, InMemoryCheckpointStorage, StateBackendKind};
use crate::window::{LateRecordPolicy, LateRecordTracker};

/// Builder for a [`StreamProcessor`]
///
/// # Example
///
/// ```rust,no_run
/// use stream_processor::aggregation::AggregateFunction;
/// use stream_processor::pipeline::StreamProcessorBuilder;
/// use stream_processor::sink::MemorySink;
/// use stream_processor::source::MemorySource;
/// use stream_processor::Record;
///
/// # async fn example() -> anyhow::Result<()> {
/// let sink = MemorySink::new("results");
/// let mut processor = StreamProcessorBuilder::<f64>::new()
///     .with_name("latency-p50")
///     .with_source(MemorySource::new("events", vec![Record::new("svc-a", 12.0, 1_000)]))
///     .with_tumbling_window(60_000)
///     .with_aggregate(AggregateFunction::Average)
///     .with_sink(sink.clone())
///     .build()?;
///
/// let summary = processor.run().await?;
/// println!("{:?}", summary.outcome);
/// # Ok(())
/// # }
/// ```
pub struct StreamProcessorBuilder<V: Payload> {
    name: String,
    config: PipelineConfig,
    operator: Option<OperatorSpec>,
    function: Option<AggregateFunction>,
    sources: Vec<(Box<dyn Source<V>>, Option<JoinSide>)>,
    sink: Option<Arc<dyn Sink<Output<V>>>>,
    side_output_sink: Option<Arc<dyn Sink<SideOutput<V>>>>,
    dead_letter_sink: Option<Arc<dyn Sink<Output<V>>>>,
    checkpoints: Option<Arc<dyn CheckpointStorage>>,
}

impl<V: Payload> Default for StreamProcessorBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Payload> StreamProcessorBuilder<V> {
    pub fn new() -> Self {
        Self {
            name: "stream-processor".to_string(),
            config: PipelineConfig::default(),
            operator: None,
            function: None,
            sources: Vec::new(),
            sink: None,
            side_output_sink: None,
            dead_letter_sink: None,
            checkpoints: None,
        }
    }

    /// Start from a loaded configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Add an input for an aggregation pipeline
    pub fn with_source(mut self, source: impl Source<V> + 'static) -> Self {
        self.sources.push((Box::new(source), None));
        self
    }

    /// Set the left input of a join
    pub fn with_left_source(mut self, source: impl Source<V> + 'static) -> Self {
        self.sources.push((Box::new(source), Some(JoinSide::Left)));
        self
    }

    /// Set the right input of a join
    pub fn with_right_source(mut self, source: impl Source<V> + 'static) -> Self {
        self.sources.push((Box::new(source), Some(JoinSide::Right)));
        self
    }

    pub fn with_sink(mut self, sink: impl Sink<Output<V>> + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Destination for late and poison records; without one they are discarded
    pub fn with_side_output_sink(mut self, sink: impl Sink<SideOutput<V>> + 'static) -> Self {
        self.side_output_sink = Some(Arc::new(sink));
        self
    }

    /// Destination for batches the main sink rejected after every retry
    ///
    /// Without one, an exhausted sink halts the pipeline.
    pub fn with_dead_letter_sink(mut self, sink: impl Sink<Output<V>> + 'static) -> Self {
        self.dead_letter_sink = Some(Arc::new(sink));
        self
    }

    /// Where checkpoints are kept (in memory by default)
    pub fn with_checkpoint_storage(mut self, storage: impl CheckpointStorage + 'static) -> Self {
        self.checkpoints = Some(Arc::new(storage));
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.config.checkpoint_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_state_backend(mut self, backend: StateBackendKind) -> Self {
        self.config.state_backend = backend;
        self
    }

    /// Use a fully specified operator stage, ignoring the window and join settings
    pub fn with_operator(mut self, operator: OperatorSpec) -> Self {
        self.operator = Some(operator);
        self
    }

    /// # Arguments
    /// * `size_ms` - Window size in milliseconds
    pub fn with_tumbling_window(mut self, size_ms: i64) -> Self {
        self.config.operator = OperatorKind::Aggregate;
        self.config.window_type = WindowType::Tumbling;
        self.config.window_size_ms = size_ms;
        self
    }

    /// # Arguments
    /// * `size_ms` - Window size in milliseconds
    /// * `slide_ms` - Slide interval in milliseconds
    pub fn with_sliding_window(mut self, size_ms: i64, slide_ms: i64) -> Self {
        self.config.operator = OperatorKind::Aggregate;
        self.config.window_type = WindowType::Sliding;
        self.config.window_size_ms = size_ms;
        self.config.window_slide_ms = Some(slide_ms);
        self
    }

    /// # Arguments
    /// * `gap_ms` - Inactivity gap closing a session
    pub fn with_session_window(mut self, gap_ms: i64) -> Self {
        self.config.operator = OperatorKind::Aggregate;
        self.config.window_type = WindowType::Session;
        self.config.session_gap_ms = Some(gap_ms);
        self
    }

    /// Aggregate function, including closures wrapped in a reducer
    pub fn with_aggregate(mut self, function: AggregateFunction) -> Self {
        self.config.aggregate = function.name().to_string();
        self.function = Some(function);
        self
    }

    pub fn with_allowed_lateness(mut self, lateness_ms: i64, policy: LateRecordPolicy) -> Self {
        self.config.allowed_lateness_ms = lateness_ms;
        self.config.late_record_policy = policy;
        self
    }

    /// Interval join matching records whose event times differ by at most `skew_ms`
    pub fn with_join(mut self, join_type: JoinType, skew_ms: i64) -> Self {
        self.config.operator = OperatorKind::Join;
        self.config.join_type = join_type;
        self.config.join_skew_ms = skew_ms;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.config.partition_count = partitions;
        self
    }

    /// Capacity of every inter-stage queue
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn with_sink_batch_size(mut self, batch_size: usize) -> Self {
        self.config.sink_batch_size = batch_size;
        self
    }

    /// Sink write retries and the base of their exponential backoff
    pub fn with_sink_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.config.sink_max_retries = max_retries;
        self.config.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_max_record_attempts(mut self, attempts: u32) -> Self {
        self.config.max_record_attempts = attempts;
        self
    }

    pub fn with_max_restarts(mut self, restarts: u32) -> Self {
        self.config.max_restarts = restarts;
        self
    }

    fn operator_spec(&self) -> Result<OperatorSpec> {
        if let Some(operator) = &self.operator {
            if let OperatorSpec::Aggregate { assigner, .. } = operator {
                assigner.validate()?;
            }
            return Ok(operator.clone());
        }
        if self.config.operator == OperatorKind::Aggregate {
            if let Some(function) = &self.function {
                return Ok(OperatorSpec::Aggregate {
                    assigner: self.config.to_assigner()?,
                    function: function.clone(),
                    allowed_lateness_ms: self.config.allowed_lateness_ms,
                    late_policy: self.config.late_record_policy,
                });
            }
        }
        self.config.operator_spec()
    }

    /// Validate the settings and assemble the processor
    pub fn build(self) -> Result<StreamProcessor<V>> {
        let spec = self.operator_spec()?;
        self.config.validate_runtime()?;

        if self.name.is_empty() {
            return Err(EngineError::config("pipeline name cannot be empty"));
        }
        if self.sources.is_empty() {
            return Err(EngineError::config("at least one source is required"));
        }
        let sink = self
            .sink
            .ok_or_else(|| EngineError::config("a sink is required"))?;

        let mut ids = HashSet::new();
        for (source, _) in &self.sources {
            if !ids.insert(source.id().to_string()) {
                return Err(EngineError::config(format!("duplicate source id '{}'", source.id())));
            }
        }

        let left = self.sources.iter().filter(|(_, s)| *s == Some(JoinSide::Left)).count();
        let right = self.sources.iter().filter(|(_, s)| *s == Some(JoinSide::Right)).count();
        if spec.is_join() {
            if left != 1 || right != 1 || self.sources.len() != 2 {
                return Err(EngineError::config(
                    "a join needs exactly one left and one right source",
                ));
            }
        } else if left + right > 0 {
            return Err(EngineError::config("join sides are only valid for a join operator"));
        }

        let checkpoints = self.checkpoints.unwrap_or_else(|| {
            Arc::new(InMemoryCheckpointStorage::with_retention(
                self.config.checkpoint_retention,
            ))
        });
        let (shutdown, _) = watch::channel(false);

        Ok(StreamProcessor {
            name: self.name,
            config: self.config,
            spec,
            sources: self
                .sources
                .into_iter()
                .map(|(source, side)| SourceSlot {
                    source,
                    side,
                    initial: None,
                })
                .collect(),
            sink,
            side_output_sink: self.side_output_sink,
            dead_letter_sink: self.dead_letter_sink,
            checkpoints,
            shutdown: Arc::new(shutdown),
            late_records: Arc::new(LateRecordTracker::new()),
            stats: Arc::new(StatsCollector::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use crate::sink::MemorySink;
    use crate::source::MemorySource;

    fn source(id: &str) -> MemorySource<f64> {
        MemorySource::new(id, vec![Record::new("k", 1.0, 1)])
    }

    #[test]
    fn test_builder_defaults() {
        let processor = StreamProcessorBuilder::<f64>::new()
            .with_source(source("a"))
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap();

        assert_eq!(processor.name(), "stream-processor");
        assert_eq!(processor.config().partition_count, 4);
        assert!(!processor.shutdown_handle().is_shutdown());
    }

    #[test]
    fn test_builder_requires_source_and_sink() {
        let err = StreamProcessorBuilder::<f64>::new()
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("source"));

        let err = StreamProcessorBuilder::<f64>::new()
            .with_source(source("a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("sink"));
    }

    #[test]
    fn test_builder_rejects_duplicate_source_ids() {
        let err = StreamProcessorBuilder::<f64>::new()
            .with_source(source("a"))
            .with_source(source("a"))
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_builder_join_needs_both_sides() {
        let err = StreamProcessorBuilder::<f64>::new()
            .with_join(JoinType::Inner, 10)
            .with_left_source(source("left"))
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("left and one right"));

        StreamProcessorBuilder::<f64>::new()
            .with_join(JoinType::Left, 10)
            .with_left_source(source("left"))
            .with_right_source(source("right"))
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap();
    }

    #[test]
    fn test_builder_rejects_invalid_window() {
        let err = StreamProcessorBuilder::<f64>::new()
            .with_source(source("a"))
            .with_sliding_window(10, 20)
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Window(_)));
    }

    #[test]
    fn test_builder_accepts_reducer() {
        let processor = StreamProcessorBuilder::<f64>::new()
            .with_source(source("a"))
            .with_tumbling_window(1_000)
            .with_aggregate(AggregateFunction::Reduce(crate::aggregation::Reducer::new(
                "product",
                |a, b| a * b,
            )))
            .with_sink(MemorySink::new("out"))
            .build()
            .unwrap();
        assert!(format!("{:?}", processor).contains("product"));
    }
}
