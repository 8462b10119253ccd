//! Pipeline configuration
//!
//! [`PipelineConfig`] carries every tunable of the engine. It is loaded from
//! a YAML file layered under `STREAM_`-prefixed environment variables, and
//! checked with [`PipelineConfig::validate`] before a processor is built.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregation::AggregateFunction;
use crate::error::{EngineError, Result};
use crate::operator::{JoinType, OperatorSpec};
use crate::retry::RetryPolicy;
use crate::state::StateBackendKind;
use crate::window::{LateRecordPolicy, WindowAssigner};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "STREAM_";

/// Type of windowing strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Fixed-size non-overlapping windows
    #[default]
    Tumbling,
    /// Fixed-size overlapping windows
    Sliding,
    /// Per-key activity sessions separated by a gap
    Session,
}

/// Which operator the pipeline runs
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    #[default]
    Aggregate,
    Join,
}

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Operator stage
    #[serde(default)]
    pub operator: OperatorKind,

    /// Type of window
    #[serde(default)]
    pub window_type: WindowType,

    /// Window size in milliseconds (tumbling/sliding)
    #[serde(default = "default_window_size")]
    pub window_size_ms: i64,

    /// Slide interval in milliseconds (sliding)
    #[serde(default)]
    pub window_slide_ms: Option<i64>,

    /// Inactivity gap in milliseconds (session)
    #[serde(default)]
    pub session_gap_ms: Option<i64>,

    /// How long a fired window still accepts updates
    #[serde(default)]
    pub allowed_lateness_ms: i64,

    #[serde(default)]
    pub late_record_policy: LateRecordPolicy,

    /// Aggregate function name: count, sum, min, max, avg, collect
    #[serde(default = "default_aggregate")]
    pub aggregate: String,

    #[serde(default)]
    pub join_type: JoinType,

    /// Maximum event-time distance of joined records
    #[serde(default = "default_join_skew")]
    pub join_skew_ms: i64,

    /// Interval between checkpoint barriers
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_ms: u64,

    /// Number of partition workers
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    #[serde(default)]
    pub state_backend: StateBackendKind,

    /// Capacity of every inter-stage queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum outputs per sink write
    #[serde(default = "default_sink_batch_size")]
    pub sink_batch_size: usize,

    /// Sink write retries before dead-lettering
    #[serde(default = "default_max_retries")]
    pub sink_max_retries: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Processing attempts before a record becomes poison
    #[serde(default = "default_max_record_attempts")]
    pub max_record_attempts: u32,

    /// Restarts from checkpoint after a worker failure
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Directory for checkpoint files
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Checkpoints kept on disk
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: usize,

    /// Directory for durable partition state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Watermark delay behind the largest event time seen by a source
    #[serde(default)]
    pub watermark_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            operator: OperatorKind::default(),
            window_type: WindowType::default(),
            window_size_ms: default_window_size(),
            window_slide_ms: None,
            session_gap_ms: None,
            allowed_lateness_ms: 0,
            late_record_policy: LateRecordPolicy::default(),
            aggregate: default_aggregate(),
            join_type: JoinType::default(),
            join_skew_ms: default_join_skew(),
            checkpoint_interval_ms: default_checkpoint_interval(),
            partition_count: default_partition_count(),
            state_backend: StateBackendKind::default(),
            queue_capacity: default_queue_capacity(),
            sink_batch_size: default_sink_batch_size(),
            sink_max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            max_record_attempts: default_max_record_attempts(),
            max_restarts: default_max_restarts(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_retention: default_checkpoint_retention(),
            state_dir: default_state_dir(),
            watermark_delay_ms: 0,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Self::default()));

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(EngineError::config(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        // Override with environment variables (prefixed with STREAM_)
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        figment.extract().map_err(|e| EngineError::Configuration {
            source: Box::new(e),
        })
    }

    /// Parse YAML text without consulting the environment
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| EngineError::Configuration {
                source: Box::new(e),
            })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.operator == OperatorKind::Aggregate {
            self.to_assigner()?;
            self.aggregate_function()?;
        }
        self.validate_runtime()
    }

    /// Validate everything except the window and aggregate selection
    pub fn validate_runtime(&self) -> Result<()> {
        if self.allowed_lateness_ms < 0 {
            return Err(EngineError::config("allowed_lateness_ms must not be negative"));
        }

        if self.operator == OperatorKind::Join && self.join_skew_ms < 0 {
            return Err(EngineError::config("join_skew_ms must not be negative"));
        }

        if self.checkpoint_interval_ms == 0 {
            return Err(EngineError::config("checkpoint_interval_ms must be greater than 0"));
        }

        if self.partition_count == 0 {
            return Err(EngineError::config("partition_count must be greater than 0"));
        }

        if self.queue_capacity == 0 {
            return Err(EngineError::config("queue_capacity must be greater than 0"));
        }

        if self.sink_batch_size == 0 {
            return Err(EngineError::config("sink_batch_size must be greater than 0"));
        }

        if self.max_record_attempts == 0 {
            return Err(EngineError::config("max_record_attempts must be greater than 0"));
        }

        if self.checkpoint_retention == 0 {
            return Err(EngineError::config("checkpoint_retention must be greater than 0"));
        }

        Ok(())
    }

    /// Window assigner described by the window fields
    pub fn to_assigner(&self) -> Result<WindowAssigner> {
        let assigner = match self.window_type {
            WindowType::Tumbling => WindowAssigner::tumbling(self.window_size_ms)?,
            WindowType::Sliding => {
                let slide = self.window_slide_ms.ok_or_else(|| {
                    EngineError::config("window_slide_ms is required for sliding windows")
                })?;
                WindowAssigner::sliding(self.window_size_ms, slide)?
            }
            WindowType::Session => {
                let gap = self.session_gap_ms.ok_or_else(|| {
                    EngineError::config("session_gap_ms is required for session windows")
                })?;
                WindowAssigner::session(gap)?
            }
        };
        Ok(assigner)
    }

    pub fn aggregate_function(&self) -> Result<AggregateFunction> {
        Ok(AggregateFunction::from_name(&self.aggregate)?)
    }

    /// Operator stage described by this configuration
    pub fn operator_spec(&self) -> Result<OperatorSpec> {
        match self.operator {
            OperatorKind::Aggregate => Ok(OperatorSpec::Aggregate {
                assigner: self.to_assigner()?,
                function: self.aggregate_function()?,
                allowed_lateness_ms: self.allowed_lateness_ms,
                late_policy: self.late_record_policy,
            }),
            OperatorKind::Join => Ok(OperatorSpec::Join {
                join_type: self.join_type,
                skew_ms: self.join_skew_ms,
            }),
        }
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn watermark_delay(&self) -> Duration {
        Duration::from_millis(self.watermark_delay_ms)
    }

    /// Retry policy for sink writes
    pub fn sink_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.sink_max_retries, Duration::from_millis(self.retry_backoff_ms))
    }
}

fn default_window_size() -> i64 {
    60_000 // 1 minute
}

fn default_aggregate() -> String {
    "count".to_string()
}

fn default_join_skew() -> i64 {
    5_000
}

fn default_checkpoint_interval() -> u64 {
    10_000
}

fn default_partition_count() -> u32 {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_sink_batch_size() -> usize {
    256
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    100
}

fn default_max_record_attempts() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    3
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_checkpoint_retention() -> usize {
    3
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}
