//! Stream processor assembly and execution
//!
//! [`StreamProcessorBuilder`] wires sources, one operator stage and the sinks
//! into a [`StreamProcessor`]. Running it spawns one worker per partition and
//! a sink stage, connected by bounded credit queues.
//!
//! # Example
//!
//! ```rust,no_run
//! use stream_processor::pipeline::StreamProcessorBuilder;
//! use stream_processor::sink::MemorySink;
//! use stream_processor::source::MemorySource;
//! use stream_processor::Record;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let records = vec![
//!     Record::new("a", 1.0, 1),
//!     Record::new("a", 1.0, 5),
//!     Record::new("a", 1.0, 12),
//! ];
//! let sink = MemorySink::new("counts");
//! let mut processor = StreamProcessorBuilder::<f64>::new()
//!     .with_source(MemorySource::new("events", records))
//!     .with_tumbling_window(10)
//!     .with_sink(sink.clone())
//!     .build()?;
//!
//! processor.run().await?;
//! for (window, values) in sink.results_by_window() {
//!     println!("{:?}: {:?}", window, values);
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod executor;
mod worker;

pub use builder::StreamProcessorBuilder;
pub use executor::{
    ExecutorStats, RunOutcome, RunSummary, ShutdownHandle, StatsCollector, StreamProcessor,
};
