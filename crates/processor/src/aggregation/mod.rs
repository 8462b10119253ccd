//! Incremental aggregation over windows
//!
//! Every aggregate function supports three operations:
//!
//! - **fold**: add one record to an accumulator (created on the first record)
//! - **merge**: combine two accumulators, used when session windows merge
//! - **finalize**: turn the accumulator into the emitted [`AggregateValue`]
//!
//! Accumulators are plain serde types so that the state store can persist
//! them with bincode.
//!
//! # Available Functions
//!
//! - `Count`: number of records
//! - `Sum`, `Min`, `Max`, `Average`: numeric functions over [`ToF64`](crate::core::ToF64)
//! - `Collect`: every value, in arrival order
//! - `Reduce`: a named user function `Fn(f64, f64) -> f64`
//!
//! # Example
//!
//! ```rust
//! use stream_processor::aggregation::{AggregateFunction, AggregateValue};
//! use stream_processor::core::Record;
//!
//! let avg = AggregateFunction::Average;
//! let mut acc = None;
//! for (t, v) in [(1, 10.0), (2, 20.0), (3, 30.0)] {
//!     acc = Some(avg.fold(acc, &Record::new("k", v, t)).unwrap());
//! }
//! assert_eq!(avg.finalize(&acc.unwrap()).unwrap(), AggregateValue::Number(20.0));
//! ```

pub mod avg;
pub mod collect;
pub mod count;
pub mod function;
pub mod minmax;
pub mod reduce;
pub mod sum;

pub use avg::AverageAccumulator;
pub use collect::CollectAccumulator;
pub use count::CountAccumulator;
pub use function::{Accumulator, AggregateFunction, AggregateValue};
pub use minmax::MinMaxAccumulator;
pub use reduce::{ReduceAccumulator, Reducer};
pub use sum::SumAccumulator;
