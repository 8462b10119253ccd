//! Event-time windowing
//!
//! Three window kinds are supported:
//!
//! ## Tumbling Windows
//! Fixed-size, non-overlapping windows. Each record belongs to exactly one window.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! ## Sliding Windows
//! Fixed-size, overlapping windows. A record belongs to `ceil(size / slide)`
//! windows when the slide divides the size.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----------]
//!                [----------]
//!                     [----------]
//! ```
//!
//! ## Session Windows
//! Variable-size windows per key separated by gaps of inactivity. A session
//! ends `gap` after its last record; sessions that touch are merged.
//!
//! ```text
//! Time:     0-2--5----------12-14----20
//! Sessions: [----]           [---]   [-]
//! ```
//!
//! A window fires when the watermark reaches its end. Records behind
//! `watermark - allowed_lateness` are late and handled by the configured
//! [`LateRecordPolicy`].

pub mod assigner;
pub mod late;
pub mod types;

pub use assigner::{merge_sessions, WindowAssigner};
pub use late::{is_late, LateRecordPolicy, LateRecordStats, LateRecordTracker};
pub use types::{Window, WindowId, WindowKind};
