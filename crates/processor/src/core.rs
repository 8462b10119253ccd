//! Core record structures and traits
//!
//! This module provides the fundamental types that flow through the engine:
//! - [`Record`]: a keyed payload with event-time and ingestion-time metadata
//! - [`ToF64`]: numeric view of a payload used by the aggregate functions
//! - [`Payload`]: the bound every record value must satisfy
//! - [`partition_for`]: the key-to-partition routing function

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A keyed record with event-time semantics
///
/// Records are immutable once created. Timestamps are milliseconds since the
/// Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<V> {
    /// Grouping and join key
    pub key: String,
    /// The record payload
    pub value: V,
    /// Timestamp at which the record occurred
    pub event_time: i64,
    /// Timestamp at which the engine first saw the record
    #[serde(default = "now_millis")]
    pub ingestion_time: i64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl<V> Record<V> {
    /// Create a new record, stamping the ingestion time with the wall clock
    pub fn new(key: impl Into<String>, value: V, event_time: i64) -> Self {
        Self {
            key: key.into(),
            value,
            event_time,
            ingestion_time: now_millis(),
        }
    }

    /// Create a record with an explicit ingestion time
    pub fn with_ingestion_time(
        key: impl Into<String>,
        value: V,
        event_time: i64,
        ingestion_time: i64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            event_time,
            ingestion_time,
        }
    }

    /// Create a record from a chrono event time
    pub fn at(key: impl Into<String>, value: V, event_time: DateTime<Utc>) -> Self {
        Self::new(key, value, event_time.timestamp_millis())
    }

    /// Event time as a chrono timestamp
    pub fn event_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.event_time)
    }

    /// Ingestion delay (ingestion_time - event_time) in milliseconds
    pub fn ingestion_delay_ms(&self) -> i64 {
        self.ingestion_time.saturating_sub(self.event_time)
    }
}

impl<V: fmt::Debug> fmt::Display for Record<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record {{ key: {}, event_time: {}, value: {:?} }}",
            self.key, self.event_time, self.value
        )
    }
}

/// Trait for converting payloads to f64 for numeric aggregations
///
/// Returns `None` when the value has no numeric interpretation.
pub trait ToF64 {
    fn to_f64(&self) -> Option<f64>;
}

macro_rules! impl_to_f64 {
    ($($t:ty),*) => {
        $(
            impl ToF64 for $t {
                fn to_f64(&self) -> Option<f64> {
                    Some(*self as f64)
                }
            }
        )*
    };
}

impl_to_f64!(f64, f32, i64, i32, i16, i8, u64, u32, u16, u8, usize, isize);

impl ToF64 for serde_json::Value {
    fn to_f64(&self) -> Option<f64> {
        match self {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl ToF64 for String {
    fn to_f64(&self) -> Option<f64> {
        self.trim().parse().ok()
    }
}

/// Bound satisfied by every record value the engine can carry
pub trait Payload:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + ToF64 + 'static
{
}

impl<T> Payload for T where
    T: Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + ToF64 + 'static
{
}

/// Side of a two-input join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSide {
    Left,
    Right,
}

impl JoinSide {
    pub fn opposite(self) -> Self {
        match self {
            JoinSide::Left => JoinSide::Right,
            JoinSide::Right => JoinSide::Left,
        }
    }

    pub(crate) fn as_byte(self) -> u8 {
        match self {
            JoinSide::Left => b'L',
            JoinSide::Right => b'R',
        }
    }
}

impl fmt::Display for JoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinSide::Left => write!(f, "left"),
            JoinSide::Right => write!(f, "right"),
        }
    }
}

/// Partition owning `key` among `partitions` workers
///
/// The mapping is stable for a given build, which keeps restored state on the
/// worker that will receive the replayed records.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_creation() {
        let record = Record::with_ingestion_time("k1", 42i64, 1_000, 1_500);
        assert_eq!(record.key, "k1");
        assert_eq!(record.value, 42);
        assert_eq!(record.ingestion_delay_ms(), 500);
    }

    #[test]
    fn test_record_chrono_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let record = Record::at("k", 1.0f64, ts);
        assert_eq!(record.event_datetime(), Some(ts));
    }

    #[test]
    fn test_record_deserialize_without_ingestion_time() {
        let record: Record<serde_json::Value> =
            serde_json::from_str(r#"{"key":"k1","value":3,"event_time":9}"#).unwrap();
        assert_eq!(record.event_time, 9);
        assert!(record.ingestion_time > 0);
    }

    #[test]
    fn test_json_to_f64() {
        assert_eq!(serde_json::json!(2.5).to_f64(), Some(2.5));
        assert_eq!(serde_json::json!("7").to_f64(), Some(7.0));
        assert_eq!(serde_json::json!(true).to_f64(), Some(1.0));
        assert_eq!(serde_json::json!({"a": 1}).to_f64(), None);
        assert_eq!(serde_json::Value::Null.to_f64(), None);
    }

    #[test]
    fn test_partition_for_is_stable_and_in_range() {
        for key in ["a", "b", "user-17", ""] {
            let p = partition_for(key, 4);
            assert!(p < 4);
            assert_eq!(p, partition_for(key, 4));
        }
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }
}
