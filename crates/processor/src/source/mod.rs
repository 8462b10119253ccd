//! Record sources
//!
//! A [`Source`] is pulled by the processor. Each [`poll`](Source::poll)
//! returns a [`SourceBatch`] of records together with the source's current
//! watermark. Sources expose an opaque [`PositionToken`] so checkpoints can
//! reseek them after a restart.

pub mod json_lines;
pub mod memory;
pub mod retrying;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::Record;
use crate::error::Result;
use crate::watermark::Watermark;

pub use json_lines::JsonLinesSource;
pub use memory::{MemorySource, SourceItem};
pub use retrying::RetryingSource;

/// Opaque source position
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionToken(pub Vec<u8>);

impl PositionToken {
    /// Token for a numeric offset
    pub fn from_u64(offset: u64) -> Self {
        Self(offset.to_be_bytes().to_vec())
    }

    /// Numeric offset held by this token, if it was built with [`from_u64`](Self::from_u64)
    pub fn as_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u64() {
            Some(offset) => write!(f, "{}", offset),
            None => write!(f, "0x{}", self.0.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone)]
pub struct SourceBatch<V> {
    pub records: Vec<Record<V>>,
    /// Watermark after these records, if the source advanced it
    pub watermark: Option<Watermark>,
    /// No further records will ever be produced
    pub end_of_stream: bool,
}

impl<V> SourceBatch<V> {
    pub fn new(records: Vec<Record<V>>) -> Self {
        Self {
            records,
            watermark: None,
            end_of_stream: false,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            records: Vec::new(),
            watermark: None,
            end_of_stream: true,
        }
    }

    pub fn with_watermark(mut self, watermark: Option<Watermark>) -> Self {
        self.watermark = watermark;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.watermark.is_none()
    }
}

/// A pull-based record source
///
/// `position()` is the position after the last record returned by `poll()`.
/// After `seek(p)`, the next poll resumes from `p`.
#[async_trait]
pub trait Source<V>: Send {
    /// Identifier used in checkpoints and logs
    fn id(&self) -> &str;

    /// Fetch the next batch; an empty batch means nothing is available yet
    async fn poll(&mut self) -> Result<SourceBatch<V>>;

    /// Current read position
    fn position(&self) -> PositionToken;

    /// Called once a checkpoint containing `token` is durable
    async fn commit_position(&mut self, token: &PositionToken) -> Result<()>;

    /// Resume reading from `token`
    async fn seek(&mut self, token: &PositionToken) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
impl<V: Send + 'static> Source<V> for Box<dyn Source<V>> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn poll(&mut self) -> Result<SourceBatch<V>> {
        (**self).poll().await
    }

    fn position(&self) -> PositionToken {
        (**self).position()
    }

    async fn commit_position(&mut self, token: &PositionToken) -> Result<()> {
        (**self).commit_position(token).await
    }

    async fn seek(&mut self, token: &PositionToken) -> Result<()> {
        (**self).seek(token).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_token_offset() {
        let token = PositionToken::from_u64(42);
        assert_eq!(token.as_u64(), Some(42));
        assert_eq!(token.to_string(), "42");

        let opaque = PositionToken(vec![0xab, 0x01]);
        assert_eq!(opaque.as_u64(), None);
        assert_eq!(opaque.to_string(), "0xab01");
    }

    #[test]
    fn test_empty_batch() {
        let batch: SourceBatch<i64> = SourceBatch::new(Vec::new());
        assert!(batch.is_empty());
        assert!(!batch.with_watermark(Some(Watermark::new(5))).is_empty());
        assert!(SourceBatch::<i64>::end_of_stream().end_of_stream);
    }
}
