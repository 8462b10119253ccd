//! JSON-lines file source
//!
//! Each non-empty line is one serialized [`Record`]. The position is the
//! byte offset of the next unread line.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, trace, warn};

use super::{PositionToken, Source, SourceBatch};
use crate::core::Record;
use crate::error::{EngineError, Result};
use crate::watermark::{BoundedOutOfOrdernessWatermark, WatermarkGenerator};

const DEFAULT_BATCH_SIZE: usize = 256;

/// Source reading records from a JSON-lines file
pub struct JsonLinesSource<V> {
    id: String,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    offset: u64,
    batch_size: usize,
    generator: BoundedOutOfOrdernessWatermark,
    skipped_lines: u64,
    committed: Option<PositionToken>,
    _payload: PhantomData<fn() -> V>,
}

impl<V> JsonLinesSource<V> {
    /// Source over `path`; the file is opened on first poll
    pub fn new(id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            id: id.into(),
            path: path.as_ref().to_path_buf(),
            reader: None,
            offset: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            generator: BoundedOutOfOrdernessWatermark::new(Duration::ZERO),
            skipped_lines: 0,
            committed: None,
            _payload: PhantomData,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Watermark trails the largest event time by `delay`
    pub fn with_out_of_orderness(mut self, delay: Duration) -> Self {
        self.generator = BoundedOutOfOrdernessWatermark::new(delay);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines that could not be parsed as records
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    pub fn committed_position(&self) -> Option<&PositionToken> {
        self.committed.as_ref()
    }

    async fn reader(&mut self) -> Result<&mut BufReader<File>> {
        if self.reader.is_none() {
            let mut file = File::open(&self.path).await?;
            if self.offset > 0 {
                file.seek(SeekFrom::Start(self.offset)).await?;
            }
            info!(source = %self.id, path = %self.path.display(), offset = self.offset, "Opened JSON-lines source");
            self.reader = Some(BufReader::new(file));
        }
        self.reader
            .as_mut()
            .ok_or_else(|| EngineError::Unexpected("reader not initialized".to_string()))
    }
}

#[async_trait]
impl<V> Source<V> for JsonLinesSource<V>
where
    V: DeserializeOwned + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn poll(&mut self) -> Result<SourceBatch<V>> {
        let batch_size = self.batch_size;
        let mut lines = Vec::new();
        let mut end_of_stream = false;
        {
            let reader = self.reader().await?;
            let mut consumed = 0u64;
            while lines.len() < batch_size {
                let mut line = String::new();
                let read = reader.read_line(&mut line).await?;
                if read == 0 {
                    end_of_stream = true;
                    break;
                }
                consumed += read as u64;
                lines.push(line);
            }
            self.offset += consumed;
        }

        let mut records = Vec::with_capacity(lines.len());
        let mut watermark = None;
        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Record<V>>(trimmed) {
                Ok(record) => {
                    if let Some(wm) = self.generator.on_event(record.event_time) {
                        watermark = Some(wm);
                    }
                    records.push(record);
                }
                Err(e) => {
                    self.skipped_lines += 1;
                    warn!(source = %self.id, error = %e, "Skipping malformed line");
                }
            }
        }

        trace!(source = %self.id, records = records.len(), offset = self.offset, "Polled JSON-lines source");
        let mut batch = SourceBatch::new(records).with_watermark(watermark);
        batch.end_of_stream = end_of_stream;
        Ok(batch)
    }

    fn position(&self) -> PositionToken {
        PositionToken::from_u64(self.offset)
    }

    async fn commit_position(&mut self, token: &PositionToken) -> Result<()> {
        self.committed = Some(token.clone());
        Ok(())
    }

    async fn seek(&mut self, token: &PositionToken) -> Result<()> {
        let offset = token.as_u64().ok_or_else(|| {
            EngineError::Unexpected(format!("invalid JSON-lines source position {}", token))
        })?;
        self.offset = offset;
        // reopened lazily at the new offset
        self.reader = None;
        self.generator.reset();
        debug!(source = %self.id, offset, "JSON-lines source repositioned");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        debug!(source = %self.id, "JSON-lines source closed");
        Ok(())
    }
}
