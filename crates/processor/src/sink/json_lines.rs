//! JSON-lines file sink

use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::Sink;
use crate::error::{EngineError, Result};

/// Appends each output as one JSON line
pub struct JsonLinesSink<O> {
    name: String,
    path: PathBuf,
    file: Mutex<Option<File>>,
    _output: PhantomData<fn(O)>,
}

impl<O> JsonLinesSink<O> {
    /// Sink appending to `path`; the file is created on first write
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: format!("jsonl:{}", path.display()),
            path,
            file: Mutex::new(None),
            _output: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<O: Serialize + Sync + 'static> Sink<O> for JsonLinesSink<O> {
    async fn write(&self, batch: &[O]) -> Result<()> {
        let mut buf = Vec::new();
        for output in batch {
            serde_json::to_writer(&mut buf, output)?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            info!(path = %self.path.display(), "Opened JSON-lines sink");
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| EngineError::Unexpected("sink file not open".to_string()))?;
        file.write_all(&buf).await?;
        file.flush().await?;
        debug!(sink = %self.name, items = batch.len(), "Batch appended");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
