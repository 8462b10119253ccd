//! Checkpoint layout and persistence
//!
//! A checkpoint is complete once every partition has snapshotted its state at
//! the same barrier and the sink has flushed everything produced before it.
//! It records the source positions to resume from and one state snapshot per
//! partition.
//!
//! Source positions are stored once per checkpoint, not inside each
//! partition entry. Every source feeds every partition through the router, so
//! all partitions share the same resume position; a per-partition copy would
//! only repeat it.
//!
//! [`FileCheckpointStorage`] writes each checkpoint atomically (temp file,
//! fsync, rename); a checkpoint is durable only after the rename.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::store::StateSnapshot;
use crate::error::{EngineError, Result};
use crate::source::PositionToken;
use crate::watermark::Watermark;

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Position of one source at the checkpoint barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub source_id: String,
    pub position: PositionToken,
    pub watermark: Watermark,
}

/// State of one partition at the checkpoint barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition_id: u32,
    pub state_snapshot: StateSnapshot,
}

/// A complete, self-verifying checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: u64,
    pub created_at: DateTime<Utc>,
    pub source_positions: Vec<SourcePosition>,
    pub per_partition: Vec<PartitionSnapshot>,
    /// Hex SHA-256 over the fields above
    pub checksum: String,
}

impl Checkpoint {
    pub fn new(
        checkpoint_id: u64,
        source_positions: Vec<SourcePosition>,
        mut per_partition: Vec<PartitionSnapshot>,
    ) -> Result<Self> {
        per_partition.sort_by_key(|p| p.partition_id);
        let mut checkpoint = Self {
            checkpoint_id,
            created_at: Utc::now(),
            source_positions,
            per_partition,
            checksum: String::new(),
        };
        checkpoint.checksum = checkpoint.calculate_checksum()?;
        Ok(checkpoint)
    }

    fn calculate_checksum(&self) -> Result<String> {
        let payload = bincode::serialize(&(
            self.checkpoint_id,
            self.created_at.timestamp_millis(),
            &self.source_positions,
            &self.per_partition,
        ))?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verify the checkpoint and every partition snapshot in it
    pub fn validate(&self) -> Result<()> {
        let calculated = self.calculate_checksum()?;
        if calculated != self.checksum {
            return Err(EngineError::StateCorruption {
                checkpoint_id: self.checkpoint_id,
                reason: format!(
                    "checksum mismatch: expected {}, got {}",
                    self.checksum, calculated
                ),
            });
        }
        for partition in &self.per_partition {
            partition
                .state_snapshot
                .verify()
                .map_err(|e| EngineError::StateCorruption {
                    checkpoint_id: self.checkpoint_id,
                    reason: format!("partition {}: {}", partition.partition_id, e),
                })?;
        }
        Ok(())
    }

    /// Snapshot of one partition, if present
    pub fn partition(&self, partition_id: u32) -> Option<&StateSnapshot> {
        self.per_partition
            .iter()
            .find(|p| p.partition_id == partition_id)
            .map(|p| &p.state_snapshot)
    }

    pub fn source_position(&self, source_id: &str) -> Option<&SourcePosition> {
        self.source_positions
            .iter()
            .find(|p| p.source_id == source_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and validate. Any failure is reported as corruption.
    pub fn from_bytes(checkpoint_id: u64, bytes: &[u8]) -> Result<Self> {
        let checkpoint: Checkpoint =
            bincode::deserialize(bytes).map_err(|e| EngineError::StateCorruption {
                checkpoint_id,
                reason: format!("undecodable checkpoint: {}", e),
            })?;
        if checkpoint.checkpoint_id != checkpoint_id {
            return Err(EngineError::StateCorruption {
                checkpoint_id,
                reason: format!("file holds checkpoint {}", checkpoint.checkpoint_id),
            });
        }
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// Total number of state entries across partitions
    pub fn entry_count(&self) -> usize {
        self.per_partition
            .iter()
            .map(|p| p.state_snapshot.len())
            .sum()
    }
}

/// Storage for completed checkpoints
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Durably store a checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load and validate one checkpoint
    async fn load(&self, checkpoint_id: u64) -> Result<Checkpoint>;

    /// Ids of stored checkpoints, ascending
    async fn list(&self) -> Result<Vec<u64>>;

    /// Delete all but the newest `keep_last_n` checkpoints
    async fn purge(&self, keep_last_n: usize) -> Result<()>;

    /// Latest checkpoint, if any
    async fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match self.list().await?.last() {
            Some(id) => Ok(Some(self.load(*id).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<T: CheckpointStorage + ?Sized> CheckpointStorage for Arc<T> {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        (**self).save(checkpoint).await
    }

    async fn load(&self, checkpoint_id: u64) -> Result<Checkpoint> {
        (**self).load(checkpoint_id).await
    }

    async fn list(&self) -> Result<Vec<u64>> {
        (**self).list().await
    }

    async fn purge(&self, keep_last_n: usize) -> Result<()> {
        (**self).purge(keep_last_n).await
    }
}

/// Directory of `checkpoint-<id>.ckpt` files
#[derive(Debug, Clone)]
pub struct FileCheckpointStorage {
    dir: PathBuf,
    retention: usize,
}

impl FileCheckpointStorage {
    /// Storage in `dir`, keeping the newest `retention` checkpoints
    pub async fn new(dir: impl AsRef<Path>, retention: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            retention: retention.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding a checkpoint
    pub fn checkpoint_path(&self, checkpoint_id: u64) -> PathBuf {
        self.dir
            .join(format!("checkpoint-{:020}.{}", checkpoint_id, CHECKPOINT_EXTENSION))
    }

    fn parse_id(path: &Path) -> Option<u64> {
        if path.extension().and_then(|s| s.to_str()) != Some(CHECKPOINT_EXTENSION) {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("checkpoint-"))
            .and_then(|s| s.parse().ok())
    }
}

#[async_trait]
impl CheckpointStorage for FileCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = checkpoint.to_bytes()?;
        let final_path = self.checkpoint_path(checkpoint.checkpoint_id);
        let tmp_path = final_path.with_extension(format!("{}.tmp", CHECKPOINT_EXTENSION));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        // persist the rename itself
        if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
            if let Err(e) = dir.sync_all().await {
                debug!(error = %e, "Directory fsync not supported");
            }
        }

        info!(
            checkpoint_id = checkpoint.checkpoint_id,
            bytes = bytes.len(),
            entries = checkpoint.entry_count(),
            path = ?final_path,
            "Checkpoint persisted"
        );

        self.purge(self.retention).await
    }

    async fn load(&self, checkpoint_id: u64) -> Result<Checkpoint> {
        let path = self.checkpoint_path(checkpoint_id);
        let bytes = tokio::fs::read(&path).await?;
        let checkpoint = Checkpoint::from_bytes(checkpoint_id, &bytes)?;
        info!(
            checkpoint_id,
            entries = checkpoint.entry_count(),
            "Checkpoint loaded"
        );
        Ok(checkpoint)
    }

    async fn list(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = Self::parse_id(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn purge(&self, keep_last_n: usize) -> Result<()> {
        let ids = self.list().await?;
        let excess = ids.len().saturating_sub(keep_last_n);
        for id in ids.into_iter().take(excess) {
            let path = self.checkpoint_path(id);
            debug!(checkpoint_id = id, "Deleting old checkpoint");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(checkpoint_id = id, error = %e, "Failed to delete checkpoint");
            }
        }
        Ok(())
    }
}

/// In-memory checkpoint storage for tests and single-run pipelines
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStorage {
    checkpoints: Mutex<BTreeMap<u64, Vec<u8>>>,
    retention: Option<usize>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            checkpoints: Mutex::new(BTreeMap::new()),
            retention: Some(retention.max(1)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<u64, Vec<u8>>>> {
        self.checkpoints
            .lock()
            .map_err(|_| EngineError::Unexpected("checkpoint storage lock poisoned".to_string()))
    }

    /// Overwrite the stored bytes of a checkpoint
    pub fn put_raw(&self, checkpoint_id: u64, bytes: Vec<u8>) -> Result<()> {
        self.lock()?.insert(checkpoint_id, bytes);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = checkpoint.to_bytes()?;
        self.lock()?.insert(checkpoint.checkpoint_id, bytes);
        if let Some(retention) = self.retention {
            self.purge(retention).await?;
        }
        Ok(())
    }

    async fn load(&self, checkpoint_id: u64) -> Result<Checkpoint> {
        let bytes = self
            .lock()?
            .get(&checkpoint_id)
            .cloned()
            .ok_or_else(|| EngineError::StateCorruption {
                checkpoint_id,
                reason: "checkpoint not found".to_string(),
            })?;
        Checkpoint::from_bytes(checkpoint_id, &bytes)
    }

    async fn list(&self) -> Result<Vec<u64>> {
        Ok(self.lock()?.keys().copied().collect())
    }

    async fn purge(&self, keep_last_n: usize) -> Result<()> {
        let mut map = self.lock()?;
        while map.len() > keep_last_n {
            let oldest = match map.keys().next() {
                Some(id) => *id,
                None => break,
            };
            map.remove(&oldest);
        }
        Ok(())
    }
}
