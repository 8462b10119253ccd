//! Sled-based durable state backend
//!
//! Keeps partition state in an embedded log-structured store so that large
//! state does not have to fit in memory. Recovery still goes through
//! checkpoints; the backend is cleared and refilled on restore.

use async_trait::async_trait;
use sled::Db;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use super::backend::StateBackend;
use crate::error::{StateError, StateResult};

/// Statistics for the Sled backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SledBackendStats {
    pub get_count: u64,
    pub put_count: u64,
    pub delete_count: u64,
    pub flush_count: u64,
    /// Total bytes written (keys plus values)
    pub bytes_written: u64,
}

/// Configuration for the Sled backend
#[derive(Debug, Clone)]
pub struct SledConfig {
    /// Path to the database directory
    pub path: PathBuf,
    /// Cache size in bytes (default: 64MB)
    pub cache_capacity: u64,
    /// Flush every N mutations, 0 disables (default: 1000)
    pub flush_every: u64,
}

impl SledConfig {
    /// Create a new configuration with the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache_capacity: 64 * 1024 * 1024,
            flush_every: 1000,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_flush_every(mut self, count: u64) -> Self {
        self.flush_every = count;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    bytes_written: AtomicU64,
    mutations: AtomicU64,
}

fn storage_error(operation: &str, err: sled::Error) -> StateError {
    StateError::StorageError {
        backend_type: "sled".to_string(),
        details: format!("{} failed: {}", operation, err),
    }
}

/// Sled-based durable state backend
///
/// ## Example
///
/// ```rust,no_run
/// use stream_processor::state::{SledConfig, SledStateBackend, StateBackend};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = SledConfig::new("/var/lib/streamctl/state/partition-0")
///         .with_cache_capacity(256 * 1024 * 1024);
///     let backend = SledStateBackend::open(config).await?;
///
///     backend.put(b"window:123", b"accumulator").await?;
///     backend.flush().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct SledStateBackend {
    db: Arc<Db>,
    config: SledConfig,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SledStateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStateBackend")
            .field("path", &self.config.path)
            .finish()
    }
}

impl SledStateBackend {
    /// Open a Sled database with the given configuration
    pub async fn open(config: SledConfig) -> StateResult<Self> {
        info!(path = ?config.path, "Opening sled state backend");

        tokio::fs::create_dir_all(&config.path)
            .await
            .map_err(|e| StateError::StorageError {
                backend_type: "sled".to_string(),
                details: format!("failed to create directory: {}", e),
            })?;

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_capacity)
            .open()
            .map_err(|e| storage_error("open", e))?;

        debug!(keys = db.len(), "Sled database opened");

        Ok(Self {
            db: Arc::new(db),
            config,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Backend in a fresh directory under the system temp dir
    pub async fn temporary() -> StateResult<Self> {
        let temp_dir = std::env::temp_dir().join(format!("sled_state_{}", uuid::Uuid::new_v4()));
        Self::open(SledConfig::new(temp_dir)).await
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn stats(&self) -> SledBackendStats {
        SledBackendStats {
            get_count: self.counters.gets.load(Ordering::Relaxed),
            put_count: self.counters.puts.load(Ordering::Relaxed),
            delete_count: self.counters.deletes.load(Ordering::Relaxed),
            flush_count: self.counters.flushes.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Size of the database files on disk
    pub fn size_on_disk(&self) -> StateResult<u64> {
        self.db.size_on_disk().map_err(|e| storage_error("size_on_disk", e))
    }

    async fn maybe_flush(&self) -> StateResult<()> {
        if self.config.flush_every == 0 {
            return Ok(());
        }
        let count = self.counters.mutations.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.config.flush_every == 0 {
            self.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateBackend for SledStateBackend {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let value = self.db.get(key).map_err(|e| storage_error("get", e))?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!(key_len = key.len(), value_len = value.len(), "sled put");
        self.db
            .insert(key, value)
            .map_err(|e| storage_error("put", e))?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        self.maybe_flush().await
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        self.db.remove(key).map_err(|e| storage_error("delete", e))?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.maybe_flush().await
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        self.db
            .scan_prefix(prefix)
            .keys()
            .map(|result| {
                result
                    .map(|k| k.to_vec())
                    .map_err(|e| storage_error("prefix scan", e))
            })
            .collect()
    }

    async fn entries(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.db
            .scan_prefix(prefix)
            .map(|result| {
                result
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| storage_error("prefix scan", e))
            })
            .collect()
    }

    async fn clear(&self) -> StateResult<()> {
        debug!(path = ?self.config.path, "Clearing sled state");
        self.db.clear().map_err(|e| storage_error("clear", e))?;
        self.flush().await
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.db.len())
    }

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        self.db
            .contains_key(key)
            .map_err(|e| storage_error("contains", e))
    }

    async fn flush(&self) -> StateResult<()> {
        let flushed = self
            .db
            .flush_async()
            .await
            .map_err(|e| storage_error("flush", e))?;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        trace!(bytes = flushed, "Flushed sled database");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "sled"
    }
}

impl Drop for SledStateBackend {
    fn drop(&mut self) {
        // last handle flushes
        if Arc::strong_count(&self.db) == 1 {
            if let Err(e) = self.db.flush() {
                error!(error = %e, "Failed to flush sled database on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::backend::tests::*;

    async fn create_test_backend() -> SledStateBackend {
        SledStateBackend::temporary().await.unwrap()
    }

    #[tokio::test]
    async fn test_sled_backend_basic() {
        test_backend_basic_ops(create_test_backend().await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_list_keys() {
        test_backend_list_keys(create_test_backend().await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_clear() {
        test_backend_clear(create_test_backend().await).await;
    }

    #[tokio::test]
    async fn test_sled_backend_contains() {
        test_backend_contains(create_test_backend().await).await;
    }

    #[tokio::test]
    async fn test_sled_persistence() {
        let temp_dir =
            std::env::temp_dir().join(format!("sled_persist_test_{}", uuid::Uuid::new_v4()));
        let config = SledConfig::new(&temp_dir);

        {
            let backend = SledStateBackend::open(config.clone()).await.unwrap();
            backend.put(b"key1", b"value1").await.unwrap();
            backend.put(b"key2", b"value2").await.unwrap();
            backend.flush().await.unwrap();
        }

        {
            let backend = SledStateBackend::open(config).await.unwrap();
            assert_eq!(backend.count().await.unwrap(), 2);
            assert_eq!(backend.get(b"key1").await.unwrap(), Some(b"value1".to_vec()));
        }

        tokio::fs::remove_dir_all(&temp_dir).await.ok();
    }

    #[tokio::test]
    async fn test_sled_stats() {
        let backend = create_test_backend().await;
        backend.put(b"a", b"12").await.unwrap();
        backend.get(b"a").await.unwrap();
        backend.delete(b"a").await.unwrap();
        backend.flush().await.unwrap();

        let stats = backend.stats();
        assert_eq!(stats.put_count, 1);
        assert_eq!(stats.get_count, 1);
        assert_eq!(stats.delete_count, 1);
        assert!(stats.flush_count >= 1);
        assert_eq!(stats.bytes_written, 3);
    }
}
