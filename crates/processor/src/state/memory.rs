//! In-memory state backend implementation
//!
//! The default backend. State lives in a concurrent map and is lost on process
//! exit, so durability comes from checkpoints alone.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::backend::StateBackend;
use crate::error::StateResult;

/// Statistics about the memory state backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBackendStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Total bytes stored (keys plus values)
    pub total_bytes: usize,
    pub get_count: u64,
    pub put_count: u64,
    pub delete_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// In-memory state backend using DashMap
///
/// ## Example
///
/// ```rust,no_run
/// use stream_processor::state::{MemoryStateBackend, StateBackend};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let backend = MemoryStateBackend::new();
///     backend.put(b"window:123", b"accumulator").await?;
///
///     if let Some(data) = backend.get(b"window:123").await? {
///         println!("state: {:?}", data);
///     }
///
///     let stats = backend.stats();
///     println!("hits: {}, misses: {}", stats.hit_count, stats.miss_count);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStateBackend {
    data: Arc<DashMap<Vec<u8>, Vec<u8>>>,
    counters: Arc<Counters>,
}

impl MemoryStateBackend {
    /// Create a new, empty in-memory state backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current statistics
    pub fn stats(&self) -> MemoryBackendStats {
        MemoryBackendStats {
            total_entries: self.data.len(),
            total_bytes: self.memory_usage(),
            get_count: self.counters.gets.load(Ordering::Relaxed),
            put_count: self.counters.puts.load(Ordering::Relaxed),
            delete_count: self.counters.deletes.load(Ordering::Relaxed),
            hit_count: self.counters.hits.load(Ordering::Relaxed),
            miss_count: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Approximate memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.data
            .iter()
            .map(|entry| entry.key().len() + entry.value().len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let value = self.data.get(key).map(|entry| entry.value().clone());
        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        trace!(key_len = key.len(), value_len = value.len(), "memory put");
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StateResult<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
        let mut keys: Vec<Vec<u8>> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn entries(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn clear(&self) -> StateResult<()> {
        self.data.clear();
        Ok(())
    }

    async fn count(&self) -> StateResult<usize> {
        Ok(self.data.len())
    }

    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.data.contains_key(key))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
