//! State backend trait definition
//!
//! This module defines the `StateBackend` trait that all state storage
//! implementations must implement. The trait provides a simple key-value
//! interface with support for ordered prefix scans.

use async_trait::async_trait;

use crate::error::StateResult;

/// Core trait for state backend implementations
///
/// ## Key Design Principles
///
/// - **Byte-oriented**: Keys and values are byte slices; typing happens in
///   [`StateStore`](super::StateStore)
/// - **Ordered scans**: `list_keys` and `entries` return keys in ascending
///   byte order, so a prefix scan over an encoded key visits windows by time
/// - **Async-first**: All operations return futures for non-blocking I/O
///
/// ## Example Implementation
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use stream_processor::error::StateResult;
/// use stream_processor::state::StateBackend;
/// use std::collections::BTreeMap;
/// use tokio::sync::RwLock;
///
/// struct SimpleBackend {
///     data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
/// }
///
/// #[async_trait]
/// impl StateBackend for SimpleBackend {
///     async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
///         Ok(self.data.read().await.get(key).cloned())
///     }
///
///     async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
///         self.data.write().await.insert(key.to_vec(), value.to_vec());
///         Ok(())
///     }
///
///     async fn delete(&self, key: &[u8]) -> StateResult<()> {
///         self.data.write().await.remove(key);
///         Ok(())
///     }
///
///     async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>> {
///         Ok(self.data.read().await
///             .keys()
///             .filter(|k| k.starts_with(prefix))
///             .cloned()
///             .collect())
///     }
///
///     fn backend_type(&self) -> &'static str {
///         "simple"
///     }
/// }
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Retrieve a value for the given key
    ///
    /// Returns `Ok(None)` if the key does not exist.
    async fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Store a value for the given key, overwriting any previous value
    async fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &[u8]) -> StateResult<()>;

    /// List all keys with the given prefix, in ascending order
    ///
    /// An empty prefix matches all keys.
    async fn list_keys(&self, prefix: &[u8]) -> StateResult<Vec<Vec<u8>>>;

    /// All key/value pairs under a prefix, in ascending key order
    async fn entries(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let keys = self.list_keys(prefix).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    /// Clear all state from the backend
    async fn clear(&self) -> StateResult<()> {
        let keys = self.list_keys(b"").await?;
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Get the number of keys in the backend
    async fn count(&self) -> StateResult<usize> {
        Ok(self.list_keys(b"").await?.len())
    }

    /// Check if a key exists
    async fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Make buffered writes durable. In-memory backends have nothing to do.
    async fn flush(&self) -> StateResult<()> {
        Ok(())
    }

    /// Short backend name for logs
    fn backend_type(&self) -> &'static str;
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn test_key(id: u32) -> Vec<u8> {
        format!("test:{}", id).into_bytes()
    }

    // Generic tests that any StateBackend implementation should pass
    pub async fn test_backend_basic_ops<B: StateBackend>(backend: B) {
        backend.put(&test_key(1), b"value1").await.unwrap();
        let value = backend.get(&test_key(1)).await.unwrap();
        assert_eq!(value, Some(b"value1".to_vec()));

        let value = backend.get(&test_key(999)).await.unwrap();
        assert_eq!(value, None);

        backend.put(&test_key(1), b"new_value").await.unwrap();
        let value = backend.get(&test_key(1)).await.unwrap();
        assert_eq!(value, Some(b"new_value".to_vec()));

        backend.delete(&test_key(1)).await.unwrap();
        let value = backend.get(&test_key(1)).await.unwrap();
        assert_eq!(value, None);

        // deleting a missing key is fine
        backend.delete(&test_key(999)).await.unwrap();
    }

    pub async fn test_backend_list_keys<B: StateBackend>(backend: B) {
        backend.clear().await.unwrap();

        backend.put(b"window:3", b"w3").await.unwrap();
        backend.put(b"window:1", b"w1").await.unwrap();
        backend.put(b"window:2", b"w2").await.unwrap();
        backend.put(b"meta:1", b"m1").await.unwrap();
        backend.put(b"meta:2", b"m2").await.unwrap();

        let window_keys = backend.list_keys(b"window:").await.unwrap();
        assert_eq!(
            window_keys,
            vec![b"window:1".to_vec(), b"window:2".to_vec(), b"window:3".to_vec()]
        );

        let meta_keys = backend.list_keys(b"meta:").await.unwrap();
        assert_eq!(meta_keys.len(), 2);

        let all_keys = backend.list_keys(b"").await.unwrap();
        assert_eq!(all_keys.len(), 5);

        let entries = backend.entries(b"meta:").await.unwrap();
        assert_eq!(
            entries,
            vec![
                (b"meta:1".to_vec(), b"m1".to_vec()),
                (b"meta:2".to_vec(), b"m2".to_vec())
            ]
        );
    }

    pub async fn test_backend_clear<B: StateBackend>(backend: B) {
        backend.put(b"key1", b"val1").await.unwrap();
        backend.put(b"key2", b"val2").await.unwrap();
        backend.put(b"key3", b"val3").await.unwrap();

        assert_eq!(backend.count().await.unwrap(), 3);

        backend.clear().await.unwrap();

        assert_eq!(backend.count().await.unwrap(), 0);
    }

    pub async fn test_backend_contains<B: StateBackend>(backend: B) {
        backend.clear().await.unwrap();

        assert!(!backend.contains(b"test").await.unwrap());
        backend.put(b"test", b"value").await.unwrap();
        assert!(backend.contains(b"test").await.unwrap());
        backend.delete(b"test").await.unwrap();
        assert!(!backend.contains(b"test").await.unwrap());
    }
}
