//! Typed partition state over a byte-oriented backend
//!
//! Key layout (all integers big-endian):
//!
//! ```text
//! open window    W | len(key):u32 | key | start | end
//! fired window   F | len(key):u32 | key | start | end
//! join entry     J | side:u8 | len(key):u32 | key | event_time | seq:u64
//! ```
//!
//! Timestamps are stored with the sign bit flipped, so byte order equals
//! numeric order and a prefix scan over one key returns its windows sorted by
//! start time.
//!
//! Every stream key carries a version that each window or join mutation on
//! that key bumps. Versions travel with snapshots.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::backend::StateBackend;
use crate::aggregation::Accumulator;
use crate::core::{JoinSide, Record};
use crate::error::{StateError, StateResult};
use crate::watermark::Watermark;
use crate::window::{Window, WindowId};

const TAG_OPEN: u8 = b'W';
const TAG_FIRED: u8 = b'F';
const TAG_JOIN: u8 = b'J';

/// Lifecycle slot of a window accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSlot {
    /// Still collecting records
    Open,
    /// Already emitted, kept until `end + allowed_lateness`
    Fired,
}

impl WindowSlot {
    fn tag(self) -> u8 {
        match self {
            WindowSlot::Open => TAG_OPEN,
            WindowSlot::Fired => TAG_FIRED,
        }
    }
}

fn encode_ts(ts: i64) -> [u8; 8] {
    ((ts as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn decode_ts(bytes: &[u8]) -> StateResult<i64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StateError::MalformedKey {
        reason: "truncated timestamp".to_string(),
    })?;
    Ok((u64::from_be_bytes(raw) ^ (1u64 << 63)) as i64)
}

fn key_prefix(tag: &[u8], key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + 4 + key.len() + 16);
    out.extend_from_slice(tag);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

fn window_key(slot: WindowSlot, key: &str, window: &Window) -> Vec<u8> {
    let mut out = key_prefix(&[slot.tag()], key);
    out.extend_from_slice(&encode_ts(window.start));
    out.extend_from_slice(&encode_ts(window.end));
    out
}

fn join_prefix(side: JoinSide) -> [u8; 2] {
    [TAG_JOIN, side.as_byte()]
}

fn join_key(side: JoinSide, key: &str, event_time: i64, seq: u64) -> Vec<u8> {
    let mut out = key_prefix(&join_prefix(side), key);
    out.extend_from_slice(&encode_ts(event_time));
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

/// Split the `len | key | rest` part that follows a tag
fn decode_user_key(bytes: &[u8]) -> StateResult<(String, &[u8])> {
    let malformed = |reason: &str| StateError::MalformedKey {
        reason: reason.to_string(),
    };
    if bytes.len() < 4 {
        return Err(malformed("missing key length"));
    }
    let (len_bytes, rest) = bytes.split_at(4);
    let mut len_raw = [0u8; 4];
    len_raw.copy_from_slice(len_bytes);
    let len = u32::from_be_bytes(len_raw) as usize;
    if rest.len() < len {
        return Err(malformed("truncated key"));
    }
    let (key, rest) = rest.split_at(len);
    let key = String::from_utf8(key.to_vec()).map_err(|_| malformed("key is not utf-8"))?;
    Ok((key, rest))
}

fn decode_window_key(bytes: &[u8]) -> StateResult<(String, i64, i64)> {
    let (key, rest) = decode_user_key(bytes.get(1..).unwrap_or_default())?;
    if rest.len() != 16 {
        return Err(StateError::MalformedKey {
            reason: "window key has wrong length".to_string(),
        });
    }
    Ok((key, decode_ts(&rest[..8])?, decode_ts(&rest[8..])?))
}

fn decode_value<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> StateResult<T> {
    bincode::deserialize(bytes).map_err(|e| StateError::DeserializationFailed {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

fn encode_value<T: Serialize>(key: &[u8], value: &T) -> StateResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StateError::SerializationFailed {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })
}

/// Persisted window accumulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWindow<V> {
    pub window: Window,
    pub accumulator: Accumulator<V>,
}

/// Buffered join record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinEntry<V> {
    pub side: JoinSide,
    pub record: Record<V>,
    /// `event_time + skew`; purged once the watermark passes it
    pub expiry: i64,
    /// Whether the entry has produced at least one joined pair
    pub matched: bool,
}

/// Opaque address of a stored join entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinEntryKey(Vec<u8>);

/// Point-in-time copy of a partition store
///
/// Entries are sorted by key. The checksum is the hex SHA-256 of the
/// bincode encoding of everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Partition watermark at the time of the snapshot
    pub watermark: Watermark,
    pub next_sequence: u64,
    /// Per stream key mutation counters, sorted by key
    #[serde(default)]
    pub versions: Vec<(String, u64)>,
    pub checksum: String,
}

impl StateSnapshot {
    pub fn new(
        mut entries: Vec<(Vec<u8>, Vec<u8>)>,
        watermark: Watermark,
        next_sequence: u64,
    ) -> StateResult<Self> {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut snapshot = Self {
            entries,
            watermark,
            next_sequence,
            versions: Vec::new(),
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.calculate_checksum()?;
        Ok(snapshot)
    }

    /// Attach key versions and re-seal the checksum
    pub fn with_versions(mut self, mut versions: Vec<(String, u64)>) -> StateResult<Self> {
        versions.sort();
        self.versions = versions;
        self.checksum = self.calculate_checksum()?;
        Ok(self)
    }

    /// Version recorded for a stream key, 0 when never written
    pub fn version(&self, key: &str) -> u64 {
        self.versions
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .map(|i| self.versions[i].1)
            .unwrap_or(0)
    }

    pub fn empty() -> StateResult<Self> {
        Self::new(Vec::new(), Watermark::min(), 0)
    }

    fn calculate_checksum(&self) -> StateResult<String> {
        let payload = bincode::serialize(&(&self.entries, &self.watermark, self.next_sequence, &self.versions))
            .map_err(|e| StateError::SerializationFailed {
                key: "snapshot".to_string(),
                reason: e.to_string(),
            })?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Check the stored checksum against the contents
    pub fn verify(&self) -> StateResult<()> {
        let expected = self.calculate_checksum()?;
        if expected != self.checksum {
            return Err(StateError::DeserializationFailed {
                key: "snapshot".to_string(),
                reason: format!(
                    "checksum mismatch: expected {}, found {}",
                    expected, self.checksum
                ),
            });
        }
        Ok(())
    }

    /// Encode as a self-describing blob
    pub fn to_bytes(&self) -> StateResult<Vec<u8>> {
        encode_value(b"snapshot", self)
    }

    /// Decode and verify a blob produced by [`StateSnapshot::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> StateResult<Self> {
        let snapshot: StateSnapshot = decode_value(b"snapshot", bytes)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Typed state of one partition
///
/// Exactly one worker owns a store, which gives every accumulator a single
/// writer.
pub struct StateStore<V> {
    backend: Arc<dyn StateBackend>,
    next_sequence: AtomicU64,
    versions: DashMap<String, u64>,
    _payload: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for StateStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.backend_type())
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .field("versioned_keys", &self.versions.len())
            .finish()
    }
}

impl<V> StateStore<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            next_sequence: AtomicU64::new(0),
            versions: DashMap::new(),
            _payload: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    /// Number of mutations applied to a stream key's state
    pub fn version(&self, key: &str) -> u64 {
        self.versions.get(key).map(|v| *v).unwrap_or(0)
    }

    fn bump_version(&self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    // ---- window accumulators ----

    pub async fn get_window(
        &self,
        slot: WindowSlot,
        key: &str,
        window: &Window,
    ) -> StateResult<Option<StoredWindow<V>>> {
        let raw_key = window_key(slot, key, window);
        match self.backend.get(&raw_key).await? {
            Some(bytes) => Ok(Some(decode_value(&raw_key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put_window(
        &self,
        slot: WindowSlot,
        key: &str,
        stored: &StoredWindow<V>,
    ) -> StateResult<()> {
        let raw_key = window_key(slot, key, &stored.window);
        let bytes = encode_value(&raw_key, stored)?;
        self.backend.put(&raw_key, &bytes).await?;
        self.bump_version(key);
        Ok(())
    }

    pub async fn delete_window(&self, slot: WindowSlot, key: &str, window: &Window) -> StateResult<()> {
        self.backend.delete(&window_key(slot, key, window)).await?;
        self.bump_version(key);
        Ok(())
    }

    /// Windows of one key, ascending by start
    pub async fn windows_for_key(&self, slot: WindowSlot, key: &str) -> StateResult<Vec<StoredWindow<V>>> {
        let prefix = key_prefix(&[slot.tag()], key);
        self.backend
            .entries(&prefix)
            .await?
            .into_iter()
            .map(|(k, v)| decode_value(&k, &v))
            .collect()
    }

    /// Every window in a slot with its id
    pub async fn all_windows(&self, slot: WindowSlot) -> StateResult<Vec<(WindowId, StoredWindow<V>)>> {
        let mut out = Vec::new();
        for (k, v) in self.backend.entries(&[slot.tag()]).await? {
            let (key, start, end) = decode_window_key(&k)?;
            out.push((WindowId { key, start, end }, decode_value(&k, &v)?));
        }
        Ok(out)
    }

    // ---- join buffer ----

    /// Buffer a join record and return its address
    pub async fn insert_join_entry(&self, entry: &JoinEntry<V>) -> StateResult<JoinEntryKey> {
        let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let raw_key = join_key(entry.side, &entry.record.key, entry.record.event_time, seq);
        let bytes = encode_value(&raw_key, entry)?;
        self.backend.put(&raw_key, &bytes).await?;
        self.bump_version(&entry.record.key);
        Ok(JoinEntryKey(raw_key))
    }

    pub async fn update_join_entry(&self, key: &JoinEntryKey, entry: &JoinEntry<V>) -> StateResult<()> {
        let bytes = encode_value(&key.0, entry)?;
        self.backend.put(&key.0, &bytes).await?;
        self.bump_version(&entry.record.key);
        Ok(())
    }

    pub async fn delete_join_entry(&self, key: &JoinEntryKey) -> StateResult<()> {
        self.backend.delete(&key.0).await?;
        let (stream_key, _) = decode_user_key(key.0.get(2..).unwrap_or_default())?;
        self.bump_version(&stream_key);
        Ok(())
    }

    /// Buffered entries of one side for one key, ascending by event time
    pub async fn join_entries_for_key(
        &self,
        side: JoinSide,
        key: &str,
    ) -> StateResult<Vec<(JoinEntryKey, JoinEntry<V>)>> {
        let prefix = key_prefix(&join_prefix(side), key);
        self.decode_join_entries(&prefix).await
    }

    /// Every buffered entry of one side
    pub async fn join_entries(&self, side: JoinSide) -> StateResult<Vec<(JoinEntryKey, JoinEntry<V>)>> {
        self.decode_join_entries(&join_prefix(side)).await
    }

    async fn decode_join_entries(&self, prefix: &[u8]) -> StateResult<Vec<(JoinEntryKey, JoinEntry<V>)>> {
        self.backend
            .entries(prefix)
            .await?
            .into_iter()
            .map(|(k, v)| {
                let entry = decode_value(&k, &v)?;
                Ok((JoinEntryKey(k), entry))
            })
            .collect()
    }

    // ---- snapshots ----

    /// Number of stored entries of all kinds
    pub async fn len(&self) -> StateResult<usize> {
        self.backend.count().await
    }

    /// Copy the whole store
    pub async fn snapshot(&self, watermark: Watermark) -> StateResult<StateSnapshot> {
        let entries = self.backend.entries(b"").await?;
        let versions = self
            .versions
            .iter()
            .map(|v| (v.key().clone(), *v.value()))
            .collect();
        StateSnapshot::new(
            entries,
            watermark,
            self.next_sequence.load(Ordering::Relaxed),
        )?
        .with_versions(versions)
    }

    /// Replace the store contents with a verified snapshot
    pub async fn restore(&self, snapshot: &StateSnapshot) -> StateResult<()> {
        snapshot.verify()?;
        self.backend.clear().await?;
        for (key, value) in &snapshot.entries {
            self.backend.put(key, value).await?;
        }
        self.backend.flush().await?;
        self.next_sequence
            .store(snapshot.next_sequence, Ordering::Relaxed);
        self.versions.clear();
        for (key, version) in &snapshot.versions {
            self.versions.insert(key.clone(), *version);
        }
        debug!(
            entries = snapshot.entries.len(),
            backend = self.backend.backend_type(),
            "Restored partition state"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregateFunction;
    use crate::state::{MemoryStateBackend, SledStateBackend};
    use crate::window::WindowKind;

    fn memory_store() -> StateStore<i64> {
        StateStore::new(Arc::new(MemoryStateBackend::new()))
    }

    fn count_of(n: u64) -> Accumulator<i64> {
        let mut acc = None;
        for i in 0..n {
            acc = Some(
                AggregateFunction::Count
                    .fold(acc, &Record::with_ingestion_time("k", 1i64, i as i64, 0))
                    .unwrap(),
            );
        }
        acc.unwrap()
    }

    fn stored(start: i64, end: i64, n: u64) -> StoredWindow<i64> {
        StoredWindow {
            window: Window::new(start, end, WindowKind::Tumbling),
            accumulator: count_of(n),
        }
    }

    #[test]
    fn test_timestamp_encoding_preserves_order() {
        let values = [i64::MIN, -1_000, -1, 0, 1, 1_000, i64::MAX];
        for pair in values.windows(2) {
            assert!(encode_ts(pair[0]) < encode_ts(pair[1]));
        }
        for v in values {
            assert_eq!(decode_ts(&encode_ts(v)).unwrap(), v);
        }
    }

    #[test]
    fn test_window_key_roundtrip() {
        let w = Window::new(-10, 20, WindowKind::Sliding);
        let raw = window_key(WindowSlot::Open, "user:1", &w);
        assert_eq!(decode_window_key(&raw).unwrap(), ("user:1".to_string(), -10, 20));
        assert!(decode_window_key(&raw[..raw.len() - 1]).is_err());
    }

    #[test]
    fn test_key_prefix_does_not_collide() {
        // "a" must not be a prefix of "ab"
        let a = key_prefix(&[TAG_OPEN], "a");
        let ab = window_key(WindowSlot::Open, "ab", &Window::new(0, 1, WindowKind::Tumbling));
        assert!(!ab.starts_with(&a));
    }

    #[tokio::test]
    async fn test_window_crud() {
        let store = memory_store();
        let entry = stored(0, 10, 3);
        let window = entry.window;

        store.put_window(WindowSlot::Open, "k1", &entry).await.unwrap();
        assert_eq!(
            store.get_window(WindowSlot::Open, "k1", &window).await.unwrap(),
            Some(entry.clone())
        );
        assert_eq!(store.get_window(WindowSlot::Fired, "k1", &window).await.unwrap(), None);

        store.delete_window(WindowSlot::Open, "k1", &window).await.unwrap();
        assert_eq!(store.get_window(WindowSlot::Open, "k1", &window).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_windows_for_key_sorted_by_start() {
        let store = memory_store();
        for start in [20, -10, 0] {
            store
                .put_window(WindowSlot::Open, "k", &stored(start, start + 10, 1))
                .await
                .unwrap();
        }
        store
            .put_window(WindowSlot::Open, "other", &stored(0, 10, 1))
            .await
            .unwrap();

        let starts: Vec<i64> = store
            .windows_for_key(WindowSlot::Open, "k")
            .await
            .unwrap()
            .iter()
            .map(|s| s.window.start)
            .collect();
        assert_eq!(starts, vec![-10, 0, 20]);

        let all = store.all_windows(WindowSlot::Open).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_join_entries() {
        let store = memory_store();
        for t in [5, 1, 5] {
            store
                .insert_join_entry(&JoinEntry {
                    side: JoinSide::Left,
                    record: Record::with_ingestion_time("k", t, t, 0),
                    expiry: t + 10,
                    matched: false,
                })
                .await
                .unwrap();
        }
        let entries = store.join_entries_for_key(JoinSide::Left, "k").await.unwrap();
        let times: Vec<i64> = entries.iter().map(|(_, e)| e.record.event_time).collect();
        assert_eq!(times, vec![1, 5, 5]);
        assert!(store.join_entries(JoinSide::Right).await.unwrap().is_empty());

        let (key, mut entry) = entries[0].clone();
        entry.matched = true;
        store.update_join_entry(&key, &entry).await.unwrap();
        store.delete_join_entry(&entries[1].0).await.unwrap();

        let entries = store.join_entries(JoinSide::Left).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].1.matched);
    }

    #[tokio::test]
    async fn test_snapshot_restore_reproduces_store() {
        let store = memory_store();
        store.put_window(WindowSlot::Open, "a", &stored(0, 10, 2)).await.unwrap();
        store.put_window(WindowSlot::Fired, "b", &stored(10, 20, 5)).await.unwrap();
        store
            .insert_join_entry(&JoinEntry {
                side: JoinSide::Right,
                record: Record::with_ingestion_time("a", 1, 1, 0),
                expiry: 11,
                matched: false,
            })
            .await
            .unwrap();

        let snapshot = store.snapshot(Watermark::new(9)).await.unwrap();
        let blob = snapshot.to_bytes().unwrap();

        let restored: StateStore<i64> = StateStore::new(Arc::new(SledStateBackend::temporary().await.unwrap()));
        restored.restore(&StateSnapshot::from_bytes(&blob).unwrap()).await.unwrap();

        let again = restored.snapshot(Watermark::new(9)).await.unwrap();
        assert_eq!(again, snapshot);
        assert_eq!(again.next_sequence, 1);
    }

    #[tokio::test]
    async fn test_versions_bump_on_mutation_and_survive_restore() {
        let store = memory_store();
        assert_eq!(store.version("a"), 0);

        let entry = stored(0, 10, 2);
        store.put_window(WindowSlot::Open, "a", &entry).await.unwrap();
        store.put_window(WindowSlot::Open, "a", &stored(0, 10, 3)).await.unwrap();
        store.delete_window(WindowSlot::Open, "a", &entry.window).await.unwrap();
        assert_eq!(store.version("a"), 3);

        let join_key = store
            .insert_join_entry(&JoinEntry {
                side: JoinSide::Left,
                record: Record::with_ingestion_time("b", 1, 1, 0),
                expiry: 11,
                matched: false,
            })
            .await
            .unwrap();
        store.delete_join_entry(&join_key).await.unwrap();
        assert_eq!(store.version("b"), 2);
        // deletes leave the version behind
        assert_eq!(store.len().await.unwrap(), 0);

        let blob = store.snapshot(Watermark::new(5)).await.unwrap().to_bytes().unwrap();
        let snapshot = StateSnapshot::from_bytes(&blob).unwrap();
        assert_eq!(snapshot.version("a"), 3);
        assert_eq!(snapshot.version("b"), 2);
        assert_eq!(snapshot.version("missing"), 0);

        let restored = memory_store();
        restored.put_window(WindowSlot::Open, "c", &entry).await.unwrap();
        restored.restore(&snapshot).await.unwrap();
        assert_eq!(restored.version("a"), 3);
        assert_eq!(restored.version("b"), 2);
        assert_eq!(restored.version("c"), 0);

        restored.put_window(WindowSlot::Open, "a", &entry).await.unwrap();
        assert_eq!(restored.version("a"), 4);
    }

    #[tokio::test]
    async fn test_tampered_versions_fail_verification() {
        let store = memory_store();
        store.put_window(WindowSlot::Open, "a", &stored(0, 10, 2)).await.unwrap();
        let mut snapshot = store.snapshot(Watermark::min()).await.unwrap();
        snapshot.versions[0].1 = 99;
        assert!(snapshot.verify().is_err());
    }

    #[tokio::test]
    async fn test_restore_replaces_existing_state() {
        let store = memory_store();
        store.put_window(WindowSlot::Open, "a", &stored(0, 10, 2)).await.unwrap();
        let snapshot = store.snapshot(Watermark::min()).await.unwrap();

        store.put_window(WindowSlot::Open, "b", &stored(0, 10, 2)).await.unwrap();
        store.restore(&snapshot).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_is_rejected() {
        let store = memory_store();
        store.put_window(WindowSlot::Open, "a", &stored(0, 10, 2)).await.unwrap();
        let mut snapshot = store.snapshot(Watermark::min()).await.unwrap();
        snapshot.entries[0].1[0] ^= 0xFF;

        assert!(snapshot.verify().is_err());
        assert!(store.restore(&snapshot).await.is_err());

        let blob = snapshot.to_bytes().unwrap();
        assert!(StateSnapshot::from_bytes(&blob).is_err());
        assert!(StateSnapshot::from_bytes(b"garbage").is_err());
    }
}
