//! State management for stream processing
//!
//! Each partition worker owns one [`StateStore`], a typed layer over a
//! byte-oriented [`StateBackend`]:
//!
//! - [`MemoryStateBackend`]: concurrent in-memory map (default)
//! - [`SledStateBackend`]: durable, log-structured on-disk store
//!
//! Stores snapshot into checksummed [`StateSnapshot`]s, which the processor
//! collects into a [`Checkpoint`] and hands to a [`CheckpointStorage`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use stream_processor::state::{MemoryStateBackend, StateBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = MemoryStateBackend::new();
//!     backend.put(b"window:123", b"state_data").await?;
//!
//!     let keys = backend.list_keys(b"window:").await?;
//!     println!("Found {} windows", keys.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checkpoint;
pub mod memory;
pub mod sled_backend;
pub mod store;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use backend::StateBackend;
pub use checkpoint::{
    Checkpoint, CheckpointStorage, FileCheckpointStorage, InMemoryCheckpointStorage,
    PartitionSnapshot, SourcePosition,
};
pub use memory::{MemoryBackendStats, MemoryStateBackend};
pub use sled_backend::{SledBackendStats, SledConfig, SledStateBackend};
pub use store::{JoinEntry, JoinEntryKey, StateSnapshot, StateStore, StoredWindow, WindowSlot};

use crate::error::StateResult;

/// Which backend holds partition state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Memory,
    /// Sled database per partition under the state directory
    Durable,
}

/// Open the backend for one partition
pub async fn open_backend(
    kind: StateBackendKind,
    state_dir: &Path,
    partition: u32,
) -> StateResult<Arc<dyn StateBackend>> {
    match kind {
        StateBackendKind::Memory => Ok(Arc::new(MemoryStateBackend::new())),
        StateBackendKind::Durable => {
            let config = SledConfig::new(state_dir.join(format!("partition-{}", partition)));
            Ok(Arc::new(SledStateBackend::open(config).await?))
        }
    }
}
