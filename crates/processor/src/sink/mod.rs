//! Result sinks
//!
//! Delivery is at-least-once: after a restart the processor may hand a sink
//! results it already wrote before the crash, so sinks must tolerate
//! duplicates (results carry a stable identity such as a
//! [`WindowId`](crate::window::WindowId)).

pub mod json_lines;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use json_lines::JsonLinesSink;
pub use memory::MemorySink;

/// Destination for a stream of outputs
#[async_trait]
pub trait Sink<O>: Send + Sync {
    /// Write one batch; on error the processor may retry the same batch
    async fn write(&self, batch: &[O]) -> Result<()>;

    /// Flush and release resources
    async fn close(&self) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str {
        "sink"
    }
}

#[async_trait]
impl<O: Sync + 'static> Sink<O> for Box<dyn Sink<O>> {
    async fn write(&self, batch: &[O]) -> Result<()> {
        (**self).write(batch).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
