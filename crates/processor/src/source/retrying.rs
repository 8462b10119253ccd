//! Retrying source adapter
//!
//! Wraps any [`Source`] and retries failed polls with exponential backoff.
//! Once the retries are exhausted the failure surfaces as
//! [`EngineError::SourceRead`], which stops the pipeline.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{PositionToken, Source, SourceBatch};
use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;

/// Source adapter with bounded retries on `poll`
pub struct RetryingSource<S> {
    inner: S,
    policy: RetryPolicy,
    total_retries: u64,
}

impl<S> RetryingSource<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            total_retries: 0,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Retries performed over the lifetime of this adapter
    pub fn total_retries(&self) -> u64 {
        self.total_retries
    }
}

#[async_trait]
impl<V, S> Source<V> for RetryingSource<S>
where
    V: Send + 'static,
    S: Source<V>,
{
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn poll(&mut self) -> Result<SourceBatch<V>> {
        let mut retries = 0;
        loop {
            match self.inner.poll().await {
                Ok(batch) => {
                    if retries > 0 {
                        debug!(source = %self.inner.id(), retries, "Poll succeeded after retries");
                    }
                    return Ok(batch);
                }
                Err(e) => {
                    if retries >= self.policy.max_retries {
                        error!(source = %self.inner.id(), attempts = retries + 1, error = %e, "Source read failed");
                        return Err(EngineError::SourceRead {
                            source_id: self.inner.id().to_string(),
                            attempts: retries + 1,
                            reason: e.to_string(),
                        });
                    }
                    retries += 1;
                    self.total_retries += 1;
                    let backoff = self.policy.backoff(retries);
                    warn!(
                        source = %self.inner.id(),
                        "Poll failed (attempt {}/{}), retrying in {:?}: {}",
                        retries,
                        self.policy.max_attempts(),
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn position(&self) -> PositionToken {
        self.inner.position()
    }

    async fn commit_position(&mut self, token: &PositionToken) -> Result<()> {
        self.inner.commit_position(token).await
    }

    async fn seek(&mut self, token: &PositionToken) -> Result<()> {
        self.inner.seek(token).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Record;
    use std::time::Duration;

    /// Fails the first `failures` polls, then yields one record
    struct FlakySource {
        failures: u32,
        polls: u32,
    }

    #[async_trait]
    impl Source<i64> for FlakySource {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn poll(&mut self) -> Result<SourceBatch<i64>> {
            self.polls += 1;
            if self.polls <= self.failures {
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            Ok(SourceBatch::new(vec![Record::new("k", 1, 1)]))
        }

        fn position(&self) -> PositionToken {
            PositionToken::from_u64(self.polls as u64)
        }

        async fn commit_position(&mut self, _token: &PositionToken) -> Result<()> {
            Ok(())
        }

        async fn seek(&mut self, _token: &PositionToken) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retry_limit() {
        let mut source = RetryingSource::new(
            FlakySource { failures: 2, polls: 0 },
            RetryPolicy::new(3, Duration::from_millis(10)),
        );
        let batch = source.poll().await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(source.total_retries(), 2);
        assert_eq!(source.inner().polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_source_read() {
        let mut source = RetryingSource::new(
            FlakySource { failures: 10, polls: 0 },
            RetryPolicy::new(2, Duration::from_millis(10)),
        );
        match source.poll().await {
            Err(EngineError::SourceRead {
                source_id, attempts, ..
            }) => {
                assert_eq!(source_id, "flaky");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected SourceRead, got {:?}", other.map(|b| b.records.len())),
        }
    }
}
