//! Bounded retry with linear backoff
//!
//! `RetryPolicy` retries an async operation while it fails with a retryable
//! error. `RetryingClient` applies a policy to the idempotent calls of any
//! [`RemoteClient`]; slice uploads and download streams pass straight through
//! because the engines run their own session-aware retry loops for those.

use crate::error::TransferError;
use crate::remote::{
    ByteStream, CreateRequest, PrecreateRequest, PrecreateResponse, RemoteClient,
};
use async_trait::async_trait;
use bytes::Bytes;
use pansync_types::{ByteRange, FileOperation, RemoteFile, Settings};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Sleep after failed attempt `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_millis(settings.retry_backoff_ms),
        )
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The last error is returned in the failure cases.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let wait = self.backoff * attempt;
                    warn!(
                        "Retry {}/{} for {} after error: {} (waiting {:.1}s)",
                        attempt,
                        self.max_attempts,
                        label,
                        e,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wraps a [`RemoteClient`] and retries its idempotent operations
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: RemoteClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: RemoteClient> RemoteClient for RetryingClient<C> {
    async fn precreate(&self, request: &PrecreateRequest) -> Result<PrecreateResponse, TransferError> {
        self.policy
            .run("precreate", || self.inner.precreate(request))
            .await
    }

    async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        part_index: usize,
        data: Bytes,
    ) -> Result<(), TransferError> {
        self.inner
            .upload_slice(upload_id, remote_path, part_index, data)
            .await
    }

    async fn create_file(&self, request: &CreateRequest) -> Result<RemoteFile, TransferError> {
        self.policy
            .run("create", || self.inner.create_file(request))
            .await
    }

    async fn get_download_link(&self, fs_id: u64) -> Result<String, TransferError> {
        self.policy
            .run("get_download_link", || self.inner.get_download_link(fs_id))
            .await
    }

    async fn stream_download(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, TransferError> {
        self.inner.stream_download(url, range).await
    }

    async fn list_recursive(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        self.policy
            .run("list_recursive", || self.inner.list_recursive(dir))
            .await
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        self.policy
            .run("list_dir", || self.inner.list_dir(dir))
            .await
    }

    async fn search(&self, key: &str, dir: Option<&str>) -> Result<Vec<RemoteFile>, TransferError> {
        self.policy
            .run("search", || self.inner.search(key, dir))
            .await
    }

    async fn file_manager(&self, operation: &FileOperation) -> Result<(), TransferError> {
        self.policy
            .run("file_manager", || self.inner.file_manager(operation))
            .await
    }

    async fn mkdir(&self, path: &str) -> Result<RemoteFile, TransferError> {
        self.policy.run("mkdir", || self.inner.mkdir(path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures_with_linear_backoff() {
        let policy = RetryPolicy::new(4, Duration::from_secs(2));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let c = calls.clone();
        let result = policy
            .run("flaky", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 4 {
                        Err(TransferError::TransientNetwork(format!("reset {}", n)))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 2*1 + 2*2 + 2*3
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error_after_exhaustion() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run("always_failing", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(TransferError::TransientNetwork(format!("attempt {}", n)))
                }
            })
            .await;

        match result {
            Err(TransferError::TransientNetwork(message)) => assert_eq!(message, "attempt 3"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // two sleeps: 1*1 + 1*2
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_retry_remote_or_auth_errors() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let c = calls.clone();
        let result: Result<(), _> = policy
            .run("quota", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TransferError::remote(31112, "quota exceeded"))
                }
            })
            .await;

        assert!(matches!(result, Err(TransferError::RemoteApi { code: 31112, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_client_retries_listing_but_not_slices() {
        let fake = FakeRemote::new();
        fake.fail_listing_times(2);
        fake.fail_slices_with(|_| Some(TransferError::TransientNetwork("reset".into())));
        let client = RetryingClient::new(fake.clone(), RetryPolicy::new(3, Duration::from_millis(10)));

        let listed = client.list_recursive("/apps/bypy/x").await;
        assert!(listed.is_ok());
        assert_eq!(fake.list_calls(), 3);

        let sent = client
            .upload_slice("id", "/apps/bypy/x/a", 0, Bytes::from_static(b"abc"))
            .await;
        assert!(sent.is_err());
        assert_eq!(fake.slice_attempts(), 1);
    }
}
