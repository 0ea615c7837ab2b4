//! Segment worker - fetches a share of the segments of one download
//!
//! Each worker holds a single download link for its whole lifetime and writes
//! every segment at its offset in the shared, pre-sized sidecar file. A revoked
//! link is replaced on the spot and the same range is requested again.

use crate::engine::persistence::ProgressStore;
use crate::error::TransferError;
use crate::remote::RemoteClient;
use futures::StreamExt;
use pansync_types::{ByteRange, DownloadSession, Segment, TransferEvent};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// One worker of a segmented download
pub struct SegmentWorker {
    pub worker_id: usize,
    pub segments: Vec<Segment>,
    pub fs_id: u64,
    pub remote_path: String,
    pub sidecar: PathBuf,
    pub client: Arc<dyn RemoteClient>,
    pub store: Arc<dyn ProgressStore>,
    pub session: Arc<Mutex<DownloadSession>>,
    pub event_tx: broadcast::Sender<TransferEvent>,
    pub cancelled: Arc<AtomicBool>,
    /// Start delay, multiplied by `worker_id`
    pub stagger: Duration,
    /// Attempts per segment
    pub max_attempts: u32,
    /// Wait after failed attempt `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
}

impl SegmentWorker {
    /// Fetch all assigned segments. Returns how many were completed.
    pub async fn run(self) -> Result<usize, TransferError> {
        if !self.stagger.is_zero() {
            tokio::time::sleep(self.stagger * self.worker_id as u32).await;
        }
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut link = self.client.get_download_link(self.fs_id).await?;
        debug!(
            "Worker {} got a link for {} ({} segments)",
            self.worker_id,
            self.remote_path,
            self.segments.len()
        );

        let mut completed = 0;
        for segment in &self.segments {
            if self.cancelled.load(Ordering::Acquire) {
                info!("Worker {} stopping early", self.worker_id);
                break;
            }

            self.fetch_segment(segment, &mut link).await?;

            {
                let mut session = self.session.lock().await;
                session.completed_segments.insert(segment.index);
                self.store.save_download(&session).await?;
            }
            completed += 1;

            let _ = self.event_tx.send(TransferEvent::BytesDownloaded {
                remote_path: self.remote_path.clone(),
                bytes: segment.size(),
            });
            let _ = self.event_tx.send(TransferEvent::SegmentCompleted {
                remote_path: self.remote_path.clone(),
                index: segment.index,
            });
        }

        Ok(completed)
    }

    async fn fetch_segment(&self, segment: &Segment, link: &mut String) -> Result<(), TransferError> {
        let mut attempt = 1;
        loop {
            match self.write_range(segment, link).await {
                Ok(()) => return Ok(()),
                Err(e) if (e.needs_new_session() || e.is_retryable()) && attempt < self.max_attempts => {
                    let wait = self.retry_backoff * attempt;
                    warn!(
                        "Segment {} of {} failed (attempt {}/{}): {}; retrying in {:.1}s",
                        segment.index,
                        self.remote_path,
                        attempt,
                        self.max_attempts,
                        e,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;

                    if e.needs_new_session() {
                        *link = self.client.get_download_link(self.fs_id).await?;
                        let _ = self.event_tx.send(TransferEvent::LinkRefreshed {
                            remote_path: self.remote_path.clone(),
                            worker: self.worker_id,
                        });
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ranged GET for one segment, written at its offset
    async fn write_range(&self, segment: &Segment, link: &str) -> Result<(), TransferError> {
        let mut stream = self
            .client
            .stream_download(link, Some(ByteRange::segment(segment)))
            .await?;

        let mut file = OpenOptions::new().write(true).open(&self.sidecar).await?;
        file.seek(std::io::SeekFrom::Start(segment.start)).await?;

        let expected = segment.size();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if written + chunk.len() as u64 > expected {
                return Err(TransferError::TransientNetwork(format!(
                    "segment {} received more than {} bytes",
                    segment.index, expected
                )));
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written != expected {
            return Err(TransferError::TransientNetwork(format!(
                "segment {} delivered {} of {} bytes",
                segment.index, written, expected
            )));
        }
        Ok(())
    }
}
