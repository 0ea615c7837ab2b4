//! Download engine - simple ranged path and multi-worker segmented path
//!
//! Bytes always land in a `<name>.pansync.tmp` sidecar next to the target;
//! the final name appears only once the file is complete.

use crate::engine::persistence::ProgressStore;
use crate::engine::segment_worker::SegmentWorker;
use crate::engine::relative_path;
use crate::error::TransferError;
use crate::remote::RemoteClient;
use futures::StreamExt;
use pansync_types::{ByteRange, DownloadSession, RemoteFile, Segment, Settings, SyncFailure, SyncReport, TransferEvent};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub const SIDECAR_SUFFIX: &str = ".pansync.tmp";

/// `<local_path>.pansync.tmp`
pub fn sidecar_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Parameters of one file download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub fs_id: u64,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub file_size: u64,
    /// Segment even when the file is below the size threshold
    pub force_segmented: bool,
    pub workers: usize,
    pub segment_size: u64,
}

impl DownloadRequest {
    /// Request for `file` using the configured worker count and segment size
    pub fn new(file: &RemoteFile, local_path: impl Into<PathBuf>, settings: &Settings) -> Self {
        Self {
            fs_id: file.fs_id,
            remote_path: file.path.clone(),
            local_path: local_path.into(),
            file_size: file.size,
            force_segmented: false,
            workers: settings.download_workers,
            segment_size: settings.download_segment_size,
        }
    }

    pub fn segmented(mut self, force: bool) -> Self {
        self.force_segmented = force;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Resumable downloader
pub struct DownloadEngine {
    client: Arc<dyn RemoteClient>,
    store: Arc<dyn ProgressStore>,
    settings: Settings,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl DownloadEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        store: Arc<dyn ProgressStore>,
        settings: Settings,
        event_tx: broadcast::Sender<TransferEvent>,
    ) -> Self {
        Self {
            client,
            store,
            settings,
            event_tx,
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.event_tx.send(event);
    }

    fn is_segmented(&self, request: &DownloadRequest) -> bool {
        (request.force_segmented || request.file_size > self.settings.segmented_threshold)
            && request.segment_size > 0
            && request.file_size > request.segment_size
    }

    /// Download one remote file to `request.local_path` and return that path
    pub async fn download_file(&self, request: &DownloadRequest) -> Result<PathBuf, TransferError> {
        if let Some(parent) = request.local_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let request = &self.plan(request).await?;
        if self.is_segmented(request) {
            info!(
                "Segmented download of {} ({} bytes, up to {} workers)",
                request.remote_path, request.file_size, request.workers
            );
            self.download_segmented(request).await?;
        } else {
            self.download_simple(request).await?;
        }

        let sidecar = sidecar_path(&request.local_path);
        fs::rename(&sidecar, &request.local_path).await?;
        self.store.clear_download(&request.remote_path).await?;

        info!("Download complete: {} -> {}", request.remote_path, request.local_path.display());
        self.emit(TransferEvent::DownloadCompleted {
            remote_path: request.remote_path.clone(),
            local_path: request.local_path.clone(),
        });
        Ok(request.local_path.clone())
    }

    /// Settle how an interrupted transfer of the same file continues.
    ///
    /// A segmented record means the sidecar is pre-sized but possibly full of
    /// holes, so it is never trusted by the simple path.
    async fn plan(&self, request: &DownloadRequest) -> Result<DownloadRequest, TransferError> {
        let mut plan = request.clone();
        if self.is_segmented(request) {
            return Ok(plan);
        }
        let Some(saved) = self.store.load_download(&request.remote_path).await? else {
            return Ok(plan);
        };

        if saved.file_size == request.file_size
            && saved.segment_size > 0
            && saved.file_size > saved.segment_size
        {
            info!(
                "Continuing segmented download of {} ({} segments complete)",
                request.remote_path,
                saved.completed_segments.len()
            );
            plan.force_segmented = true;
            plan.segment_size = saved.segment_size;
            return Ok(plan);
        }

        info!("Discarding segmented progress for {}", request.remote_path);
        match fs::remove_file(sidecar_path(&request.local_path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.clear_download(&request.remote_path).await?;
        Ok(plan)
    }

    // ========================================================================
    // Simple path
    // ========================================================================

    async fn download_simple(&self, request: &DownloadRequest) -> Result<(), TransferError> {
        let sidecar = sidecar_path(&request.local_path);
        let mut offset = match fs::metadata(&sidecar).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if offset >= request.file_size {
            if offset == 0 {
                fs::File::create(&sidecar).await?;
            }
            info!("{} already fully downloaded", request.local_path.display());
            return Ok(());
        }

        if offset > 0 {
            info!("Resuming {} from byte {}", request.remote_path, offset);
        }
        self.emit(TransferEvent::DownloadStarted {
            remote_path: request.remote_path.clone(),
            total_bytes: request.file_size,
            already_downloaded: offset,
        });

        let max_attempts = self.settings.max_link_refreshes.max(1);
        let backoff = Duration::from_millis(self.settings.link_retry_backoff_ms);
        let mut link = self.client.get_download_link(request.fs_id).await?;
        let mut attempt = 1;

        loop {
            match self.append_from(&link, &sidecar, offset, request).await {
                Ok(()) => return Ok(()),
                Err(e) if (e.needs_new_session() || e.is_retryable()) && attempt < max_attempts => {
                    let wait = backoff * attempt;
                    warn!(
                        "Download of {} interrupted (attempt {}/{}): {}; retrying in {:.1}s",
                        request.remote_path,
                        attempt,
                        max_attempts,
                        e,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                    if e.needs_new_session() {
                        link = self.client.get_download_link(request.fs_id).await?;
                        self.emit(TransferEvent::LinkRefreshed {
                            remote_path: request.remote_path.clone(),
                            worker: 0,
                        });
                    }
                    offset = fs::metadata(&sidecar).await.map(|m| m.len()).unwrap_or(0);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append the body from `offset` on to the sidecar
    async fn append_from(
        &self,
        link: &str,
        sidecar: &Path,
        offset: u64,
        request: &DownloadRequest,
    ) -> Result<(), TransferError> {
        let range = (offset > 0).then(|| ByteRange::from(offset));
        let mut stream = self.client.stream_download(link, range).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(sidecar)
            .await?;

        let mut received = offset;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            self.emit(TransferEvent::BytesDownloaded {
                remote_path: request.remote_path.clone(),
                bytes: chunk.len() as u64,
            });
        }
        file.flush().await?;

        if received < request.file_size {
            return Err(TransferError::TransientNetwork(format!(
                "stream ended at {} of {} bytes",
                received, request.file_size
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Segmented path
    // ========================================================================

    async fn download_segmented(&self, request: &DownloadRequest) -> Result<(), TransferError> {
        let sidecar = sidecar_path(&request.local_path);
        let sidecar_len = match fs::metadata(&sidecar).await {
            Ok(metadata) => Some(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let session = match self.store.load_download(&request.remote_path).await? {
            Some(saved)
                if saved.file_size == request.file_size
                    && saved.segment_size == request.segment_size
                    && sidecar_len == Some(request.file_size) =>
            {
                if !saved.completed_segments.is_empty() {
                    info!(
                        "Resuming {}: {} segments already complete",
                        request.remote_path,
                        saved.completed_segments.len()
                    );
                }
                saved
            }
            Some(_) => {
                info!("Discarding stale progress for {}", request.remote_path);
                DownloadSession::new(&request.remote_path, request.file_size, request.segment_size)
            }
            None => DownloadSession::new(&request.remote_path, request.file_size, request.segment_size),
        };

        // sparse preallocation; segments are written at their offsets
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&sidecar)
            .await?;
        if file.metadata().await?.len() != request.file_size {
            file.set_len(request.file_size).await?;
        }
        drop(file);

        self.store.save_download(&session).await?;

        let pending = session.pending();
        self.emit(TransferEvent::DownloadStarted {
            remote_path: request.remote_path.clone(),
            total_bytes: request.file_size,
            already_downloaded: session.completed_bytes(),
        });
        if pending.is_empty() {
            return Ok(());
        }

        let worker_count = request.workers.max(1).min(pending.len());
        let mut assignments: Vec<Vec<Segment>> = vec![Vec::new(); worker_count];
        for (i, segment) in pending.into_iter().enumerate() {
            assignments[i % worker_count].push(segment);
        }

        let session = Arc::new(Mutex::new(session));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut join_set = JoinSet::new();
        for (worker_id, segments) in assignments.into_iter().enumerate() {
            let worker = SegmentWorker {
                worker_id,
                segments,
                fs_id: request.fs_id,
                remote_path: request.remote_path.clone(),
                sidecar: sidecar.clone(),
                client: self.client.clone(),
                store: self.store.clone(),
                session: session.clone(),
                event_tx: self.event_tx.clone(),
                cancelled: cancelled.clone(),
                stagger: Duration::from_millis(self.settings.worker_stagger_ms),
                max_attempts: self.settings.max_link_refreshes.max(1),
                retry_backoff: Duration::from_millis(self.settings.link_retry_backoff_ms),
            };
            join_set.spawn(async move { (worker_id, worker.run().await) });
        }

        let mut first_error: Option<TransferError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((worker_id, Err(e))) => {
                    error!("Worker {} failed: {}", worker_id, e);
                    cancelled.store(true, Ordering::Release);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Worker task panicked: {}", e);
                    cancelled.store(true, Ordering::Release);
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let remaining = session.lock().await.pending().len();
        if remaining > 0 {
            return Err(TransferError::TransientNetwork(format!(
                "{} segments of {} still missing",
                remaining, request.remote_path
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Trees
    // ========================================================================

    /// Download every file below `remote_dir` into `local_dir`, keeping the layout.
    ///
    /// A failed file is recorded and the rest continue; an auth failure stops the run.
    pub async fn download_dir(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        workers: usize,
        force_segmented: bool,
    ) -> Result<SyncReport, TransferError> {
        fs::create_dir_all(local_dir).await?;
        let files = self.client.list_recursive(remote_dir).await?;
        let mut report = SyncReport::default();

        for file in files.iter().filter(|f| !f.is_dir) {
            let Some(rel) = relative_path(remote_dir, &file.path) else {
                continue;
            };
            let request = DownloadRequest::new(file, local_dir.join(rel), &self.settings)
                .segmented(force_segmented)
                .workers(workers);
            match self.download_file(&request).await {
                Ok(_) => report.transferred.push(rel.to_string()),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!("Failed to download {}: {}", file.path, e);
                    report.failures.push(SyncFailure {
                        path: rel.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}
