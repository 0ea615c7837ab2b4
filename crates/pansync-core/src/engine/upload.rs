//! Upload engine - precreate, parallel slices, session refresh, create
//!
//! A file is announced with its digests first. When the remote already holds
//! the content the upload ends there. Otherwise the missing slices are sent
//! through a bounded pool, every accepted slice is persisted, and a rejected
//! session is replaced by a fresh one without losing finished slices.

use crate::digest::Digester;
use crate::engine::persistence::ProgressStore;
use crate::error::TransferError;
use crate::remote::{CreateRequest, PrecreateRequest, RemoteClient};
use bytes::Bytes;
use pansync_types::{FileDigests, RenamePolicy, Settings, TransferEvent, UploadSession};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Result of a finished upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub remote_path: String,
    pub size: u64,
    /// The remote already had the content; no slice was sent
    pub rapid: bool,
    /// Id of the created file. Rapid uploads do not report one.
    pub fs_id: Option<u64>,
    /// Slices sent by this invocation
    pub slices_sent: usize,
}

/// Slice size for a file of `file_size` bytes.
///
/// Stays at `base` until that would need more than `max_slices` slices, then
/// grows in whole multiples of `base`.
pub fn effective_chunk_size(file_size: u64, base: u64, max_slices: u64) -> u64 {
    let base = base.max(1);
    let max_slices = max_slices.max(1);
    if file_size.div_ceil(base) <= max_slices {
        return base;
    }
    file_size.div_ceil(max_slices).div_ceil(base) * base
}

fn slice_len(index: usize, chunk_size: u64, file_size: u64) -> u64 {
    let offset = index as u64 * chunk_size;
    chunk_size.min(file_size.saturating_sub(offset))
}

async fn read_slice(path: &Path, index: usize, chunk_size: u64, file_size: u64) -> Result<Bytes, TransferError> {
    let len = slice_len(index, chunk_size, file_size);
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(index as u64 * chunk_size))
        .await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Everything one slice task needs
#[derive(Clone)]
struct SliceContext {
    client: Arc<dyn RemoteClient>,
    store: Arc<dyn ProgressStore>,
    session: Arc<Mutex<UploadSession>>,
    stop: Arc<AtomicBool>,
    event_tx: broadcast::Sender<TransferEvent>,
    local_path: PathBuf,
    remote_path: String,
    chunk_size: u64,
    file_size: u64,
}

impl SliceContext {
    /// `Ok(false)` means the slice was skipped because the batch was stopped
    async fn send(&self, index: usize, upload_id: &str) -> Result<bool, TransferError> {
        if self.stop.load(Ordering::Acquire) {
            return Ok(false);
        }

        let data = read_slice(&self.local_path, index, self.chunk_size, self.file_size).await?;
        let bytes = data.len() as u64;
        self.client
            .upload_slice(upload_id, &self.remote_path, index, data)
            .await?;

        {
            let mut session = self.session.lock().await;
            session.uploaded_parts.insert(index);
            self.store.save_upload(&session).await?;
        }
        debug!("Slice {} of {} uploaded ({} bytes)", index, self.remote_path, bytes);

        let _ = self.event_tx.send(TransferEvent::SliceUploaded {
            remote_path: self.remote_path.clone(),
            index,
            bytes,
        });
        Ok(true)
    }
}

/// Chunked uploader with resumable progress
pub struct UploadEngine {
    client: Arc<dyn RemoteClient>,
    digester: Digester,
    store: Arc<dyn ProgressStore>,
    settings: Settings,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl UploadEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        digester: Digester,
        store: Arc<dyn ProgressStore>,
        settings: Settings,
        event_tx: broadcast::Sender<TransferEvent>,
    ) -> Self {
        Self {
            client,
            digester,
            store,
            settings,
            event_tx,
        }
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Upload one local file to `remote_path`, resuming saved progress
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        workers: usize,
        rename: RenamePolicy,
    ) -> Result<UploadOutcome, TransferError> {
        let metadata = tokio::fs::metadata(local_path).await?;
        if !metadata.is_file() {
            return Err(TransferError::InvalidInput(format!(
                "{} is not a regular file",
                local_path.display()
            )));
        }
        let file_size = metadata.len();

        let base = self.settings.upload_chunk_size;
        let chunk_size = effective_chunk_size(file_size, base, self.settings.max_upload_slices);
        if chunk_size != base {
            info!(
                "Large file ({} bytes, {} slices at {} bytes). Auto-scaled chunk size to {} bytes ({} slices)",
                file_size,
                file_size.div_ceil(base.max(1)),
                base,
                chunk_size,
                file_size.div_ceil(chunk_size)
            );
        }
        if chunk_size > self.settings.max_chunk_size_warning {
            warn!(
                "Chunk size {} exceeds the documented maximum of {} bytes; upload may fail depending on the account tier",
                chunk_size, self.settings.max_chunk_size_warning
            );
        }

        let digests = self.digester.compute(local_path, chunk_size, true).await?;
        let precreate = PrecreateRequest {
            remote_path: remote_path.to_string(),
            size: file_size,
            is_dir: false,
            block_list: digests.block_list.clone(),
            content_md5: digests.content_md5.clone(),
            slice_md5: digests.slice_md5.clone(),
            rename,
        };

        let response = self.client.precreate(&precreate).await?;
        if response.is_rapid() {
            info!("Rapid upload succeeded for {}", local_path.display());
            self.store.clear_upload(remote_path).await?;
            self.emit(TransferEvent::RapidUpload {
                remote_path: remote_path.to_string(),
            });
            return Ok(UploadOutcome {
                remote_path: remote_path.to_string(),
                size: file_size,
                rapid: true,
                fs_id: None,
                slices_sent: 0,
            });
        }

        // Server may ask for a subset of slices
        let total = digests.block_count();
        let needed: Vec<usize> = if response.block_list.is_empty() {
            (0..total).collect()
        } else {
            response.block_list.iter().copied().filter(|&i| i < total).collect()
        };

        // Saved parts only count for the same chunk size; the id is always fresh
        let session = match self.store.load_upload(remote_path).await? {
            Some(saved) if saved.chunk_size == chunk_size => {
                if !saved.uploaded_parts.is_empty() {
                    info!(
                        "Resuming upload: {}/{} slices already uploaded",
                        saved.uploaded_parts.len(),
                        total
                    );
                }
                UploadSession {
                    upload_id: response.upload_id.clone(),
                    ..saved
                }
            }
            Some(saved) => {
                info!(
                    "Chunk size changed ({} -> {}), discarding old progress",
                    saved.chunk_size, chunk_size
                );
                self.store.clear_upload(remote_path).await?;
                UploadSession::new(remote_path, response.upload_id.clone(), chunk_size)
            }
            None => UploadSession::new(remote_path, response.upload_id.clone(), chunk_size),
        };
        self.store.save_upload(&session).await?;

        let already_uploaded: u64 = session
            .uploaded_parts
            .iter()
            .map(|&i| slice_len(i, chunk_size, file_size))
            .sum();
        self.emit(TransferEvent::UploadStarted {
            remote_path: remote_path.to_string(),
            total_bytes: file_size,
            already_uploaded,
        });

        let context = SliceContext {
            client: self.client.clone(),
            store: self.store.clone(),
            session: Arc::new(Mutex::new(session)),
            stop: Arc::new(AtomicBool::new(false)),
            event_tx: self.event_tx.clone(),
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            chunk_size,
            file_size,
        };

        let slices_sent = self
            .upload_slices(&context, &precreate, &digests, &needed, workers)
            .await?;

        let upload_id = context.session.lock().await.upload_id.clone();
        let created = self
            .client
            .create_file(&CreateRequest {
                remote_path: remote_path.to_string(),
                size: file_size,
                is_dir: false,
                upload_id,
                block_list: digests.block_list.clone(),
                rename,
            })
            .await?;
        self.store.clear_upload(remote_path).await?;

        info!("Upload complete: {} -> {}", local_path.display(), remote_path);
        self.emit(TransferEvent::UploadCompleted {
            remote_path: remote_path.to_string(),
        });

        Ok(UploadOutcome {
            remote_path: remote_path.to_string(),
            size: file_size,
            rapid: false,
            fs_id: Some(created.fs_id),
            slices_sent,
        })
    }

    /// Send outstanding slices in rounds until none are left.
    ///
    /// Returns the number of slices sent.
    async fn upload_slices(
        &self,
        context: &SliceContext,
        precreate: &PrecreateRequest,
        digests: &FileDigests,
        needed: &[usize],
        workers: usize,
    ) -> Result<usize, TransferError> {
        let max_rounds = self.settings.max_session_refreshes;
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut sent = 0usize;
        let mut rounds = 0u32;

        loop {
            let (outstanding, upload_id) = {
                let session = context.session.lock().await;
                (session.outstanding(needed), session.upload_id.clone())
            };
            if outstanding.is_empty() {
                if sent == 0 {
                    info!("All slices already uploaded, creating file");
                }
                return Ok(sent);
            }

            // New round: clear the stop flag left by the last one
            context.stop.store(false, Ordering::Release);
            let mut join_set = JoinSet::new();
            for index in outstanding {
                let context = context.clone();
                let semaphore = semaphore.clone();
                let upload_id = upload_id.clone();
                join_set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return (index, Err(TransferError::Join(e.to_string()))),
                    };
                    (index, context.send(index, &upload_id).await)
                });
            }

            let mut expired = false;
            let mut failed = 0usize;
            let mut fatal: Option<TransferError> = None;

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((_, Ok(true))) => sent += 1,
                    Ok((_, Ok(false))) => {}
                    Ok((index, Err(e))) if e.needs_new_session() => {
                        if !expired {
                            warn!("Upload session expired at slice {}: {}", index, e);
                        }
                        expired = true;
                        failed += 1;
                        context.stop.store(true, Ordering::Release);
                    }
                    Ok((index, Err(e))) if e.is_retryable() => {
                        warn!("Slice {} failed with connection error: {}", index, e);
                        failed += 1;
                    }
                    Ok((index, Err(e))) => {
                        error!("Slice {} failed: {}", index, e);
                        context.stop.store(true, Ordering::Release);
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        error!("Slice task panicked: {}", e);
                        context.stop.store(true, Ordering::Release);
                        fatal.get_or_insert(e.into());
                    }
                }
            }

            // Anything but expiry or a dropped connection ends the upload.
            // Finished slices are already persisted.
            if let Some(e) = fatal {
                return Err(e);
            }

            let (done, remaining) = {
                let session = context.session.lock().await;
                (session.uploaded_parts.len(), session.outstanding(needed).len())
            };
            if remaining == 0 {
                continue;
            }

            rounds += 1;
            if rounds > max_rounds {
                // Out of rounds, leave the session for the next run
                let session = context.session.lock().await;
                self.store.save_upload(&session).await?;
                return Err(TransferError::RefreshLimit {
                    rounds: max_rounds,
                    done,
                    total: digests.block_count(),
                });
            }

            warn!(
                "{} slices failed. Retrying... ({}/{} slices done, {} remaining)",
                failed,
                done,
                digests.block_count(),
                remaining
            );

            // Transient failures keep the same id
            if expired {
                self.refresh_session(context, precreate).await?;
            }
            self.emit(TransferEvent::SessionRefreshed {
                remote_path: context.remote_path.clone(),
                round: rounds,
            });
        }
    }

    /// Replace the upload id with a fresh one; keep the old id if that fails
    async fn refresh_session(
        &self,
        context: &SliceContext,
        precreate: &PrecreateRequest,
    ) -> Result<(), TransferError> {
        match self.client.precreate(precreate).await {
            Ok(response) if !response.upload_id.is_empty() => {
                let mut session = context.session.lock().await;
                session.upload_id = response.upload_id;
                self.store.save_upload(&session).await?;
                info!("New upload session obtained, continuing upload");
            }
            Ok(_) => warn!("Refresh returned no upload id, reusing old session"),
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => warn!("Failed to refresh session: {}, reusing old session", e),
        }
        Ok(())
    }
}
