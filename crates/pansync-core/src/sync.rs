//! Directory comparison and one-way sync
//!
//! Files are matched by path relative to the compared roots and considered
//! equal when their sizes are equal. Content is not compared.

use crate::engine::{relative_path, DownloadEngine, DownloadRequest, UploadEngine, SIDECAR_SUFFIX};
use crate::error::TransferError;
use crate::remote::RemoteClient;
use pansync_types::{DiffResult, FileOperation, LocalEntry, RemoteFile, Settings, SyncFailure, SyncReport};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Every regular file below `root`, keyed by `/`-separated relative path.
///
/// Symlinked files count as files; symlinked directories are not descended.
/// Download sidecars are skipped. A missing root yields an empty map.
pub async fn walk_local(root: &Path) -> Result<BTreeMap<String, LocalEntry>, TransferError> {
    let mut entries = BTreeMap::new();
    let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && prefix.is_empty() => {
                return Ok(entries);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push((entry.path(), rel));
            } else if file_type.is_file() || file_type.is_symlink() {
                if name.ends_with(SIDECAR_SUFFIX) {
                    continue;
                }
                // follows symlinks
                let metadata = match tokio::fs::metadata(entry.path()).await {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!("Skipping dangling symlink {}", entry.path().display());
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if !metadata.is_file() {
                    debug!("Skipping symlinked directory {}", entry.path().display());
                    continue;
                }
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                entries.insert(
                    rel,
                    LocalEntry {
                        path: entry.path(),
                        size: metadata.len(),
                        mtime,
                    },
                );
            }
        }
    }

    Ok(entries)
}

/// Partition two trees by key membership and size
pub fn diff_trees(
    local: BTreeMap<String, LocalEntry>,
    remote: BTreeMap<String, RemoteFile>,
) -> DiffResult {
    let mut diff = DiffResult::default();
    for (rel, entry) in &local {
        match remote.get(rel) {
            Some(file) if file.size == entry.size => {
                diff.identical.insert(rel.clone());
            }
            Some(_) => {
                diff.size_different.insert(rel.clone());
            }
            None => {
                diff.local_only.insert(rel.clone());
            }
        }
    }
    for rel in remote.keys() {
        if !local.contains_key(rel) {
            diff.remote_only.insert(rel.clone());
        }
    }
    diff.local = local;
    diff.remote = remote;
    diff
}

/// Drives the upload and download engines over whole directories
pub struct SyncEngine {
    client: Arc<dyn RemoteClient>,
    uploader: Arc<UploadEngine>,
    downloader: Arc<DownloadEngine>,
    settings: Settings,
}

impl SyncEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        uploader: Arc<UploadEngine>,
        downloader: Arc<DownloadEngine>,
        settings: Settings,
    ) -> Self {
        Self {
            client,
            uploader,
            downloader,
            settings,
        }
    }

    async fn walk_remote(&self, remote_dir: &str) -> Result<BTreeMap<String, RemoteFile>, TransferError> {
        let files = match self.client.list_recursive(remote_dir).await {
            Ok(files) => files,
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                // typically the directory does not exist yet
                info!("Remote dir {} not listed ({}), treating as empty", remote_dir, e);
                return Ok(BTreeMap::new());
            }
        };

        Ok(files
            .into_iter()
            .filter(|f| !f.is_dir)
            .filter_map(|f| relative_path(remote_dir, &f.path).map(|rel| (rel.to_string(), f.clone())))
            .collect())
    }

    /// Compare `local_dir` with `remote_dir` (resolved below the remote root)
    pub async fn compare(&self, local_dir: &Path, remote_dir: &str) -> Result<DiffResult, TransferError> {
        let remote_dir = self.settings.resolve_remote(remote_dir);
        let local = walk_local(local_dir).await?;
        let remote = self.walk_remote(&remote_dir).await?;
        let diff = diff_trees(local, remote);
        info!(
            "Compared {} with {}: {} local only, {} remote only, {} different, {} identical",
            local_dir.display(),
            remote_dir,
            diff.local_only.len(),
            diff.remote_only.len(),
            diff.size_different.len(),
            diff.identical.len()
        );
        Ok(diff)
    }

    /// Create a remote directory, ignoring everything but auth failures
    async fn ensure_remote_dir(&self, path: &str) -> Result<(), TransferError> {
        match self.client.mkdir(path).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                debug!("mkdir {} ignored: {}", path, e);
                Ok(())
            }
        }
    }

    async fn upload_entries(
        &self,
        remote_dir: &str,
        entries: Vec<(String, PathBuf)>,
        workers: usize,
        report: &mut SyncReport,
    ) -> Result<(), TransferError> {
        let mut created: HashSet<String> = HashSet::from([remote_dir.to_string()]);

        for (rel, local_path) in entries {
            let remote_path = format!("{}/{}", remote_dir, rel);
            if let Some((parent, _)) = remote_path.rsplit_once('/') {
                if created.insert(parent.to_string()) {
                    self.ensure_remote_dir(parent).await?;
                }
            }

            match self
                .uploader
                .upload_file(&local_path, &remote_path, workers, self.settings.rename_policy)
                .await
            {
                Ok(_) => {
                    info!("Uploaded: {}", rel);
                    report.transferred.push(rel);
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!("Failed to upload {}: {}", rel, e);
                    report.failures.push(SyncFailure {
                        path: rel,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Make `remote_dir` match `local_dir`
    pub async fn sync_up(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        delete_extra: bool,
        workers: usize,
    ) -> Result<SyncReport, TransferError> {
        let remote_dir = self.settings.resolve_remote(remote_dir);
        let diff = self.compare(local_dir, &remote_dir).await?;
        let mut report = SyncReport {
            unchanged: diff.identical.len(),
            ..Default::default()
        };

        self.ensure_remote_dir(&remote_dir).await?;

        let entries = diff
            .to_upload()
            .into_iter()
            .filter_map(|rel| diff.local.get(&rel).map(|e| (rel.clone(), e.path.clone())))
            .collect();
        self.upload_entries(&remote_dir, entries, workers, &mut report)
            .await?;

        if delete_extra {
            for rel in &diff.remote_only {
                let Some(file) = diff.remote.get(rel) else {
                    continue;
                };
                let operation = FileOperation::Delete {
                    paths: vec![file.path.clone()],
                };
                match self.client.file_manager(&operation).await {
                    Ok(()) => {
                        info!("Deleted remote: {}", rel);
                        report.deleted.push(rel.clone());
                    }
                    Err(e) if e.is_auth() => return Err(e),
                    Err(e) => {
                        warn!("Failed to delete remote {}: {}", rel, e);
                        report.failures.push(SyncFailure {
                            path: rel.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(report)
    }

    /// Make `local_dir` match `remote_dir`
    pub async fn sync_down(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        delete_extra: bool,
        workers: usize,
        force_segmented: bool,
    ) -> Result<SyncReport, TransferError> {
        let remote_dir = self.settings.resolve_remote(remote_dir);
        tokio::fs::create_dir_all(local_dir).await?;
        let diff = self.compare(local_dir, &remote_dir).await?;
        let mut report = SyncReport {
            unchanged: diff.identical.len(),
            ..Default::default()
        };

        for rel in diff.to_download() {
            let Some(file) = diff.remote.get(&rel) else {
                continue;
            };
            let request = DownloadRequest::new(file, local_dir.join(&rel), &self.settings)
                .workers(workers)
                .segmented(force_segmented);
            match self.downloader.download_file(&request).await {
                Ok(_) => {
                    info!("Downloaded: {}", rel);
                    report.transferred.push(rel);
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!("Failed to download {}: {}", rel, e);
                    report.failures.push(SyncFailure {
                        path: rel,
                        error: e.to_string(),
                    });
                }
            }
        }

        if delete_extra {
            for rel in &diff.local_only {
                let Some(entry) = diff.local.get(rel) else {
                    continue;
                };
                match tokio::fs::remove_file(&entry.path).await {
                    Ok(()) => {
                        info!("Deleted local: {}", rel);
                        report.deleted.push(rel.clone());
                    }
                    Err(e) => {
                        warn!("Failed to delete local {}: {}", rel, e);
                        report.failures.push(SyncFailure {
                            path: rel.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(report)
    }

    /// Upload every file below `local_dir`, whether or not it exists remotely
    pub async fn upload_dir(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        workers: usize,
    ) -> Result<SyncReport, TransferError> {
        let remote_dir = self.settings.resolve_remote(remote_dir);
        let local = walk_local(local_dir).await?;
        let mut report = SyncReport::default();

        self.ensure_remote_dir(&remote_dir).await?;
        let entries = local.into_iter().map(|(rel, e)| (rel, e.path)).collect();
        self.upload_entries(&remote_dir, entries, workers, &mut report)
            .await?;
        Ok(report)
    }

    /// Download every file below `remote_dir` into `local_dir`
    pub async fn download_dir(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        workers: usize,
        force_segmented: bool,
    ) -> Result<SyncReport, TransferError> {
        let remote_dir = self.settings.resolve_remote(remote_dir);
        self.downloader
            .download_dir(&remote_dir, local_dir, workers, force_segmented)
            .await
    }
}
