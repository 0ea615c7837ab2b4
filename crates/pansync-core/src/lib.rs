//! pansync core - transfer engine
//!
//! Resumable chunked uploads, segmented downloads and directory sync against
//! a chunked-upload / ranged-download storage API.

mod client;
mod config;
mod digest;
mod engine;
mod error;
mod remote;
mod retry;
mod storage;
mod sync;

#[cfg(test)]
mod testing;

pub use client::*;
pub use config::*;
pub use digest::*;
pub use engine::*;
pub use error::*;
pub use remote::*;
pub use retry::*;
pub use storage::*;
pub use sync::*;

use pansync_types::{
    DiffResult, FileOperation, RemoteFile, Settings, SyncReport, TransferEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Split `/a/b/c` into (`/a/b`, `c`). The parent of a top-level entry is `/`.
fn split_remote(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.trim_end_matches('/').rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

/// The main pansync instance: one client, one set of stores, all engines
pub struct Pansync {
    client: Arc<dyn RemoteClient>,
    settings: Settings,
    uploader: Arc<UploadEngine>,
    downloader: Arc<DownloadEngine>,
    sync: SyncEngine,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl Pansync {
    /// Open the stores under `paths` and connect through the HTTP client
    pub async fn open(
        paths: &ConfigPaths,
        settings: Settings,
        token: Arc<dyn TokenProvider>,
    ) -> Result<Self, TransferError> {
        paths.ensure_root()?;
        let http = PanClient::new(token, &settings)?;
        let client = Arc::new(RetryingClient::new(http, RetryPolicy::from_settings(&settings)));
        let digest_cache = Arc::new(JsonDigestCache::open(paths.hash_cache_file())?);
        let store = Arc::new(SqliteProgressStore::new(paths.progress_db()).await?);
        info!("pansync ready (config in {})", paths.root().display());
        Ok(Self::with_parts(client, digest_cache, store, settings))
    }

    /// Assemble an instance from already-built parts
    pub fn with_parts(
        client: Arc<dyn RemoteClient>,
        digest_cache: Arc<dyn DigestCache>,
        store: Arc<dyn ProgressStore>,
        settings: Settings,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        let digester = Digester::new(digest_cache).with_read_buffer(settings.hash_read_buffer);
        let uploader = Arc::new(UploadEngine::new(
            client.clone(),
            digester,
            store.clone(),
            settings.clone(),
            event_tx.clone(),
        ));
        let downloader = Arc::new(DownloadEngine::new(
            client.clone(),
            store,
            settings.clone(),
            event_tx.clone(),
        ));
        let sync = SyncEngine::new(
            client.clone(),
            uploader.clone(),
            downloader.clone(),
            settings.clone(),
        );
        Self {
            client,
            settings,
            uploader,
            downloader,
            sync,
            event_tx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Resolve a user-supplied remote path below the configured root
    pub fn resolve(&self, remote: &str) -> String {
        self.settings.resolve_remote(remote)
    }

    fn upload_workers(&self, workers: Option<usize>) -> usize {
        workers.unwrap_or(self.settings.upload_workers).max(1)
    }

    fn download_workers(&self, workers: Option<usize>) -> usize {
        workers.unwrap_or(self.settings.download_workers).max(1)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Upload one file. A remote path ending in `/` receives the local file name.
    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        workers: Option<usize>,
    ) -> Result<UploadOutcome, TransferError> {
        let mut remote_path = self.resolve(remote);
        if remote.ends_with('/') || remote.is_empty() {
            let name = local
                .file_name()
                .ok_or_else(|| {
                    TransferError::InvalidInput(format!("{} has no file name", local.display()))
                })?
                .to_string_lossy();
            remote_path = format!("{}/{}", remote_path.trim_end_matches('/'), name);
        }
        self.uploader
            .upload_file(
                local,
                &remote_path,
                self.upload_workers(workers),
                self.settings.rename_policy,
            )
            .await
    }

    /// Metadata of one remote entry, looked up in its parent's listing
    pub async fn stat(&self, remote: &str) -> Result<RemoteFile, TransferError> {
        let path = self.resolve(remote);
        let (parent, _) = split_remote(&path)
            .ok_or_else(|| TransferError::InvalidInput(format!("{} has no parent", path)))?;
        self.client
            .list_dir(parent)
            .await?
            .into_iter()
            .find(|f| f.path == path)
            .ok_or_else(|| TransferError::InvalidInput(format!("{} does not exist", path)))
    }

    /// Download one file. An existing local directory receives the remote name.
    pub async fn download(
        &self,
        remote: &str,
        local: &Path,
        workers: Option<usize>,
        force_segmented: bool,
    ) -> Result<PathBuf, TransferError> {
        let file = self.stat(remote).await?;
        if file.is_dir {
            return Err(TransferError::InvalidInput(format!(
                "{} is a directory",
                file.path
            )));
        }
        let local_path = if local.is_dir() {
            local.join(file.name())
        } else {
            local.to_path_buf()
        };
        let request = DownloadRequest::new(&file, local_path, &self.settings)
            .workers(self.download_workers(workers))
            .segmented(force_segmented);
        self.downloader.download_file(&request).await
    }

    pub async fn upload_dir(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        workers: Option<usize>,
    ) -> Result<SyncReport, TransferError> {
        self.sync
            .upload_dir(local_dir, remote_dir, self.upload_workers(workers))
            .await
    }

    pub async fn download_dir(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        workers: Option<usize>,
        force_segmented: bool,
    ) -> Result<SyncReport, TransferError> {
        self.sync
            .download_dir(
                remote_dir,
                local_dir,
                self.download_workers(workers),
                force_segmented,
            )
            .await
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub async fn compare(&self, local_dir: &Path, remote_dir: &str) -> Result<DiffResult, TransferError> {
        self.sync.compare(local_dir, remote_dir).await
    }

    pub async fn sync_up(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        delete_extra: bool,
        workers: Option<usize>,
    ) -> Result<SyncReport, TransferError> {
        self.sync
            .sync_up(local_dir, remote_dir, delete_extra, self.upload_workers(workers))
            .await
    }

    pub async fn sync_down(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        delete_extra: bool,
        workers: Option<usize>,
        force_segmented: bool,
    ) -> Result<SyncReport, TransferError> {
        self.sync
            .sync_down(
                remote_dir,
                local_dir,
                delete_extra,
                self.download_workers(workers),
                force_segmented,
            )
            .await
    }

    // ========================================================================
    // Remote file management
    // ========================================================================

    pub async fn list(&self, remote: &str, recursive: bool) -> Result<Vec<RemoteFile>, TransferError> {
        let dir = self.resolve(remote);
        if recursive {
            self.client.list_recursive(&dir).await
        } else {
            self.client.list_dir(&dir).await
        }
    }

    pub async fn search(&self, key: &str, dir: Option<&str>) -> Result<Vec<RemoteFile>, TransferError> {
        let dir = dir.map(|d| self.resolve(d));
        self.client.search(key, dir.as_deref()).await
    }

    pub async fn mkdir(&self, remote: &str) -> Result<RemoteFile, TransferError> {
        self.client.mkdir(&self.resolve(remote)).await
    }

    pub async fn delete(&self, remotes: &[String]) -> Result<(), TransferError> {
        let paths = remotes.iter().map(|r| self.resolve(r)).collect();
        self.client
            .file_manager(&FileOperation::Delete { paths })
            .await
    }

    fn relocation(&self, src: &str, dst: &str) -> Result<(String, String, String), TransferError> {
        let dst = self.resolve(dst);
        let (dest, newname) = split_remote(&dst)
            .ok_or_else(|| TransferError::InvalidInput(format!("bad destination {}", dst)))?;
        Ok((self.resolve(src), dest.to_string(), newname.to_string()))
    }

    pub async fn move_to(&self, src: &str, dst: &str) -> Result<(), TransferError> {
        let (path, dest, newname) = self.relocation(src, dst)?;
        self.client
            .file_manager(&FileOperation::Move {
                path,
                dest,
                newname,
            })
            .await
    }

    pub async fn copy_to(&self, src: &str, dst: &str) -> Result<(), TransferError> {
        let (path, dest, newname) = self.relocation(src, dst)?;
        self.client
            .file_manager(&FileOperation::Copy {
                path,
                dest,
                newname,
            })
            .await
    }

    pub async fn rename(&self, remote: &str, newname: &str) -> Result<(), TransferError> {
        if newname.is_empty() || newname.contains('/') {
            return Err(TransferError::InvalidInput(format!(
                "invalid new name {:?}",
                newname
            )));
        }
        self.client
            .file_manager(&FileOperation::Rename {
                path: self.resolve(remote),
                newname: newname.to_string(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    fn pansync(fake: &FakeRemote) -> Pansync {
        let settings = Settings {
            upload_chunk_size: 1024,
            worker_stagger_ms: 0,
            link_retry_backoff_ms: 0,
            ..Settings::default()
        };
        Pansync::with_parts(
            Arc::new(fake.clone()),
            Arc::new(MemoryDigestCache::new()),
            Arc::new(MemoryProgressStore::new()),
            settings,
        )
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(split_remote("/apps/bypy/a.txt"), Some(("/apps/bypy", "a.txt")));
        assert_eq!(split_remote("/top"), Some(("/", "top")));
        assert_eq!(split_remote("/apps/bypy/d/"), Some(("/apps/bypy", "d")));
        assert_eq!(split_remote("/"), None);
    }

    #[tokio::test]
    async fn test_upload_into_directory_uses_local_name() {
        let fake = FakeRemote::new();
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report.pdf");
        std::fs::write(&local, b"pdf bytes").unwrap();

        let outcome = pansync(&fake).upload(&local, "docs/", None).await.unwrap();
        assert_eq!(outcome.remote_path, "/apps/bypy/docs/report.pdf");
        assert_eq!(
            fake.content("/apps/bypy/docs/report.pdf").unwrap().as_ref(),
            b"pdf bytes"
        );
    }

    #[tokio::test]
    async fn test_download_by_path_into_directory() {
        let fake = FakeRemote::new();
        fake.add_file("/apps/bypy/music/song.mp3", vec![7u8; 3000]);
        let dir = tempfile::tempdir().unwrap();

        let path = pansync(&fake)
            .download("music/song.mp3", dir.path(), Some(2), true)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("song.mp3"));
        assert_eq!(std::fs::read(path).unwrap(), vec![7u8; 3000]);
    }

    #[tokio::test]
    async fn test_stat_missing_and_directory() {
        let fake = FakeRemote::new();
        fake.add_file("/apps/bypy/d/inner.txt", vec![1u8; 4]);
        let core = pansync(&fake);

        assert!(matches!(
            core.stat("nope.txt").await,
            Err(TransferError::InvalidInput(_))
        ));
        assert!(core.stat("d").await.unwrap().is_dir);
        let dir = tempfile::tempdir().unwrap();
        assert!(core.download("d", dir.path(), None, false).await.is_err());
    }

    #[tokio::test]
    async fn test_file_management_resolves_paths() {
        let fake = FakeRemote::new();
        fake.add_file("/apps/bypy/a.txt", vec![1u8; 4]);
        let core = pansync(&fake);

        core.copy_to("a.txt", "backup/b.txt").await.unwrap();
        core.move_to("a.txt", "c.txt").await.unwrap();
        core.rename("c.txt", "d.txt").await.unwrap();
        core.delete(&["backup/b.txt".to_string()]).await.unwrap();

        assert!(fake.has_file("/apps/bypy/d.txt"));
        assert!(!fake.has_file("/apps/bypy/a.txt"));
        assert!(!fake.has_file("/apps/bypy/backup/b.txt"));
        assert_eq!(
            fake.file_ops()[0],
            FileOperation::Copy {
                path: "/apps/bypy/a.txt".into(),
                dest: "/apps/bypy/backup".into(),
                newname: "b.txt".into(),
            }
        );
        assert!(core.rename("d.txt", "x/y").await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_search() {
        let fake = FakeRemote::new();
        fake.add_file("/apps/bypy/x/one.log", vec![0u8; 1]);
        fake.add_file("/apps/bypy/x/sub/two.log", vec![0u8; 2]);
        fake.add_file("/apps/bypy/y/three.txt", vec![0u8; 3]);
        let core = pansync(&fake);

        let flat = core.list("x", false).await.unwrap();
        assert_eq!(flat.len(), 2);
        assert_eq!(core.list("x", true).await.unwrap().len(), 2);
        assert_eq!(core.search("log", None).await.unwrap().len(), 2);
        assert_eq!(core.search("log", Some("y")).await.unwrap().len(), 0);

        let made = core.mkdir("z").await.unwrap();
        assert_eq!(made.path, "/apps/bypy/z");
    }
}
