//! In-memory [`RemoteClient`] that records every call, for engine tests

use crate::error::TransferError;
use crate::remote::{
    ByteStream, CreateRequest, PrecreateRequest, PrecreateResponse, RemoteClient,
    RAPID_UPLOAD_RETURN_TYPE,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use pansync_types::{ByteRange, FileOperation, RemoteFile};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Bytes per item of a fake download stream
const STREAM_CHUNK: usize = 700;

type SliceFailure = Box<dyn Fn(usize) -> Option<TransferError> + Send + Sync>;
type DownloadFailure = Box<dyn Fn(&str, Option<ByteRange>) -> Option<TransferError> + Send + Sync>;
type ListingFailure = Box<dyn Fn() -> TransferError + Send + Sync>;

#[derive(Default)]
struct State {
    files: BTreeMap<String, (RemoteFile, Bytes)>,
    dirs: BTreeSet<String>,
    next_fs_id: u64,
    next_upload_id: u64,

    rapid: bool,
    needed: Option<Vec<usize>>,
    fail_precreate_after: Option<usize>,
    precreates: Vec<PrecreateRequest>,
    issued_upload_ids: Vec<String>,

    slice_attempts: usize,
    // remote path -> part index -> data, consumed by create
    slices: BTreeMap<String, BTreeMap<usize, Bytes>>,
    accepted: BTreeMap<String, BTreeSet<usize>>,
    creates: Vec<CreateRequest>,

    link_calls: usize,
    stream_calls: Vec<Option<ByteRange>>,

    list_calls: usize,
    listing_failures_left: usize,
    file_ops: Vec<FileOperation>,
    mkdirs: Vec<String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    slice_failure: Mutex<Option<SliceFailure>>,
    download_failure: Mutex<Option<DownloadFailure>>,
    listing_failure: Mutex<Option<ListingFailure>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeRemote {
    inner: Arc<Inner>,
}

impl FakeRemote {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.inner.state.lock().next_fs_id = 1000;
        fake
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    pub fn add_file(&self, path: &str, data: impl Into<Bytes>) -> RemoteFile {
        let data = data.into();
        let mut state = self.inner.state.lock();
        state.next_fs_id += 1;
        let file = RemoteFile {
            fs_id: state.next_fs_id,
            path: path.to_string(),
            size: data.len() as u64,
            is_dir: false,
            mtime: 1_700_000_000,
            md5: None,
        };
        state.files.insert(path.to_string(), (file.clone(), data));
        file
    }

    pub fn add_dir(&self, path: &str) {
        self.inner.state.lock().dirs.insert(path.to_string());
    }

    /// Every following precreate reports the content as already stored
    pub fn set_rapid(&self, rapid: bool) {
        self.inner.state.lock().rapid = rapid;
    }

    /// Slice indices precreate reports as needed
    pub fn set_needed(&self, needed: Vec<usize>) {
        self.inner.state.lock().needed = Some(needed);
    }

    /// Precreate calls after the first `n` fail with a remote error
    pub fn fail_precreate_after(&self, n: usize) {
        self.inner.state.lock().fail_precreate_after = Some(n);
    }

    pub fn fail_slices_with(
        &self,
        f: impl Fn(usize) -> Option<TransferError> + Send + Sync + 'static,
    ) {
        *self.inner.slice_failure.lock() = Some(Box::new(f));
    }

    pub fn fail_downloads_with(
        &self,
        f: impl Fn(&str, Option<ByteRange>) -> Option<TransferError> + Send + Sync + 'static,
    ) {
        *self.inner.download_failure.lock() = Some(Box::new(f));
    }

    /// The next `n` recursive listings fail with a transient error
    pub fn fail_listing_times(&self, n: usize) {
        self.inner.state.lock().listing_failures_left = n;
    }

    /// Every recursive listing fails with the produced error
    pub fn fail_listing_with(&self, f: impl Fn() -> TransferError + Send + Sync + 'static) {
        *self.inner.listing_failure.lock() = Some(Box::new(f));
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn precreate_calls(&self) -> usize {
        self.inner.state.lock().precreates.len()
    }

    pub fn issued_upload_ids(&self) -> Vec<String> {
        self.inner.state.lock().issued_upload_ids.clone()
    }

    pub fn slice_attempts(&self) -> usize {
        self.inner.state.lock().slice_attempts
    }

    /// Every index accepted for `remote_path`, across sessions
    pub fn uploaded_parts(&self, remote_path: &str) -> BTreeSet<usize> {
        self.inner
            .state
            .lock()
            .accepted
            .get(remote_path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn creates(&self) -> Vec<CreateRequest> {
        self.inner.state.lock().creates.clone()
    }

    pub fn link_calls(&self) -> usize {
        self.inner.state.lock().link_calls
    }

    pub fn stream_calls(&self) -> Vec<Option<ByteRange>> {
        self.inner.state.lock().stream_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.inner.state.lock().list_calls
    }

    pub fn file_ops(&self) -> Vec<FileOperation> {
        self.inner.state.lock().file_ops.clone()
    }

    pub fn mkdirs(&self) -> Vec<String> {
        self.inner.state.lock().mkdirs.clone()
    }

    pub fn content(&self, path: &str) -> Option<Bytes> {
        self.inner
            .state
            .lock()
            .files
            .get(path)
            .map(|(_, data)| data.clone())
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.inner.state.lock().files.contains_key(path)
    }
}

fn fs_id_from_link(url: &str) -> Option<u64> {
    url.strip_prefix("fake://")?.split('/').next()?.parse().ok()
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn precreate(&self, request: &PrecreateRequest) -> Result<PrecreateResponse, TransferError> {
        let mut state = self.inner.state.lock();
        state.precreates.push(request.clone());

        if let Some(limit) = state.fail_precreate_after {
            if state.precreates.len() > limit {
                return Err(TransferError::remote(31299, "precreate refused"));
            }
        }

        if state.rapid {
            return Ok(PrecreateResponse {
                return_type: RAPID_UPLOAD_RETURN_TYPE,
                upload_id: String::new(),
                block_list: Vec::new(),
            });
        }

        state.next_upload_id += 1;
        let upload_id = format!("up-{}", state.next_upload_id);
        state.issued_upload_ids.push(upload_id.clone());
        Ok(PrecreateResponse {
            return_type: 1,
            upload_id,
            block_list: state.needed.clone().unwrap_or_default(),
        })
    }

    async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        part_index: usize,
        data: Bytes,
    ) -> Result<(), TransferError> {
        self.inner.state.lock().slice_attempts += 1;

        if let Some(fail) = self.inner.slice_failure.lock().as_ref() {
            if let Some(error) = fail(part_index) {
                return Err(error);
            }
        }

        if upload_id.is_empty() {
            return Err(TransferError::SessionExpired("missing upload id".to_string()));
        }
        let mut state = self.inner.state.lock();
        state
            .slices
            .entry(remote_path.to_string())
            .or_default()
            .insert(part_index, data);
        state
            .accepted
            .entry(remote_path.to_string())
            .or_default()
            .insert(part_index);
        Ok(())
    }

    async fn create_file(&self, request: &CreateRequest) -> Result<RemoteFile, TransferError> {
        let mut state = self.inner.state.lock();
        state.creates.push(request.clone());

        let parts = state.slices.remove(&request.remote_path).unwrap_or_default();
        let mut content = Vec::with_capacity(request.size as usize);
        for data in parts.into_values() {
            content.extend_from_slice(&data);
        }

        state.next_fs_id += 1;
        let file = RemoteFile {
            fs_id: state.next_fs_id,
            path: request.remote_path.clone(),
            size: request.size,
            is_dir: false,
            mtime: 1_700_000_000,
            md5: None,
        };
        state
            .files
            .insert(request.remote_path.clone(), (file.clone(), Bytes::from(content)));
        Ok(file)
    }

    async fn get_download_link(&self, fs_id: u64) -> Result<String, TransferError> {
        let mut state = self.inner.state.lock();
        state.link_calls += 1;
        if !state.files.values().any(|(f, _)| f.fs_id == fs_id) {
            return Err(TransferError::remote(-1, format!("No dlink for fs_id={}", fs_id)));
        }
        Ok(format!("fake://{}/{}", fs_id, state.link_calls))
    }

    async fn stream_download(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, TransferError> {
        self.inner.state.lock().stream_calls.push(range);

        if let Some(fail) = self.inner.download_failure.lock().as_ref() {
            if let Some(error) = fail(url, range) {
                return Err(error);
            }
        }

        let fs_id = fs_id_from_link(url)
            .ok_or_else(|| TransferError::InvalidInput(format!("bad link {}", url)))?;
        let data = self
            .inner
            .state
            .lock()
            .files
            .values()
            .find(|(f, _)| f.fs_id == fs_id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| TransferError::SessionExpired("link revoked".to_string()))?;

        let len = data.len() as u64;
        let (start, end) = match range {
            Some(r) => (r.start.min(len), r.end.map(|e| (e + 1).min(len)).unwrap_or(len)),
            None => (0, len),
        };
        let body = data.slice(start as usize..end as usize);

        let chunks: Vec<Result<Bytes, TransferError>> = (0..body.len())
            .step_by(STREAM_CHUNK)
            .map(|offset| Ok(body.slice(offset..(offset + STREAM_CHUNK).min(body.len()))))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn list_recursive(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        {
            let mut state = self.inner.state.lock();
            state.list_calls += 1;
            if state.listing_failures_left > 0 {
                state.listing_failures_left -= 1;
                return Err(TransferError::TransientNetwork("listing reset".to_string()));
            }
        }
        if let Some(fail) = self.inner.listing_failure.lock().as_ref() {
            return Err(fail());
        }

        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(self
            .inner
            .state
            .lock()
            .files
            .values()
            .filter(|(f, _)| f.path.starts_with(&prefix))
            .map(|(f, _)| f.clone())
            .collect())
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let state = self.inner.state.lock();
        let mut children = BTreeMap::new();

        for (file, _) in state.files.values() {
            let Some(rest) = file.path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => {
                    children.insert(file.path.clone(), file.clone());
                }
                Some((child, _)) => {
                    let path = format!("{}{}", prefix, child);
                    children.entry(path.clone()).or_insert(RemoteFile {
                        fs_id: 0,
                        path,
                        size: 0,
                        is_dir: true,
                        mtime: 0,
                        md5: None,
                    });
                }
            }
        }
        for dir_path in &state.dirs {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    children.entry(dir_path.clone()).or_insert(RemoteFile {
                        fs_id: 0,
                        path: dir_path.clone(),
                        size: 0,
                        is_dir: true,
                        mtime: 0,
                        md5: None,
                    });
                }
            }
        }
        Ok(children.into_values().collect())
    }

    async fn search(&self, key: &str, dir: Option<&str>) -> Result<Vec<RemoteFile>, TransferError> {
        let state = self.inner.state.lock();
        Ok(state
            .files
            .values()
            .map(|(f, _)| f)
            .filter(|f| f.name().contains(key))
            .filter(|f| dir.map(|d| f.path.starts_with(&format!("{}/", d))).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn file_manager(&self, operation: &FileOperation) -> Result<(), TransferError> {
        let mut state = self.inner.state.lock();
        state.file_ops.push(operation.clone());

        match operation {
            FileOperation::Delete { paths } => {
                for path in paths {
                    let nested = format!("{}/", path);
                    state
                        .files
                        .retain(|p, _| p != path && !p.starts_with(&nested));
                }
            }
            FileOperation::Rename { path, newname } => {
                if let Some((mut file, data)) = state.files.remove(path) {
                    let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                    file.path = format!("{}/{}", parent, newname);
                    state.files.insert(file.path.clone(), (file, data));
                }
            }
            FileOperation::Move {
                path,
                dest,
                newname,
            } => {
                if let Some((mut file, data)) = state.files.remove(path) {
                    file.path = format!("{}/{}", dest, newname);
                    state.files.insert(file.path.clone(), (file, data));
                }
            }
            FileOperation::Copy {
                path,
                dest,
                newname,
            } => {
                if let Some((file, data)) = state.files.get(path).cloned() {
                    state.next_fs_id += 1;
                    let copy = RemoteFile {
                        fs_id: state.next_fs_id,
                        path: format!("{}/{}", dest, newname),
                        ..file
                    };
                    state.files.insert(copy.path.clone(), (copy, data));
                }
            }
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<RemoteFile, TransferError> {
        let mut state = self.inner.state.lock();
        state.mkdirs.push(path.to_string());
        state.dirs.insert(path.to_string());
        Ok(RemoteFile {
            fs_id: 0,
            path: path.to_string(),
            size: 0,
            is_dir: true,
            mtime: 0,
            md5: None,
        })
    }
}
