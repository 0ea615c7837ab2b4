//! Shared types for pansync
//!
//! This crate contains the plain data structures passed between the
//! transfer engines, the persistence layer and the CLI.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

// ============================================================================
// Digest Types
// ============================================================================

/// The three digests the remote needs for a deduplicated upload.
///
/// All values are lowercase hex MD5 strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigests {
    /// Digest of the whole file
    pub content_md5: String,
    /// Digest of the first 256 KiB (or the whole file if shorter)
    pub slice_md5: String,
    /// One digest per chunk, in file order. Never empty.
    pub block_list: Vec<String>,
    pub file_size: u64,
}

impl FileDigests {
    pub fn block_count(&self) -> usize {
        self.block_list.len()
    }
}

// ============================================================================
// Upload Types
// ============================================================================

/// State of one upload in progress, persisted after every completed slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub remote_path: String,
    /// Opaque id issued by precreate. Replaced when the remote rejects it.
    pub upload_id: String,
    pub chunk_size: u64,
    /// Completed 0-based slice indices
    pub uploaded_parts: BTreeSet<usize>,
}

impl UploadSession {
    pub fn new(remote_path: impl Into<String>, upload_id: impl Into<String>, chunk_size: u64) -> Self {
        Self {
            remote_path: remote_path.into(),
            upload_id: upload_id.into(),
            chunk_size,
            uploaded_parts: BTreeSet::new(),
        }
    }

    /// Indices from `needed` that have not been uploaded yet, in ascending order
    pub fn outstanding(&self, needed: &[usize]) -> Vec<usize> {
        let mut parts: Vec<usize> = needed
            .iter()
            .copied()
            .filter(|i| !self.uploaded_parts.contains(i))
            .collect();
        parts.sort_unstable();
        parts.dedup();
        parts
    }
}

/// How the remote resolves a name collision on create
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenamePolicy {
    /// Fail if the path exists
    Fail,
    /// Always store under a new name
    Rename,
    /// Store under a new name only if the content differs
    RenameIfDifferent,
    #[default]
    Overwrite,
}

impl RenamePolicy {
    /// Numeric `rtype` value understood by the remote API
    pub fn rtype(self) -> u8 {
        match self {
            RenamePolicy::Fail => 0,
            RenamePolicy::Rename => 1,
            RenamePolicy::RenameIfDifferent => 2,
            RenamePolicy::Overwrite => 3,
        }
    }
}

// ============================================================================
// Download Types
// ============================================================================

/// A contiguous byte range of a segmented download. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self { index, start, end }
    }

    /// Number of bytes in this segment
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Split `[0, file_size)` into fixed-size segments; the last one may be shorter.
    ///
    /// Returns no segments for an empty file or a zero segment size.
    pub fn plan(file_size: u64, segment_size: u64) -> Vec<Segment> {
        if file_size == 0 || segment_size == 0 {
            return Vec::new();
        }

        let mut segments = Vec::with_capacity(file_size.div_ceil(segment_size) as usize);
        let mut offset = 0u64;
        let mut index = 0usize;
        while offset < file_size {
            let end = (offset + segment_size - 1).min(file_size - 1);
            segments.push(Segment::new(index, offset, end));
            offset = end + 1;
            index += 1;
        }
        segments
    }
}

/// Persisted progress of one segmented download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub remote_path: String,
    pub file_size: u64,
    pub segment_size: u64,
    pub completed_segments: BTreeSet<usize>,
}

impl DownloadSession {
    pub fn new(remote_path: impl Into<String>, file_size: u64, segment_size: u64) -> Self {
        Self {
            remote_path: remote_path.into(),
            file_size,
            segment_size,
            completed_segments: BTreeSet::new(),
        }
    }

    /// Ordered segments covering the whole file
    pub fn segments(&self) -> Vec<Segment> {
        Segment::plan(self.file_size, self.segment_size)
    }

    /// Segments that still need to be fetched
    pub fn pending(&self) -> Vec<Segment> {
        self.segments()
            .into_iter()
            .filter(|s| !self.completed_segments.contains(&s.index))
            .collect()
    }

    /// Bytes already covered by completed segments
    pub fn completed_bytes(&self) -> u64 {
        self.segments()
            .iter()
            .filter(|s| self.completed_segments.contains(&s.index))
            .map(Segment::size)
            .sum()
    }
}

/// Inclusive byte range for a ranged GET. An open `end` means "to EOF".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn segment(segment: &Segment) -> Self {
        Self {
            start: segment.start,
            end: Some(segment.end),
        }
    }

    /// Value for the HTTP `Range` header
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

// ============================================================================
// Remote Metadata Types
// ============================================================================

/// Metadata of a remote file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub fs_id: u64,
    /// Absolute remote path
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    /// Server modification time, unix seconds
    pub mtime: i64,
    #[serde(default)]
    pub md5: Option<String>,
}

impl RemoteFile {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.mtime, 0).single()
    }
}

/// Metadata of a local file found while walking a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time, unix seconds
    pub mtime: i64,
}

/// A remote file-manager request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileOperation {
    Copy {
        path: String,
        dest: String,
        newname: String,
    },
    Move {
        path: String,
        dest: String,
        newname: String,
    },
    Rename {
        path: String,
        newname: String,
    },
    Delete {
        paths: Vec<String>,
    },
}

impl FileOperation {
    /// Name of the operation as the remote API spells it
    pub fn opera(&self) -> &'static str {
        match self {
            FileOperation::Copy { .. } => "copy",
            FileOperation::Move { .. } => "move",
            FileOperation::Rename { .. } => "rename",
            FileOperation::Delete { .. } => "delete",
        }
    }
}

// ============================================================================
// Sync Types
// ============================================================================

/// Comparison of a local and a remote directory tree, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub local_only: BTreeSet<String>,
    pub remote_only: BTreeSet<String>,
    pub size_different: BTreeSet<String>,
    pub identical: BTreeSet<String>,
    pub local: BTreeMap<String, LocalEntry>,
    pub remote: BTreeMap<String, RemoteFile>,
}

impl DiffResult {
    /// Paths that sync-up has to upload
    pub fn to_upload(&self) -> Vec<String> {
        self.local_only
            .iter()
            .chain(self.size_different.iter())
            .cloned()
            .collect()
    }

    /// Paths that sync-down has to download
    pub fn to_download(&self) -> Vec<String> {
        self.remote_only
            .iter()
            .chain(self.size_different.iter())
            .cloned()
            .collect()
    }

    pub fn is_in_sync(&self) -> bool {
        self.local_only.is_empty() && self.remote_only.is_empty() && self.size_different.is_empty()
    }
}

/// A single file that could not be transferred or deleted during a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub path: String,
    pub error: String,
}

/// Outcome of a sync or tree transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub transferred: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Progress events emitted by the engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum TransferEvent {
    UploadStarted {
        remote_path: String,
        total_bytes: u64,
        already_uploaded: u64,
    },
    RapidUpload {
        remote_path: String,
    },
    SliceUploaded {
        remote_path: String,
        index: usize,
        bytes: u64,
    },
    SessionRefreshed {
        remote_path: String,
        round: u32,
    },
    UploadCompleted {
        remote_path: String,
    },
    DownloadStarted {
        remote_path: String,
        total_bytes: u64,
        already_downloaded: u64,
    },
    BytesDownloaded {
        remote_path: String,
        bytes: u64,
    },
    SegmentCompleted {
        remote_path: String,
        index: usize,
    },
    LinkRefreshed {
        remote_path: String,
        worker: usize,
    },
    DownloadCompleted {
        remote_path: String,
        local_path: PathBuf,
    },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings, stored as `config.json` in the config directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base slice size; scaled up in multiples of this for very large files
    pub upload_chunk_size: u64,
    /// Maximum number of slices the remote accepts for one file
    pub max_upload_slices: u64,
    /// Largest chunk size the remote documents; larger values only warn
    pub max_chunk_size_warning: u64,
    pub upload_workers: usize,
    pub download_workers: usize,
    pub download_segment_size: u64,
    /// Files larger than this use the segmented download path
    pub segmented_threshold: u64,
    /// Read buffer used while hashing
    pub hash_read_buffer: usize,
    /// Attempts made by the retry wrapper around idempotent remote calls
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Retry rounds an upload may spend refreshing its session
    pub max_session_refreshes: u32,
    /// Attempts per segment before a download gives up
    pub max_link_refreshes: u32,
    pub link_retry_backoff_ms: u64,
    /// Delay between download worker starts, multiplied by the worker id
    pub worker_stagger_ms: u64,
    /// Remote directories are resolved below this root
    pub remote_root: String,
    pub user_agent: String,
    pub rename_policy: RenamePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upload_chunk_size: 4 * 1024 * 1024,
            max_upload_slices: 2000,
            max_chunk_size_warning: 32 * 1024 * 1024,
            upload_workers: 8,
            download_workers: 32,
            download_segment_size: 4 * 1024 * 1024,
            segmented_threshold: 1024 * 1024,
            hash_read_buffer: 64 * 1024,
            max_retries: 3,
            retry_backoff_ms: 2000,
            max_session_refreshes: 20,
            max_link_refreshes: 5,
            link_retry_backoff_ms: 1000,
            worker_stagger_ms: 100,
            remote_root: "/apps/bypy".to_string(),
            user_agent: "pan.baidu.com".to_string(),
            rename_policy: RenamePolicy::Overwrite,
        }
    }
}

impl Settings {
    /// Resolve a user-supplied remote path below `remote_root`.
    ///
    /// Trailing slashes are removed; the root itself is returned for empty input.
    pub fn resolve_remote(&self, path: &str) -> String {
        let root = self.remote_root.trim_end_matches('/');
        let trimmed = path.trim_end_matches('/');
        let resolved = if trimmed == root || trimmed.starts_with(&format!("{}/", root)) {
            trimmed.to_string()
        } else if trimmed.is_empty() || trimmed == "/" {
            root.to_string()
        } else {
            format!("{}/{}", root, trimmed.trim_start_matches('/'))
        };
        if resolved.is_empty() {
            "/".to_string()
        } else {
            resolved
        }
    }
}
