//! Content digests for deduplicated upload
//!
//! The remote needs three MD5 values before it accepts an upload: the whole
//! file, its first 256 KiB, and one digest per slice. [`Digester`] produces all
//! three in a single read of the file and remembers the result keyed by path,
//! modification time, size and chunk size.

use crate::error::TransferError;
use md5::{Digest, Md5};
use pansync_types::FileDigests;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// Bytes covered by the slice digest
pub const SLICE_MD5_LEN: u64 = 256 * 1024;

pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Identity of a file state for which digests were computed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DigestKey {
    pub path: PathBuf,
    pub mtime_ns: u128,
    pub size: u64,
    pub chunk_size: u64,
}

impl DigestKey {
    /// Build the key for the file as it is on disk right now
    pub fn for_file(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let path = std::fs::canonicalize(path)?;
        let metadata = std::fs::metadata(&path)?;
        let mtime_ns = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self {
            path,
            mtime_ns,
            size: metadata.len(),
            chunk_size,
        })
    }

    /// Rendered as `path|mtime_ns|size|chunk`
    pub fn render(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.path.display(),
            self.mtime_ns,
            self.size,
            self.chunk_size
        )
    }
}

/// Storage for computed digests. Entries are never pruned.
pub trait DigestCache: Send + Sync + 'static {
    fn get(&self, key: &DigestKey) -> Option<FileDigests>;
    fn put(&self, key: &DigestKey, digests: &FileDigests) -> Result<(), TransferError>;
}

/// Process-local cache
#[derive(Debug, Default)]
pub struct MemoryDigestCache {
    entries: Mutex<HashMap<String, FileDigests>>,
}

impl MemoryDigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DigestCache for MemoryDigestCache {
    fn get(&self, key: &DigestKey) -> Option<FileDigests> {
        self.entries.lock().get(&key.render()).cloned()
    }

    fn put(&self, key: &DigestKey, digests: &FileDigests) -> Result<(), TransferError> {
        self.entries.lock().insert(key.render(), digests.clone());
        Ok(())
    }
}

/// Computes [`FileDigests`], consulting a [`DigestCache`] first
#[derive(Clone)]
pub struct Digester {
    cache: Arc<dyn DigestCache>,
    read_buffer: usize,
}

impl Digester {
    pub fn new(cache: Arc<dyn DigestCache>) -> Self {
        Self {
            cache,
            read_buffer: DEFAULT_READ_BUFFER,
        }
    }

    pub fn with_read_buffer(mut self, read_buffer: usize) -> Self {
        self.read_buffer = read_buffer.max(1);
        self
    }

    /// Digest `path` with slices of `chunk_size` bytes.
    ///
    /// With `use_cache`, a stored result for the same path, mtime, size and
    /// chunk size is returned without reading the file.
    pub async fn compute(
        &self,
        path: &Path,
        chunk_size: u64,
        use_cache: bool,
    ) -> Result<FileDigests, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidInput(
                "chunk size must be greater than zero".to_string(),
            ));
        }

        let cache = self.cache.clone();
        let read_buffer = self.read_buffer;
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<FileDigests, TransferError> {
            let key = DigestKey::for_file(&path, chunk_size)?;

            if use_cache {
                if let Some(hit) = cache.get(&key) {
                    debug!("Digest cache hit for {}", path.display());
                    return Ok(hit);
                }
            }

            info!(
                "Hashing {} ({} bytes, chunk {})",
                path.display(),
                key.size,
                chunk_size
            );
            let digests = hash_file(&path, chunk_size, read_buffer)?;
            cache.put(&key, &digests)?;
            Ok(digests)
        })
        .await?
    }
}

/// One pass over the file feeding three running MD5 states
fn hash_file(path: &Path, chunk_size: u64, read_buffer: usize) -> Result<FileDigests, TransferError> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; read_buffer];

    let mut whole = Md5::new();
    let mut head = Md5::new();
    let mut block = Md5::new();
    let mut block_list = Vec::new();
    let mut total = 0u64;
    let mut in_block = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut data = &buf[..n];
        whole.update(data);

        if total < SLICE_MD5_LEN {
            let take = (SLICE_MD5_LEN - total).min(data.len() as u64) as usize;
            head.update(&data[..take]);
        }
        total += n as u64;

        // a read may straddle one or more chunk boundaries
        while !data.is_empty() {
            let room = (chunk_size - in_block).min(data.len() as u64) as usize;
            block.update(&data[..room]);
            in_block += room as u64;
            data = &data[room..];
            if in_block == chunk_size {
                block_list.push(hex::encode(block.finalize_reset()));
                in_block = 0;
            }
        }
    }

    if in_block > 0 || block_list.is_empty() {
        block_list.push(hex::encode(block.finalize()));
    }

    Ok(FileDigests {
        content_md5: hex::encode(whole.finalize()),
        slice_md5: hex::encode(head.finalize()),
        block_list,
        file_size: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn digester() -> Digester {
        Digester::new(Arc::new(MemoryDigestCache::new()))
    }

    #[tokio::test]
    async fn test_block_count_matches_chunking() {
        let dir = tempfile::tempdir().unwrap();
        for (size, chunk, expected) in [(3000usize, 1024u64, 3usize), (2048, 1024, 2), (1, 1024, 1), (0, 1024, 1)] {
            let data = pattern(size);
            let path = write_file(dir.path(), &format!("f{}", size), &data);
            let digests = digester().compute(&path, chunk, false).await.unwrap();
            assert_eq!(digests.block_count(), expected, "size {}", size);
            assert_eq!(digests.file_size, size as u64);
        }
    }

    #[tokio::test]
    async fn test_digests_match_independent_hashes() {
        let dir = tempfile::tempdir().unwrap();
        // small read buffer so reads straddle chunk boundaries
        let data = pattern(300 * 1024 + 17);
        let path = write_file(dir.path(), "big.bin", &data);
        let chunk = 100 * 1024u64;

        let digests = digester()
            .with_read_buffer(7000)
            .compute(&path, chunk, false)
            .await
            .unwrap();

        assert_eq!(digests.content_md5, md5_hex(&data));
        assert_eq!(digests.slice_md5, md5_hex(&data[..SLICE_MD5_LEN as usize]));
        let expected: Vec<String> = data.chunks(chunk as usize).map(md5_hex).collect();
        assert_eq!(digests.block_list, expected);
    }

    #[tokio::test]
    async fn test_empty_file_has_single_empty_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty", b"");
        let digests = digester().compute(&path, 4096, false).await.unwrap();
        assert_eq!(digests.block_list, vec![EMPTY_MD5.to_string()]);
        assert_eq!(digests.content_md5, EMPTY_MD5);
        assert_eq!(digests.slice_md5, EMPTY_MD5);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello world");
        let cache = Arc::new(MemoryDigestCache::new());

        // seed a value no real hash would produce; a hit must return it verbatim
        let key = DigestKey::for_file(&path, 1024).unwrap();
        let planted = FileDigests {
            content_md5: "planted".into(),
            slice_md5: "planted".into(),
            block_list: vec!["planted".into()],
            file_size: 11,
        };
        cache.put(&key, &planted).unwrap();

        let digester = Digester::new(cache.clone());
        assert_eq!(digester.compute(&path, 1024, true).await.unwrap(), planted);

        // bypassing the cache reads the file and overwrites the entry
        let fresh = digester.compute(&path, 1024, false).await.unwrap();
        assert_eq!(fresh.content_md5, md5_hex(b"hello world"));
        assert_eq!(cache.get(&key).unwrap(), fresh);
    }

    #[tokio::test]
    async fn test_chunk_size_is_part_of_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.bin", &pattern(4096));
        let cache = Arc::new(MemoryDigestCache::new());
        let digester = Digester::new(cache.clone());

        let small = digester.compute(&path, 1024, true).await.unwrap();
        let large = digester.compute(&path, 4096, true).await.unwrap();
        assert_eq!(small.block_count(), 4);
        assert_eq!(large.block_count(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a", b"x");
        let err = digester().compute(&path, 0, true).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = digester()
            .compute(&dir.path().join("missing"), 1024, true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }

    #[test]
    fn test_key_rendering() {
        let key = DigestKey {
            path: PathBuf::from("/data/a.bin"),
            mtime_ns: 1_700_000_000_123,
            size: 42,
            chunk_size: 4096,
        };
        assert_eq!(key.render(), "/data/a.bin|1700000000123|42|4096");
    }
}
