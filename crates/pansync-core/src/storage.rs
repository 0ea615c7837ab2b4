//! Storage layer for the on-disk digest cache (progress lives in SQLite)

use crate::digest::{DigestCache, DigestKey};
use crate::error::TransferError;
use pansync_types::FileDigests;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Digest cache persisted as a single JSON object, key → digests
#[derive(Debug)]
pub struct JsonDigestCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, FileDigests>>,
}

impl JsonDigestCache {
    /// Open the cache file, starting empty if it is missing or unreadable
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Ignoring corrupt digest cache {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded {} digest cache entries", entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // Written to a sibling temp file and renamed so readers never see half a file
    fn flush(&self, entries: &HashMap<String, FileDigests>) -> Result<(), TransferError> {
        let content = serde_json::to_string(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl DigestCache for JsonDigestCache {
    fn get(&self, key: &DigestKey) -> Option<FileDigests> {
        self.entries.lock().get(&key.render()).cloned()
    }

    fn put(&self, key: &DigestKey, digests: &FileDigests) -> Result<(), TransferError> {
        let mut entries = self.entries.lock();
        entries.insert(key.render(), digests.clone());
        self.flush(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> DigestKey {
        DigestKey {
            path: PathBuf::from(format!("/data/{}", name)),
            mtime_ns: 1,
            size: 3,
            chunk_size: 4,
        }
    }

    fn digests(tag: &str) -> FileDigests {
        FileDigests {
            content_md5: tag.into(),
            slice_md5: tag.into(),
            block_list: vec![tag.into()],
            file_size: 3,
        }
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hash_cache.json");

        let cache = JsonDigestCache::open(&path).unwrap();
        cache.put(&key("a"), &digests("aa")).unwrap();
        cache.put(&key("b"), &digests("bb")).unwrap();
        drop(cache);

        let reopened = JsonDigestCache::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(&key("a")).unwrap().content_md5, "aa");
        assert!(reopened.get(&key("c")).is_none());
    }

    #[test]
    fn test_stale_key_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonDigestCache::open(dir.path().join("c.json")).unwrap();
        cache.put(&key("a"), &digests("aa")).unwrap();

        let mut touched = key("a");
        touched.mtime_ns = 2;
        assert!(cache.get(&touched).is_none());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hash_cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let cache = JsonDigestCache::open(&path).unwrap();
        assert!(cache.is_empty());
        cache.put(&key("a"), &digests("aa")).unwrap();
        assert_eq!(JsonDigestCache::open(&path).unwrap().len(), 1);
    }
}
