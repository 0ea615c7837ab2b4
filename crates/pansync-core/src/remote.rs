//! Remote service seam
//!
//! The engines talk to the storage service only through [`RemoteClient`].
//! `PanClient` is the HTTP implementation; tests use an in-memory fake.

use crate::error::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use pansync_types::{ByteRange, FileOperation, RemoteFile, RenamePolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Body of a download response, chunk by chunk
pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// `return_type` value telling the client the content already exists remotely
pub const RAPID_UPLOAD_RETURN_TYPE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecreateRequest {
    pub remote_path: String,
    pub size: u64,
    pub is_dir: bool,
    pub block_list: Vec<String>,
    pub content_md5: String,
    pub slice_md5: String,
    pub rename: RenamePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrecreateResponse {
    pub return_type: i32,
    pub upload_id: String,
    /// Slice indices the server still needs. Empty means "all of them".
    pub block_list: Vec<usize>,
}

impl PrecreateResponse {
    pub fn is_rapid(&self) -> bool {
        self.return_type == RAPID_UPLOAD_RETURN_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub remote_path: String,
    pub size: u64,
    pub is_dir: bool,
    pub upload_id: String,
    pub block_list: Vec<String>,
    pub rename: RenamePolicy,
}

/// Operations the transfer engines need from the storage service
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    /// Announce an upload and learn which slices are needed
    async fn precreate(&self, request: &PrecreateRequest) -> Result<PrecreateResponse, TransferError>;

    /// Send slice `part_index`. A rejected session yields `SessionExpired`.
    async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        part_index: usize,
        data: Bytes,
    ) -> Result<(), TransferError>;

    /// Assemble the uploaded slices into the final file
    async fn create_file(&self, request: &CreateRequest) -> Result<RemoteFile, TransferError>;

    /// Fetch a fresh, short-lived download URL for a file
    async fn get_download_link(&self, fs_id: u64) -> Result<String, TransferError>;

    /// Open a (ranged) GET on a download URL. A revoked link yields `SessionExpired`.
    async fn stream_download(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, TransferError>;

    /// Every file below `dir`, at any depth. Directories are omitted.
    async fn list_recursive(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError>;

    /// Direct children of `dir`, files and directories
    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError>;

    async fn search(&self, key: &str, dir: Option<&str>) -> Result<Vec<RemoteFile>, TransferError>;

    async fn file_manager(&self, operation: &FileOperation) -> Result<(), TransferError>;

    async fn mkdir(&self, path: &str) -> Result<RemoteFile, TransferError>;
}

#[async_trait]
impl<T: RemoteClient + ?Sized> RemoteClient for Arc<T> {
    async fn precreate(&self, request: &PrecreateRequest) -> Result<PrecreateResponse, TransferError> {
        (**self).precreate(request).await
    }

    async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        part_index: usize,
        data: Bytes,
    ) -> Result<(), TransferError> {
        (**self).upload_slice(upload_id, remote_path, part_index, data).await
    }

    async fn create_file(&self, request: &CreateRequest) -> Result<RemoteFile, TransferError> {
        (**self).create_file(request).await
    }

    async fn get_download_link(&self, fs_id: u64) -> Result<String, TransferError> {
        (**self).get_download_link(fs_id).await
    }

    async fn stream_download(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream, TransferError> {
        (**self).stream_download(url, range).await
    }

    async fn list_recursive(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        (**self).list_recursive(dir).await
    }

    async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteFile>, TransferError> {
        (**self).list_dir(dir).await
    }

    async fn search(&self, key: &str, dir: Option<&str>) -> Result<Vec<RemoteFile>, TransferError> {
        (**self).search(key, dir).await
    }

    async fn file_manager(&self, operation: &FileOperation) -> Result<(), TransferError> {
        (**self).file_manager(operation).await
    }

    async fn mkdir(&self, path: &str) -> Result<RemoteFile, TransferError> {
        (**self).mkdir(path).await
    }
}

// ============================================================================
// Tokens
// ============================================================================

/// Source of the access token attached to every request
pub trait TokenProvider: Send + Sync + 'static {
    fn access_token(&self) -> Result<String, TransferError>;
}

/// A token known up front, e.g. from the environment
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl TokenProvider for StaticToken {
    fn access_token(&self) -> Result<String, TransferError> {
        if self.0.is_empty() {
            return Err(TransferError::Auth("access token is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Tokens are treated as expired this many seconds before `expires_at`
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    /// Unix seconds
    #[serde(default)]
    expires_at: f64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Reads `token.json` on every request so an external login refresh is picked up
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenProvider for TokenFile {
    fn access_token(&self) -> Result<String, TransferError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            TransferError::Auth(format!(
                "no token at {} ({}); log in first",
                self.path.display(),
                e
            ))
        })?;
        let stored: StoredToken = serde_json::from_str(&content)
            .map_err(|e| TransferError::Auth(format!("unreadable token file: {}", e)))?;

        let now = chrono::Utc::now().timestamp();
        if (now as f64) > stored.expires_at - TOKEN_EXPIRY_MARGIN_SECS as f64 {
            return Err(TransferError::Auth(
                "access token expired; log in again".to_string(),
            ));
        }
        debug!("Loaded access token from {}", self.path.display());
        Ok(stored.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_token(dir: &Path, expires_at: i64) -> PathBuf {
        let path = dir.join("token.json");
        let body = serde_json::json!({
            "access_token": "tok-123",
            "expires_at": expires_at,
            "refresh_token": "r",
        });
        std::fs::write(&path, body.to_string()).unwrap();
        path
    }

    #[test]
    fn test_token_file_returns_valid_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(dir.path(), chrono::Utc::now().timestamp() + 3600);
        assert_eq!(TokenFile::new(path).access_token().unwrap(), "tok-123");
    }

    #[test]
    fn test_token_file_rejects_token_inside_expiry_margin() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_token(dir.path(), chrono::Utc::now().timestamp() + 60);
        let err = TokenFile::new(path).access_token().unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn test_missing_token_file_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TokenFile::new(dir.path().join("nope.json"))
            .access_token()
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn test_empty_static_token_is_rejected() {
        assert!(StaticToken::new("").access_token().is_err());
        assert_eq!(StaticToken::new("abc").access_token().unwrap(), "abc");
    }

    #[test]
    fn test_rapid_return_type() {
        let response = PrecreateResponse {
            return_type: 2,
            ..Default::default()
        };
        assert!(response.is_rapid());
        assert!(!PrecreateResponse::default().is_rapid());
    }
}
