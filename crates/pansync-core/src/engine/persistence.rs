//! Progress persistence for resumable transfers
//!
//! Upload and download sessions are keyed by remote path and rewritten after
//! every completed slice or segment, so an interrupted run resumes from the
//! last unit that reached the remote or the disk.

use crate::error::TransferError;
use async_trait::async_trait;
use pansync_types::{DownloadSession, UploadSession};
use parking_lot::Mutex;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Key-value store for in-flight sessions
#[async_trait]
pub trait ProgressStore: Send + Sync + 'static {
    async fn load_upload(&self, remote_path: &str) -> Result<Option<UploadSession>, TransferError>;
    async fn save_upload(&self, session: &UploadSession) -> Result<(), TransferError>;
    async fn clear_upload(&self, remote_path: &str) -> Result<(), TransferError>;

    async fn load_download(&self, remote_path: &str) -> Result<Option<DownloadSession>, TransferError>;
    async fn save_download(&self, session: &DownloadSession) -> Result<(), TransferError>;
    async fn clear_download(&self, remote_path: &str) -> Result<(), TransferError>;
}

// ============================================================================
// SQLite
// ============================================================================

/// Database connection pool for session persistence
#[derive(Clone, Debug)]
pub struct SqliteProgressStore {
    pool: SqlitePool,
}

impl SqliteProgressStore {
    /// Open (or create) the progress database
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, TransferError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upload_sessions (
                remote_path TEXT PRIMARY KEY,
                upload_id TEXT NOT NULL,
                chunk_size INTEGER NOT NULL,
                uploaded_parts TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS download_sessions (
                remote_path TEXT PRIMARY KEY,
                file_size INTEGER NOT NULL,
                segment_size INTEGER NOT NULL,
                completed_segments TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn load_upload(&self, remote_path: &str) -> Result<Option<UploadSession>, TransferError> {
        let row = sqlx::query("SELECT * FROM upload_sessions WHERE remote_path = ?")
            .bind(remote_path)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        // JSON array of slice indices
        let parts: BTreeSet<usize> =
            serde_json::from_str(row.get::<String, _>("uploaded_parts").as_str())?;

        Ok(Some(UploadSession {
            remote_path: row.get("remote_path"),
            upload_id: row.get("upload_id"),
            chunk_size: row.get::<i64, _>("chunk_size") as u64,
            uploaded_parts: parts,
        }))
    }

    async fn save_upload(&self, session: &UploadSession) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                remote_path, upload_id, chunk_size, uploaded_parts, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(remote_path) DO UPDATE SET
                upload_id = excluded.upload_id,
                chunk_size = excluded.chunk_size,
                uploaded_parts = excluded.uploaded_parts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.remote_path)
        .bind(&session.upload_id)
        .bind(session.chunk_size as i64)
        .bind(serde_json::to_string(&session.uploaded_parts)?)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_upload(&self, remote_path: &str) -> Result<(), TransferError> {
        sqlx::query("DELETE FROM upload_sessions WHERE remote_path = ?")
            .bind(remote_path)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_download(&self, remote_path: &str) -> Result<Option<DownloadSession>, TransferError> {
        let row = sqlx::query("SELECT * FROM download_sessions WHERE remote_path = ?")
            .bind(remote_path)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let completed: BTreeSet<usize> =
            serde_json::from_str(row.get::<String, _>("completed_segments").as_str())?;

        // segments themselves are recomputed from the two sizes
        Ok(Some(DownloadSession {
            remote_path: row.get("remote_path"),
            file_size: row.get::<i64, _>("file_size") as u64,
            segment_size: row.get::<i64, _>("segment_size") as u64,
            completed_segments: completed,
        }))
    }

    async fn save_download(&self, session: &DownloadSession) -> Result<(), TransferError> {
        sqlx::query(
            r#"
            INSERT INTO download_sessions (
                remote_path, file_size, segment_size, completed_segments, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(remote_path) DO UPDATE SET
                file_size = excluded.file_size,
                segment_size = excluded.segment_size,
                completed_segments = excluded.completed_segments,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.remote_path)
        .bind(session.file_size as i64)
        .bind(session.segment_size as i64)
        .bind(serde_json::to_string(&session.completed_segments)?)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_download(&self, remote_path: &str) -> Result<(), TransferError> {
        sqlx::query("DELETE FROM download_sessions WHERE remote_path = ?")
            .bind(remote_path)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Store that lives for the process only
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    uploads: Mutex<HashMap<String, UploadSession>>,
    downloads: Mutex<HashMap<String, DownloadSession>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn load_upload(&self, remote_path: &str) -> Result<Option<UploadSession>, TransferError> {
        Ok(self.uploads.lock().get(remote_path).cloned())
    }

    async fn save_upload(&self, session: &UploadSession) -> Result<(), TransferError> {
        self.uploads
            .lock()
            .insert(session.remote_path.clone(), session.clone());
        Ok(())
    }

    async fn clear_upload(&self, remote_path: &str) -> Result<(), TransferError> {
        self.uploads.lock().remove(remote_path);
        Ok(())
    }

    async fn load_download(&self, remote_path: &str) -> Result<Option<DownloadSession>, TransferError> {
        Ok(self.downloads.lock().get(remote_path).cloned())
    }

    async fn save_download(&self, session: &DownloadSession) -> Result<(), TransferError> {
        self.downloads
            .lock()
            .insert(session.remote_path.clone(), session.clone());
        Ok(())
    }

    async fn clear_download(&self, remote_path: &str) -> Result<(), TransferError> {
        self.downloads.lock().remove(remote_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_upload_session_roundtrip_and_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteProgressStore::new(dir.path().join("progress.db"))
            .await
            .unwrap();

        let mut session = UploadSession::new("/apps/bypy/a.bin", "id-1", 4096);
        session.uploaded_parts.extend([0, 2]);
        store.save_upload(&session).await.unwrap();

        session.upload_id = "id-2".into();
        session.uploaded_parts.insert(1);
        store.save_upload(&session).await.unwrap();

        let loaded = store.load_upload("/apps/bypy/a.bin").await.unwrap().unwrap();
        assert_eq!(loaded, session);

        store.clear_upload("/apps/bypy/a.bin").await.unwrap();
        assert!(store.load_upload("/apps/bypy/a.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_download_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("progress.db");

        let mut session = DownloadSession::new("/apps/bypy/movie.mkv", 8000, 1024);
        session.completed_segments.extend([0, 1, 5]);
        {
            let store = SqliteProgressStore::new(&db_path).await.unwrap();
            store.save_download(&session).await.unwrap();
        }

        let store = SqliteProgressStore::new(&db_path).await.unwrap();
        let loaded = store
            .load_download("/apps/bypy/movie.mkv")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, session);
        assert!(store.load_download("/apps/bypy/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_keeps_uploads_and_downloads_apart() {
        let store = MemoryProgressStore::new();
        store
            .save_upload(&UploadSession::new("/p", "id", 1))
            .await
            .unwrap();
        assert!(store.load_download("/p").await.unwrap().is_none());

        store
            .save_download(&DownloadSession::new("/p", 10, 5))
            .await
            .unwrap();
        store.clear_upload("/p").await.unwrap();
        assert!(store.load_upload("/p").await.unwrap().is_none());
        assert!(store.load_download("/p").await.unwrap().is_some());
    }
}
