//! Error types for pansync core

use thiserror::Error;

/// Errors that can occur in pansync core
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Remote API error {code}: {message}")]
    RemoteApi { code: i64, message: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transfer session expired: {0}")]
    SessionExpired(String),

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Upload failed after {rounds} retry rounds, giving up. \
         Progress saved ({done}/{total} slices). Re-run the command to resume."
    )]
    RefreshLimit { rounds: u32, done: usize, total: usize },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Worker task failed: {0}")]
    Join(String),
}

impl TransferError {
    /// Check if the generic retry wrapper may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::TransientNetwork(_))
    }

    /// Check if the upload session or download link must be reacquired
    pub fn needs_new_session(&self) -> bool {
        matches!(self, TransferError::SessionExpired(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TransferError::Auth(_))
    }

    pub(crate) fn remote(code: i64, message: impl Into<String>) -> Self {
        TransferError::RemoteApi {
            code,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(error: serde_json::Error) -> Self {
        TransferError::Serialization(error.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return TransferError::Serialization(error.to_string());
        }
        match error.status() {
            Some(status) if status.as_u16() == 401 => TransferError::Auth(error.to_string()),
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                TransferError::TransientNetwork(error.to_string())
            }
            Some(status) => TransferError::remote(status.as_u16() as i64, error.to_string()),
            // connect, timeout, body and request errors carry no status
            None => TransferError::TransientNetwork(error.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(error: tokio::task::JoinError) -> Self {
        TransferError::Join(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(TransferError::TransientNetwork("reset".into()).is_retryable());
        assert!(!TransferError::SessionExpired("400".into()).is_retryable());
        assert!(!TransferError::Auth("no token".into()).is_retryable());
        assert!(!TransferError::remote(31064, "quota").is_retryable());
        assert!(!TransferError::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn test_refresh_limit_message_tells_user_to_resume() {
        let error = TransferError::RefreshLimit {
            rounds: 20,
            done: 3,
            total: 10,
        };
        let message = error.to_string();
        assert!(message.contains("3/10"));
        assert!(message.contains("Re-run"));
    }
}
