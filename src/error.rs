use std::io;

use thiserror::Error;

/// Error taxonomy for the indexing and retrieval core.
///
/// Each variant carries a stable kind tag (see [`KeeperError::kind`]) that is
/// recorded on failed event records and returned through the API layer.
/// The event queue recovers `Retry` errors with bounded attempts; `Fatal`
/// halts the consumer and is surfaced to the supervisor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeeperError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transient failure: {0}")]
    Retry(String),
    #[error("embedding backend error: {0}")]
    Backend(String),
    #[error("index corruption: {0}")]
    Corrupt(String),
    #[error("fatal storage error: {0}")]
    Fatal(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl KeeperError {
    /// Stable machine-readable tag, independent of the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            KeeperError::NotFound(_) => "not_found",
            KeeperError::Invalid(_) => "invalid",
            KeeperError::Retry(_) => "retry",
            KeeperError::Backend(_) => "backend",
            KeeperError::Corrupt(_) => "corrupt",
            KeeperError::Fatal(_) => "fatal",
            KeeperError::Internal(_) => "internal",
        }
    }

    /// Whether the event queue should requeue the originating event.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeeperError::Retry(_) | KeeperError::Backend(_))
    }
}

impl From<sqlx::Error> for KeeperError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => KeeperError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) => {
                let msg = db.message().to_string();
                // SQLITE_BUSY / SQLITE_LOCKED surface as plain database errors;
                // both clear once the writer's transaction commits.
                if msg.contains("locked") || msg.contains("busy") {
                    KeeperError::Retry(format!("database contention: {msg}"))
                } else if msg.contains("disk") || msg.contains("full") {
                    KeeperError::Fatal(format!("database write failed: {msg}"))
                } else {
                    KeeperError::Internal(format!("database error: {msg}"))
                }
            }
            _ => KeeperError::Internal(format!("database error: {err}")),
        }
    }
}

impl From<io::Error> for KeeperError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => KeeperError::NotFound(format!("{err}")),
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                KeeperError::Retry(format!("{err}"))
            }
            _ => KeeperError::Retry(format!("io error: {err}")),
        }
    }
}

impl From<serde_json::Error> for KeeperError {
    fn from(err: serde_json::Error) -> Self {
        KeeperError::Internal(format!("json error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(KeeperError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(KeeperError::Retry("x".into()).kind(), "retry");
        assert_eq!(KeeperError::Fatal("x".into()).kind(), "fatal");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(KeeperError::from(err), KeeperError::NotFound(_)));
    }

    #[test]
    fn retryable_covers_retry_and_backend() {
        assert!(KeeperError::Retry("x".into()).is_retryable());
        assert!(KeeperError::Backend("x".into()).is_retryable());
        assert!(!KeeperError::Fatal("x".into()).is_retryable());
    }
}
