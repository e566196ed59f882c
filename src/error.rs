//! Error taxonomy shared by the capture, extraction, storage and query layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecallError {
    /// Display subsystem unavailable, monitor gone mid-loop. Logged and skipped.
    #[error("capture failed: {0}")]
    Capture(String),

    /// OCR or embedding engine failure. Degrades to empty text / absent embedding.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Frame store or index write failure. Fatal for the current iteration only.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame not found: {0}")]
    FrameNotFound(String),

    /// Rejected request (bad range, bad limit, malformed embedding).
    /// Distinct from a well-formed query that simply has no matches.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RecallError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Whether the error belongs to the storage family that the scheduler
    /// retries on the next tick.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Database(_) | Self::Io(_) | Self::FrameNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RecallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_family() {
        assert!(RecallError::storage("disk full").is_storage());
        assert!(RecallError::Io(std::io::Error::other("x")).is_storage());
        assert!(!RecallError::invalid_query("limit").is_storage());
        assert!(!RecallError::Capture("gone".into()).is_storage());
    }

    #[test]
    fn test_display_messages() {
        let err = RecallError::invalid_query("limit must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid query: limit must be greater than zero"
        );
    }
}
