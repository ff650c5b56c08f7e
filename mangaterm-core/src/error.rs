//! Error types for the chapter reader

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("manifest for chapter {chapter} unavailable: {reason}")]
    ManifestUnavailable { chapter: String, reason: String },

    #[error("failed to probe page {index} ({url}): {reason}")]
    DimensionProbeFailed {
        index: usize,
        url: String,
        reason: String,
    },

    #[error("storage unavailable for key {key}: {reason}")]
    StorageUnavailable { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ReaderError {
    pub fn storage(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ReaderError::StorageUnavailable {
            key: key.into(),
            reason: err.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReaderError::ManifestUnavailable { .. } | ReaderError::InvalidConfig(_)
        )
    }
}

pub type ReaderResult<T> = std::result::Result<T, ReaderError>;
