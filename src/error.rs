use crate::id::FileId;
use std::time::Duration;
use thiserror::Error;

/// Conditions a caller may want to tell apart. They travel inside `anyhow::Error` and can be
/// recovered with `downcast_ref::<StorageError>()`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported engine version {0}")]
    UnsupportedVersion(u32),

    #[error("error in index {name} for key {key}: {source}")]
    Index {
        name: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("page {page_index} of file {file_id} released more times than it was acquired")]
    UnbalancedRelease { file_id: FileId, page_index: u64 },

    #[error("cannot acquire {resource} within {waited:?}")]
    LockTimeout { resource: String, waited: Duration },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("write-ahead log is not usable after a previous failure")]
    WalFailed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("key of {size} bytes exceeds the limit of {max} bytes")]
    KeyTooBig { size: usize, max: usize },

    #[error("key type mismatch: {0}")]
    KeyTypeMismatch(String),

    #[error("page {page_index} of file {file_id} is corrupted")]
    PageCorrupted { file_id: FileId, page_index: u64 },

    #[error("{0} is not empty")]
    NotEmpty(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl StorageError {
    pub(crate) fn index(name: &str, key: String, source: anyhow::Error) -> Self {
        Self::Index {
            name: name.to_string(),
            key,
            source: source.into(),
        }
    }
}
