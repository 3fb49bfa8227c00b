use sift_core::FormatError;

use crate::engine::EngineError;
use crate::fetch::FetchError;
use crate::store::StoreError;

/// Errors surfaced by the filtering subsystem.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Filters not ready")]
    NotReady,
    #[error("Invalid filter format: {0}")]
    InvalidFormat(String),
    #[error("Filter cache corrupted: {0}")]
    Corrupted(String),
    #[error("Network error for {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Content-blocking engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Operation cancelled")]
    Cancelled,
}

impl FilterError {
    /// Whether a later retry may succeed without user action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FilterError::NotReady
                | FilterError::Corrupted(_)
                | FilterError::Network { .. }
                | FilterError::Io(_)
        )
    }

    pub(crate) fn network(url: &str, source: FetchError) -> Self {
        match source {
            FetchError::Cancelled => FilterError::Cancelled,
            source => FilterError::Network {
                url: url.to_string(),
                source,
            },
        }
    }
}

impl From<FormatError> for FilterError {
    fn from(err: FormatError) -> Self {
        FilterError::InvalidFormat(err.to_string())
    }
}

impl From<StoreError> for FilterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => FilterError::NotReady,
            StoreError::Corrupted(reason) => FilterError::Corrupted(reason),
            StoreError::Io { source, .. } => FilterError::Io(source),
            StoreError::Format(e) => FilterError::InvalidFormat(e.to_string()),
            StoreError::Metadata(e) => FilterError::Corrupted(e.to_string()),
        }
    }
}
