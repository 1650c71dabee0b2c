//! Error types for coheron-core operations

use coheron_backends::{BackendError, ExecutionSpace};

/// Result type for coheron-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing arrays across execution spaces
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend could not allocate storage for a slot
    #[error("Allocation error: {bytes} bytes in {space}: {source}")]
    Allocation {
        space: ExecutionSpace,
        bytes: usize,
        #[source]
        source: BackendError,
    },

    /// `elements * element_size` does not fit in `usize`
    #[error("Allocation error: {elements} elements of {element_size} bytes overflows usize")]
    SizeOverflow { elements: usize, element_size: usize },

    /// The backend failed while migrating a slot
    #[error("Transfer error: {bytes} bytes from {from} to {to}: {source}")]
    Transfer {
        from: ExecutionSpace,
        to: ExecutionSpace,
        bytes: usize,
        #[source]
        source: BackendError,
    },

    /// Operation on an empty, freed or unknown array
    #[error("Invalid access: {0}")]
    InvalidAccess(String),

    /// Release of memory the record does not own, or a release the backend rejected
    #[error("Ownership error: {0}")]
    Ownership(String),

    /// Invalid manager configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid access error
    pub fn invalid_access(msg: impl Into<String>) -> Self {
        Self::InvalidAccess(msg.into())
    }

    /// Create an ownership error
    pub fn ownership(msg: impl Into<String>) -> Self {
        Self::Ownership(msg.into())
    }

    /// Whether this error belongs to the allocation class (backend failure or size overflow)
    pub fn is_allocation_error(&self) -> bool {
        matches!(self, Error::Allocation { .. } | Error::SizeOverflow { .. })
    }
}
