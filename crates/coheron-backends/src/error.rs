//! Error types for backend operations

use crate::backend::ExecutionSpace;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while allocating, releasing or copying space memory
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The space cannot satisfy the request
    #[error("out of memory in {space}: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        space: ExecutionSpace,
        requested: usize,
        available: usize,
    },

    /// `Unspecified` was passed where a storage space is required
    #[error("{0} is not a storage space")]
    NotAStorageSpace(ExecutionSpace),

    /// The size/alignment pair does not form a valid layout
    #[error("invalid allocation layout: {bytes} bytes aligned to {alignment}")]
    LayoutOverflow { bytes: usize, alignment: usize },

    /// The pointer was not allocated by this backend
    #[error("unknown pointer {addr:#x} in {space}")]
    UnknownPointer { space: ExecutionSpace, addr: usize },

    /// The pointer belongs to a different space than the caller claimed
    #[error("pointer {addr:#x} belongs to {actual}, not {expected}")]
    SpaceMismatch {
        addr: usize,
        expected: ExecutionSpace,
        actual: ExecutionSpace,
    },

    /// A copy would read or write past the end of a known allocation
    #[error("copy of {bytes} bytes exceeds allocation of {capacity} bytes at {addr:#x} in {space}")]
    CopyOutOfBounds {
        space: ExecutionSpace,
        addr: usize,
        bytes: usize,
        capacity: usize,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create a generic backend error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
