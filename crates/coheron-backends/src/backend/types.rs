//! Spaces, pointers and counters shared by every backend

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr::NonNull;
use std::str::FromStr;

/// Alignment used for every allocation unless a backend is configured otherwise.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// A distinct memory domain with its own address space and allocator.
///
/// `Unspecified` is never a storage location. Wherever a space is requested it
/// means "use the configured default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSpace {
    #[default]
    Unspecified,
    Host,
    Device,
    PinnedHost,
    Unified,
}

impl ExecutionSpace {
    /// Every storage space, in the order migration sources are searched.
    pub const STORAGE: [ExecutionSpace; 4] = [
        ExecutionSpace::Host,
        ExecutionSpace::Device,
        ExecutionSpace::PinnedHost,
        ExecutionSpace::Unified,
    ];

    /// Number of storage spaces.
    pub const COUNT: usize = Self::STORAGE.len();

    /// Whether data can actually live in this space.
    pub const fn is_storage(self) -> bool {
        !matches!(self, ExecutionSpace::Unspecified)
    }

    /// Dense index into per-space tables (`None` for `Unspecified`).
    pub const fn index(self) -> Option<usize> {
        match self {
            ExecutionSpace::Unspecified => None,
            ExecutionSpace::Host => Some(0),
            ExecutionSpace::Device => Some(1),
            ExecutionSpace::PinnedHost => Some(2),
            ExecutionSpace::Unified => Some(3),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ExecutionSpace::Unspecified => "Unspecified",
            ExecutionSpace::Host => "Host",
            ExecutionSpace::Device => "Device",
            ExecutionSpace::PinnedHost => "PinnedHost",
            ExecutionSpace::Unified => "Unified",
        }
    }

    /// `Unspecified` replaced by `default`.
    pub const fn or(self, default: ExecutionSpace) -> ExecutionSpace {
        match self {
            ExecutionSpace::Unspecified => default,
            other => other,
        }
    }
}

impl fmt::Display for ExecutionSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string does not name an execution space.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown execution space: {0:?}")]
pub struct ParseSpaceError(pub String);

impl FromStr for ExecutionSpace {
    type Err = ParseSpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "unspecified" => Ok(ExecutionSpace::Unspecified),
            "host" | "cpu" => Ok(ExecutionSpace::Host),
            "device" | "gpu" => Ok(ExecutionSpace::Device),
            "pinned" | "pinned_host" | "pinnedhost" => Ok(ExecutionSpace::PinnedHost),
            "um" | "unified" => Ok(ExecutionSpace::Unified),
            _ => Err(ParseSpaceError(s.to_string())),
        }
    }
}

/// Non-null pointer to the start of a backend allocation.
///
/// The pointer is an address token: the type never dereferences it and it
/// carries no lifetime. Whoever holds it is responsible for only using it
/// while the allocation is live.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpacePtr(NonNull<u8>);

// SAFETY: SpacePtr is an address token; access to the memory it names is
// synchronised by the owner of the allocation record.
unsafe impl Send for SpacePtr {}
unsafe impl Sync for SpacePtr {}

impl SpacePtr {
    /// Wrap a raw pointer, rejecting null.
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(SpacePtr)
    }

    pub const fn from_non_null(ptr: NonNull<u8>) -> Self {
        SpacePtr(ptr)
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn cast<T>(self) -> *mut T {
        self.0.as_ptr().cast()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for SpacePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpacePtr({:#x})", self.addr())
    }
}

/// Counters of backend calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    pub allocations: u64,
    pub frees: u64,
    pub copies: u64,
    pub bytes_copied: u64,
}
