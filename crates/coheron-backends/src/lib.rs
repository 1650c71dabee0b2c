//! Memory-space backends for the coheron coherence engine
//!
//! This crate provides:
//! - **Execution spaces**: the closed set of memory domains an array can live in
//! - **Allocator trait**: the `allocate` / `free` / `copy` capability the
//!   coherence engine drives
//! - **Host backend**: a reference allocator that emulates every storage
//!   space with its own aligned, host-addressable arena
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 coheron-core ArrayManager                │
//! │        (allocation records + coherence protocol)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ SpaceAllocator
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   allocate(space, bytes)  free(space, ptr)  copy(...)    │
//! └─────────────────────┬───────────────────────────────────┘
//!         ┌─────────────┼─────────────┬─────────────┐
//!         ▼             ▼             ▼             ▼
//!   ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐
//!   │  Host   │  │ Device  │  │ Pinned  │  │ Unified │
//!   │  arena  │  │  arena  │  │  arena  │  │  arena  │
//!   └─────────┘  └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use coheron_backends::{ExecutionSpace, HostBackend, SpaceAllocator};
//!
//! # fn main() -> coheron_backends::Result<()> {
//! let mut backend = HostBackend::new();
//!
//! let host = backend.allocate(ExecutionSpace::Host, 16)?;
//! let device = backend.allocate(ExecutionSpace::Device, 16)?;
//!
//! unsafe { host.as_ptr().write(7) };
//! // SAFETY: both pointers came from this backend with 16 bytes each.
//! unsafe { backend.copy(ExecutionSpace::Host, ExecutionSpace::Device, device, host, 16)? };
//! assert_eq!(unsafe { device.as_ptr().read() }, 7);
//!
//! backend.free(ExecutionSpace::Host, host)?;
//! backend.free(ExecutionSpace::Device, device)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;

// Re-export public API
pub use backend::{BackendStats, ExecutionSpace, ParseSpaceError, SpaceAllocator, SpacePtr, DEFAULT_ALIGNMENT};
pub use backends::HostBackend;
pub use error::{BackendError, Result};
