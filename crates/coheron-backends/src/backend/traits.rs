//! The allocator capability driven by the coherence engine
//!
//! Backends own raw memory in one or more execution spaces. They know nothing
//! about arrays, validity or ownership: the coherence engine decides when to
//! allocate, release and copy, and a backend only carries those requests out.

use super::types::{BackendStats, ExecutionSpace, SpacePtr, DEFAULT_ALIGNMENT};
use crate::error::Result;

/// Per-space raw allocate / free / copy primitives
///
/// # Memory Model
///
/// ```text
///   allocate(Device, n) ──► SpacePtr ──┐
///                                      │ copy(Host, Device, dst, src, n)
///   allocate(Host, n)   ──► SpacePtr ──┘
/// ```
///
/// Every call is synchronous: when `copy` returns, the destination bytes are
/// complete. A backend wrapping an asynchronous device API must synchronise
/// before returning.
///
/// # Usage
///
/// ```rust
/// use coheron_backends::{ExecutionSpace, HostBackend, SpaceAllocator};
///
/// # fn main() -> coheron_backends::Result<()> {
/// let mut backend = HostBackend::new();
/// let ptr = backend.allocate(ExecutionSpace::PinnedHost, 256)?;
/// assert_eq!(ptr.addr() % backend.alignment(), 0);
/// backend.free(ExecutionSpace::PinnedHost, ptr)?;
/// # Ok(())
/// # }
/// ```
pub trait SpaceAllocator: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Allocate `bytes` zero-initialised bytes in `space`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `space` is not a storage space
    /// - the space cannot satisfy the request
    fn allocate(&mut self, space: ExecutionSpace, bytes: usize) -> Result<SpacePtr>;

    /// Release an allocation previously returned by [`SpaceAllocator::allocate`].
    ///
    /// # Errors
    ///
    /// Returns an error if the pointer is unknown to this backend or belongs
    /// to a different space.
    fn free(&mut self, space: ExecutionSpace, ptr: SpacePtr) -> Result<()>;

    /// Copy `bytes` bytes from `src` (in `src_space`) to `dst` (in `dst_space`).
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads and `dst` valid for writes of `bytes`
    /// bytes, and the two regions must not overlap. Backends check what they
    /// can (bounds of their own allocations) but cannot validate memory they
    /// did not allocate.
    unsafe fn copy(
        &mut self,
        src_space: ExecutionSpace,
        dst_space: ExecutionSpace,
        dst: SpacePtr,
        src: SpacePtr,
        bytes: usize,
    ) -> Result<()>;

    /// Alignment guaranteed for every pointer returned by `allocate`.
    fn alignment(&self) -> usize {
        DEFAULT_ALIGNMENT
    }

    /// Call counters, if the backend keeps them.
    fn stats(&self) -> BackendStats {
        BackendStats::default()
    }
}

impl<A: SpaceAllocator + ?Sized> SpaceAllocator for Box<A> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn allocate(&mut self, space: ExecutionSpace, bytes: usize) -> Result<SpacePtr> {
        (**self).allocate(space, bytes)
    }

    fn free(&mut self, space: ExecutionSpace, ptr: SpacePtr) -> Result<()> {
        (**self).free(space, ptr)
    }

    unsafe fn copy(
        &mut self,
        src_space: ExecutionSpace,
        dst_space: ExecutionSpace,
        dst: SpacePtr,
        src: SpacePtr,
        bytes: usize,
    ) -> Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).copy(src_space, dst_space, dst, src, bytes) }
    }

    fn alignment(&self) -> usize {
        (**self).alignment()
    }

    fn stats(&self) -> BackendStats {
        (**self).stats()
    }
}
