//! Host-memory reference backend
//!
//! `HostBackend` gives every storage space its own arena of aligned heap
//! blocks. The spaces are distinct address ranges, so data only reaches a
//! space by an explicit `copy`, which is exactly what the coherence engine
//! needs to observe. All pointers remain host-addressable, which lets code
//! running "in" any space dereference them directly.

mod memory;

pub use memory::ArenaManager;

use crate::backend::{BackendStats, ExecutionSpace, SpaceAllocator, SpacePtr, DEFAULT_ALIGNMENT};
use crate::error::{BackendError, Result};
use std::time::Instant;

/// Reference allocator emulating every storage space in host memory
///
/// # Example
///
/// ```rust
/// use coheron_backends::{ExecutionSpace, HostBackend, SpaceAllocator};
///
/// let mut backend = HostBackend::new().with_capacity_limit(ExecutionSpace::Device, 1024);
/// assert!(backend.allocate(ExecutionSpace::Device, 2048).is_err());
/// ```
pub struct HostBackend {
    arenas: ArenaManager,
    stats: BackendStats,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_alignment(DEFAULT_ALIGNMENT)
    }

    /// Backend whose allocations are aligned to `alignment` bytes (power of two).
    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            arenas: ArenaManager::new(alignment),
            stats: BackendStats::default(),
        }
    }

    /// Limit the live bytes of one space; requests beyond it fail with
    /// [`BackendError::OutOfMemory`].
    pub fn with_capacity_limit(mut self, space: ExecutionSpace, bytes: usize) -> Self {
        if let Err(err) = self.arenas.set_capacity_limit(space, Some(bytes)) {
            tracing::warn!(error = %err, "ignoring capacity limit");
        }
        self
    }

    /// Bytes currently allocated in `space`.
    pub fn live_bytes(&self, space: ExecutionSpace) -> usize {
        self.arenas.arena(space).map(|a| a.live_bytes()).unwrap_or(0)
    }

    /// Number of live allocations in `space`.
    pub fn allocation_count(&self, space: ExecutionSpace) -> usize {
        self.arenas.arena(space).map(|a| a.allocation_count()).unwrap_or(0)
    }

    /// Whether `ptr` is the base of a live allocation in `space`.
    pub fn contains(&self, space: ExecutionSpace, ptr: SpacePtr) -> bool {
        self.arenas.owner_of(ptr.addr()) == Some(space)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceAllocator for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn allocate(&mut self, space: ExecutionSpace, bytes: usize) -> Result<SpacePtr> {
        let start = Instant::now();
        let ptr = self.arenas.allocate(space, bytes)?;
        self.stats.allocations += 1;

        coheron_tracing::performance::record_allocation(
            bytes,
            space.name(),
            self.arenas.alignment(),
            start.elapsed().as_micros() as u64,
        );
        Ok(ptr)
    }

    fn free(&mut self, space: ExecutionSpace, ptr: SpacePtr) -> Result<()> {
        let bytes = self.arenas.free(space, ptr)?;
        self.stats.frees += 1;
        coheron_tracing::performance::record_release(bytes, space.name());
        Ok(())
    }

    unsafe fn copy(
        &mut self,
        src_space: ExecutionSpace,
        dst_space: ExecutionSpace,
        dst: SpacePtr,
        src: SpacePtr,
        bytes: usize,
    ) -> Result<()> {
        self.arenas.check_copy_end(src_space, src, bytes)?;
        self.arenas.check_copy_end(dst_space, dst, bytes)?;
        if dst == src {
            return Err(BackendError::other(format!(
                "copy source and destination alias at {:#x}",
                src.addr()
            )));
        }

        // SAFETY: caller guarantees both regions are valid and disjoint;
        // regions owned by this backend were bounds-checked above.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), bytes) };

        self.stats.copies += 1;
        self.stats.bytes_copied += bytes as u64;
        Ok(())
    }

    fn alignment(&self) -> usize {
        self.arenas.alignment()
    }

    fn stats(&self) -> BackendStats {
        self.stats
    }
}
