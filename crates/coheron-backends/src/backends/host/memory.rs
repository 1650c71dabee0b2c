//! Arena bookkeeping for the host backend
//!
//! Each storage space gets its own arena of aligned heap blocks. Blocks are
//! tracked by base address so that frees and copies can be validated against
//! the space they were allocated in.

use crate::backend::{ExecutionSpace, SpacePtr};
use crate::error::{BackendError, Result};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;

/// One zero-initialised, aligned heap block.
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
    /// Requested size; `layout.size()` is at least 1 even for empty requests.
    bytes: usize,
}

// SAFETY: the block exclusively owns its allocation.
unsafe impl Send for Block {}

impl Block {
    fn allocate(space: ExecutionSpace, bytes: usize, alignment: usize) -> Result<Self> {
        let layout = Layout::from_size_align(bytes.max(1), alignment)
            .map_err(|_| BackendError::LayoutOverflow { bytes, alignment })?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(BackendError::OutOfMemory {
            space,
            requested: bytes,
            available: 0,
        })?;

        Ok(Self { ptr, layout, bytes })
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Allocations of a single space.
#[derive(Default)]
pub(crate) struct SpaceArena {
    blocks: HashMap<usize, Block>,
    live_bytes: usize,
    capacity_limit: Option<usize>,
}

impl SpaceArena {
    pub(crate) fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn size_of(&self, addr: usize) -> Option<usize> {
        self.blocks.get(&addr).map(|block| block.bytes)
    }
}

/// Arenas for every storage space.
pub struct ArenaManager {
    arenas: [SpaceArena; ExecutionSpace::COUNT],
    alignment: usize,
}

impl ArenaManager {
    pub fn new(alignment: usize) -> Self {
        Self {
            arenas: Default::default(),
            alignment,
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub(crate) fn arena(&self, space: ExecutionSpace) -> Result<&SpaceArena> {
        let index = space.index().ok_or(BackendError::NotAStorageSpace(space))?;
        Ok(&self.arenas[index])
    }

    fn arena_mut(&mut self, space: ExecutionSpace) -> Result<&mut SpaceArena> {
        let index = space.index().ok_or(BackendError::NotAStorageSpace(space))?;
        Ok(&mut self.arenas[index])
    }

    /// Cap the number of live bytes a space may hold.
    pub fn set_capacity_limit(&mut self, space: ExecutionSpace, limit: Option<usize>) -> Result<()> {
        self.arena_mut(space)?.capacity_limit = limit;
        Ok(())
    }

    pub fn allocate(&mut self, space: ExecutionSpace, bytes: usize) -> Result<SpacePtr> {
        let alignment = self.alignment;
        let arena = self.arena_mut(space)?;

        if let Some(limit) = arena.capacity_limit {
            let available = limit.saturating_sub(arena.live_bytes);
            if bytes > available {
                return Err(BackendError::OutOfMemory {
                    space,
                    requested: bytes,
                    available,
                });
            }
        }

        let block = Block::allocate(space, bytes, alignment)?;
        let ptr = SpacePtr::from_non_null(block.ptr);
        arena.live_bytes += bytes;
        arena.blocks.insert(ptr.addr(), block);
        Ok(ptr)
    }

    /// Release a block, returning its size.
    pub fn free(&mut self, space: ExecutionSpace, ptr: SpacePtr) -> Result<usize> {
        let addr = ptr.addr();
        let arena = self.arena_mut(space)?;
        if let Some(block) = arena.blocks.remove(&addr) {
            arena.live_bytes -= block.bytes;
            return Ok(block.bytes);
        }

        match self.owner_of(addr) {
            Some(actual) => Err(BackendError::SpaceMismatch {
                addr,
                expected: space,
                actual,
            }),
            None => Err(BackendError::UnknownPointer { space, addr }),
        }
    }

    /// Space whose arena holds a block starting at `addr`.
    pub fn owner_of(&self, addr: usize) -> Option<ExecutionSpace> {
        ExecutionSpace::STORAGE
            .into_iter()
            .zip(self.arenas.iter())
            .find(|(_, arena)| arena.blocks.contains_key(&addr))
            .map(|(space, _)| space)
    }

    /// Validate one end of a copy. Pointers this backend never allocated are
    /// treated as caller-provided memory and pass unchecked.
    pub fn check_copy_end(&self, space: ExecutionSpace, ptr: SpacePtr, bytes: usize) -> Result<()> {
        let addr = ptr.addr();
        let arena = self.arena(space)?;
        if let Some(capacity) = arena.size_of(addr) {
            if bytes > capacity {
                return Err(BackendError::CopyOutOfBounds {
                    space,
                    addr,
                    bytes,
                    capacity,
                });
            }
            return Ok(());
        }
        match self.owner_of(addr) {
            Some(actual) => Err(BackendError::SpaceMismatch {
                addr,
                expected: space,
                actual,
            }),
            None => Ok(()),
        }
    }
}
