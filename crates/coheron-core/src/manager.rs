//! Registry of allocation records and the space-coherence protocol
//!
//! The `ArrayManager` owns every [`AllocationRecord`] and is the only place
//! slot pointers and validity flags change. Handles reach it by reference
//! and ask it to resolve their record for the space they are being used in.
//!
//! ## Protocol
//!
//! ```text
//!             allocate                write elsewhere
//! Unallocated ────────► Valid ───────────────────────► Stale
//!      ▲                 ▲  ▲                            │
//!      │                 │  └────── read/write here ─────┘
//!      └──── free ───────┘          (copy from a valid space)
//! ```
//!
//! A write resolution leaves exactly one valid space. Read resolutions leave
//! other valid spaces alone, so a record can be read-shared by several spaces.
//!
//! ## Locking
//!
//! All records live behind one mutex. Each protocol step, including the copy
//! that refreshes a stale slot and the invalidation that follows a write,
//! completes under that lock, so no other caller observes a half-migrated
//! record.

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::record::{Action, AllocationRecord, RecordId, RecordInfo, SpaceSlot, UserCallback};
use coheron_backends::{BackendStats, ExecutionSpace, HostBackend, SpaceAllocator, SpacePtr};
use coheron_tracing::performance;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Counters of backend work performed on behalf of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub allocations: u64,
    pub frees: u64,
    pub moves: u64,
    pub bytes_moved: u64,
}

struct ManagerState {
    backend: Box<dyn SpaceAllocator>,
    records: HashMap<RecordId, AllocationRecord>,
    /// Slot base address -> owning record and space.
    pointers: HashMap<usize, (RecordId, ExecutionSpace)>,
    global_callback: Option<UserCallback>,
    stats: TransferStats,
}

/// A handle's view of one slot, read under a single lock acquisition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotView {
    pub(crate) pointer: Option<SpacePtr>,
    pub(crate) count: usize,
    pub(crate) generation: u64,
}

impl SlotView {
    fn of(record: &AllocationRecord, space: ExecutionSpace) -> Self {
        let pointer = record.slot(space).pointer;
        Self {
            pointer,
            count: if pointer.is_some() { record.element_count } else { 0 },
            generation: record.generation,
        }
    }
}

/// Coherence manager shared by every handle built from it
///
/// # Example
///
/// ```rust
/// use coheron_core::{ArrayManager, ExecutionSpace};
///
/// # fn main() -> coheron_core::Result<()> {
/// let manager = ArrayManager::with_host_backend();
/// let id = manager.create_record(std::mem::size_of::<f64>(), None);
/// let host = manager.allocate(id, ExecutionSpace::Host, 8)?;
///
/// // Same-space access returns the same pointer without any copy.
/// assert_eq!(manager.resolve_for_access(id, ExecutionSpace::Host, true)?, host);
///
/// // First access from the device copies the host data over.
/// manager.resolve_for_access(id, ExecutionSpace::Device, false)?;
/// assert_eq!(manager.stats().moves, 1);
///
/// manager.free(id)?;
/// # Ok(())
/// # }
/// ```
pub struct ArrayManager {
    state: Mutex<ManagerState>,
    /// Innermost entered space per host thread.
    current_space: Mutex<HashMap<ThreadId, ExecutionSpace>>,
    default_space: OnceLock<ExecutionSpace>,
    next_record: AtomicU64,
}

impl ArrayManager {
    /// Create a manager driving `backend`.
    pub fn new(backend: impl SpaceAllocator + 'static, config: ManagerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(Box::new(backend), config.default_space))
    }

    /// Manager over a [`HostBackend`] with the default configuration.
    pub fn with_host_backend() -> Arc<Self> {
        Self::build(Box::new(HostBackend::new()), None)
    }

    fn build(backend: Box<dyn SpaceAllocator>, default_space: Option<ExecutionSpace>) -> Arc<Self> {
        tracing::debug!(backend = backend.name(), default_space = ?default_space, "array_manager_created");

        let default_cell = OnceLock::new();
        if let Some(space) = default_space {
            let _ = default_cell.set(space);
        }

        Arc::new(Self {
            state: Mutex::new(ManagerState {
                backend,
                records: HashMap::new(),
                pointers: HashMap::new(),
                global_callback: None,
                stats: TransferStats::default(),
            }),
            current_space: Mutex::new(HashMap::new()),
            default_space: default_cell,
            next_record: AtomicU64::new(1),
        })
    }

    /// Manager over a [`HostBackend`] built from `config`.
    pub fn from_config(config: ManagerConfig) -> Result<Arc<Self>> {
        let backend = HostBackend::with_alignment(config.alignment);
        Self::new(backend, config)
    }

    /// Manager over a [`HostBackend`] configured from the environment.
    pub fn from_env() -> Result<Arc<Self>> {
        Self::from_config(ManagerConfig::from_env()?)
    }

    // ============================================================================================
    // Spaces
    // ============================================================================================

    /// Space used when `Unspecified` is requested.
    pub fn default_allocation_space(&self) -> ExecutionSpace {
        self.default_space.get().copied().unwrap_or(ExecutionSpace::Host)
    }

    /// Set the default allocation space. Succeeds once per manager, and not at
    /// all when the configuration already named one.
    pub fn set_default_allocation_space(&self, space: ExecutionSpace) -> Result<()> {
        if !space.is_storage() {
            return Err(Error::Configuration(format!("{space} cannot be the default space")));
        }
        self.default_space.set(space).map_err(|_| {
            Error::Configuration(format!(
                "default space already set to {}",
                self.default_allocation_space()
            ))
        })
    }

    /// `space`, with `Unspecified` replaced by the default space.
    pub fn resolve_space(&self, space: ExecutionSpace) -> ExecutionSpace {
        space.or(self.default_allocation_space())
    }

    /// The space handle copies on the calling thread are currently being made
    /// for. `Unspecified` outside any [`ExecutionScope`].
    pub fn current_execution_space(&self) -> ExecutionSpace {
        self.current_space
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(ExecutionSpace::Unspecified)
    }

    /// Treat handle copies made on this thread until the returned scope drops
    /// as copies into `space`. Scopes nest; dropping one restores the previous
    /// space. Each host thread has its own scope stack, and the guard cannot
    /// leave the thread that entered it.
    pub fn enter_space(&self, space: ExecutionSpace) -> ExecutionScope<'_> {
        let thread = thread::current().id();
        let previous = self
            .current_space
            .lock()
            .insert(thread, space)
            .unwrap_or(ExecutionSpace::Unspecified);
        tracing::trace!(space = %space, previous = %previous, "execution_space_entered");
        ExecutionScope {
            manager: self,
            thread,
            previous,
            _not_send: PhantomData,
        }
    }

    // ============================================================================================
    // Records
    // ============================================================================================

    fn next_id(&self) -> RecordId {
        RecordId(self.next_record.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an empty record for elements of `element_size` bytes.
    pub fn create_record(&self, element_size: usize, callback: Option<UserCallback>) -> RecordId {
        let id = self.next_id();
        self.state
            .lock()
            .records
            .insert(id, AllocationRecord::new(element_size, callback));
        id
    }

    /// Drop a record that never received storage.
    pub(crate) fn discard_if_empty(&self, id: RecordId) {
        let mut state = self.state.lock();
        if state.records.get(&id).is_some_and(|record| !record.has_allocation()) {
            state.records.remove(&id);
        }
    }

    /// Allocate `elements` elements for `id` in `space`, replacing any slot
    /// already there. The new slot is valid; other spaces are not touched.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn allocate(&self, id: RecordId, space: ExecutionSpace, elements: usize) -> Result<SpacePtr> {
        let space = self.resolve_space(space);
        let mut guard = self.state.lock();
        let ManagerState {
            backend,
            records,
            pointers,
            global_callback,
            stats,
        } = &mut *guard;
        let record = records.get_mut(&id).ok_or_else(|| unknown_record(id))?;

        let element_size = record.element_size;
        let bytes = elements
            .checked_mul(element_size)
            .ok_or(Error::SizeOverflow { elements, element_size })?;

        let had_allocation = record.has_allocation();
        if had_allocation && elements != record.element_count {
            return Err(Error::invalid_access(format!(
                "{id} holds {} elements; reallocate to change its size",
                record.element_count
            )));
        }

        let ptr = backend_allocate(&mut **backend, stats, space, bytes)?;

        let previous = *record.slot(space);
        if let Some(old) = previous.pointer {
            if previous.owned {
                if let Err(err) = backend_free(&mut **backend, stats, space, old) {
                    release_quietly(&mut **backend, stats, space, ptr);
                    return Err(err);
                }
                record.notify(global_callback.as_ref(), Action::Free, space, bytes);
            }
            pointers.remove(&old.addr());
            record.retire_pointers();
        }

        *record.slot_mut(space) = SpaceSlot {
            pointer: Some(ptr),
            valid: true,
            owned: true,
        };
        pointers.insert(ptr.addr(), (id, space));
        record.element_count = elements;
        if !had_allocation {
            record.mark_written(space);
        }

        tracing::debug!(record = %id, space = %space, bytes, "slot_allocated");
        record.notify(global_callback.as_ref(), Action::Alloc, space, bytes);
        Ok(ptr)
    }

    /// Bring the slot for `space` up to date and return its pointer.
    ///
    /// - first touch (no valid slot): allocate if needed, no copy
    /// - absent slot: allocate
    /// - stale slot: copy from a valid space
    /// - `write_intent`: every other space becomes stale
    ///
    /// On error every previously valid slot is left as it was.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn resolve_for_access(&self, id: RecordId, space: ExecutionSpace, write_intent: bool) -> Result<SpacePtr> {
        let space = self.resolve_space(space);
        resolve_locked(&mut self.state.lock(), id, space, write_intent)
    }

    /// Resolve for a handle whose cached pointers date from `generation`.
    pub(crate) fn resolve_checked(
        &self,
        id: RecordId,
        space: ExecutionSpace,
        write_intent: bool,
        generation: u64,
    ) -> Result<SlotView> {
        let space = self.resolve_space(space);
        let mut state = self.state.lock();
        check_generation(&state, id, generation)?;
        resolve_locked(&mut state, id, space, write_intent)?;
        let record = state.records.get(&id).ok_or_else(|| unknown_record(id))?;
        Ok(SlotView::of(record, space))
    }

    /// Current slot of `id` in `space` for refreshing a handle.
    pub(crate) fn slot_view(&self, id: RecordId, space: ExecutionSpace) -> Result<SlotView> {
        let space = self.resolve_space(space);
        let state = self.state.lock();
        let record = state.records.get(&id).ok_or_else(|| unknown_record(id))?;
        Ok(SlotView::of(record, space))
    }

    /// Run `access` with the registry locked, provided no pointer of `id`
    /// has been retired since `generation`.
    pub(crate) fn with_live_record<R>(&self, id: RecordId, generation: u64, access: impl FnOnce() -> R) -> Result<R> {
        let state = self.state.lock();
        check_generation(&state, id, generation)?;
        Ok(access())
    }

    /// Resize every allocated slot to `elements` elements, keeping the common
    /// prefix of each slot's own data. Either every slot is resized or the
    /// record is left unchanged.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reallocate(&self, id: RecordId, elements: usize) -> Result<()> {
        let _span = coheron_tracing::perf_span!("reallocate", record = id.id(), elements = elements);
        let mut guard = self.state.lock();
        let ManagerState {
            backend,
            records,
            pointers,
            global_callback,
            stats,
        } = &mut *guard;
        let record = records.get_mut(&id).ok_or_else(|| unknown_record(id))?;

        let element_size = record.element_size;
        let new_bytes = elements
            .checked_mul(element_size)
            .ok_or(Error::SizeOverflow { elements, element_size })?;
        let old_bytes = record.bytes();
        let keep = old_bytes.min(new_bytes);

        let slots: Vec<(ExecutionSpace, SpaceSlot)> = record.allocated().collect();
        let mut fresh: Vec<SpacePtr> = Vec::with_capacity(slots.len());

        for &(space, _) in &slots {
            match backend_allocate(&mut **backend, stats, space, new_bytes) {
                Ok(ptr) => fresh.push(ptr),
                Err(err) => {
                    for (&(space, _), &ptr) in slots.iter().zip(&fresh) {
                        release_quietly(&mut **backend, stats, space, ptr);
                    }
                    return Err(err);
                }
            }
        }

        if keep > 0 {
            for (index, (&(space, slot), &new_ptr)) in slots.iter().zip(&fresh).enumerate() {
                let Some(old_ptr) = slot.pointer else { continue };
                // SAFETY: the old slot holds old_bytes >= keep bytes, the new one new_bytes >= keep.
                let copied = unsafe { backend.copy(space, space, new_ptr, old_ptr, keep) };
                if let Err(source) = copied {
                    tracing::warn!(record = %id, space = %space, slot = index, "reallocate_copy_failed");
                    for (&(space, _), &ptr) in slots.iter().zip(&fresh) {
                        release_quietly(&mut **backend, stats, space, ptr);
                    }
                    return Err(Error::Transfer {
                        from: space,
                        to: space,
                        bytes: keep,
                        source,
                    });
                }
            }
        }

        let mut release_error = None;
        for ((space, old), new_ptr) in slots.into_iter().zip(fresh) {
            let slot = record.slot_mut(space);
            slot.pointer = Some(new_ptr);
            slot.owned = true;
            pointers.insert(new_ptr.addr(), (id, space));
            record.notify(global_callback.as_ref(), Action::Alloc, space, new_bytes);

            if let Some(old_ptr) = old.pointer {
                pointers.remove(&old_ptr.addr());
                if old.owned {
                    match backend_free(&mut **backend, stats, space, old_ptr) {
                        Ok(()) => record.notify(global_callback.as_ref(), Action::Free, space, old_bytes),
                        Err(err) => {
                            release_error.get_or_insert(err);
                        }
                    }
                }
            }
        }
        record.element_count = elements;
        record.retire_pointers();

        tracing::debug!(record = %id, old_bytes, new_bytes, "record_reallocated");
        release_error.map_or(Ok(()), Err)
    }

    /// Forget which spaces are current. Storage is kept; the next access from
    /// any space is a first touch and migrates nothing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reset(&self, id: RecordId) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.records.get_mut(&id).ok_or_else(|| unknown_record(id))?;
        record.clear_validity();
        Ok(())
    }

    /// Release every owned slot. Unowned slots are forgotten without a
    /// backend call. The record stays registered and can be allocated again;
    /// freeing an empty record does nothing.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn free(&self, id: RecordId) -> Result<()> {
        let mut guard = self.state.lock();
        let ManagerState {
            backend,
            records,
            pointers,
            global_callback,
            stats,
        } = &mut *guard;
        let record = records.get_mut(&id).ok_or_else(|| unknown_record(id))?;
        let bytes = record.bytes();

        let mut release_error = None;
        let slots: Vec<(ExecutionSpace, SpaceSlot)> = record.allocated().collect();
        if !slots.is_empty() {
            record.retire_pointers();
        }
        for (space, slot) in slots {
            let Some(ptr) = slot.pointer else { continue };
            pointers.remove(&ptr.addr());
            if slot.owned {
                match backend_free(&mut **backend, stats, space, ptr) {
                    Ok(()) => record.notify(global_callback.as_ref(), Action::Free, space, bytes),
                    Err(err) => {
                        release_error.get_or_insert(err);
                    }
                }
            }
            *record.slot_mut(space) = SpaceSlot::default();
        }
        record.clear_validity();
        record.element_count = 0;

        tracing::debug!(record = %id, bytes, "record_freed");
        release_error.map_or(Ok(()), Err)
    }

    /// Release the slot for one space.
    ///
    /// When the slot is the only valid one, its data is first copied into
    /// another allocated slot, which becomes valid and touched. Without any
    /// other slot the record is left empty.
    ///
    /// # Errors
    ///
    /// [`Error::Ownership`] if the slot holds a pointer the record does not own.
    /// [`Error::Transfer`] if the hand-off copy fails; the slot is kept.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn free_space(&self, id: RecordId, space: ExecutionSpace) -> Result<()> {
        let space = self.resolve_space(space);
        let mut guard = self.state.lock();
        let ManagerState {
            backend,
            records,
            pointers,
            global_callback,
            stats,
        } = &mut *guard;
        let record = records.get_mut(&id).ok_or_else(|| unknown_record(id))?;

        let slot = *record.slot(space);
        let Some(ptr) = slot.pointer else {
            return Ok(());
        };
        if !slot.owned {
            return Err(Error::ownership(format!(
                "{id} does not own its {space} allocation at {:#x}",
                ptr.addr()
            )));
        }

        let bytes = record.bytes();
        let sole_valid = slot.valid && record.allocated().filter(|(_, other)| other.valid).count() == 1;
        let heir = if sole_valid {
            record
                .allocated()
                .find(|&(other, _)| other != space)
                .and_then(|(other, other_slot)| other_slot.pointer.map(|other_ptr| (other, other_ptr)))
        } else {
            None
        };

        if let Some((heir_space, heir_ptr)) = heir {
            let start = Instant::now();
            // SAFETY: both slots belong to this record and hold `bytes` bytes.
            let copied = unsafe { backend.copy(space, heir_space, heir_ptr, ptr, bytes) };
            copied.map_err(|source| Error::Transfer {
                from: space,
                to: heir_space,
                bytes,
                source,
            })?;
            stats.moves += 1;
            stats.bytes_moved += bytes as u64;
            performance::record_transfer(
                bytes,
                &format!("{space}->{heir_space}"),
                start.elapsed().as_micros() as u64,
            );
            tracing::debug!(record = %id, from = %space, to = %heir_space, bytes, "slot_migrated");
            record.notify(global_callback.as_ref(), Action::Move, heir_space, bytes);
        }

        backend_free(&mut **backend, stats, space, ptr)?;
        pointers.remove(&ptr.addr());
        record.notify(global_callback.as_ref(), Action::Free, space, bytes);

        *record.slot_mut(space) = SpaceSlot::default();
        record.retire_pointers();
        if let Some((heir_space, _)) = heir {
            record.mark_written(heir_space);
        } else if record.touched_space == Some(space) {
            record.touched_space = None;
        }
        if !record.has_allocation() {
            record.element_count = 0;
        }
        Ok(())
    }

    /// Declare that `space` was written outside the protocol (through a raw
    /// pointer): it becomes the only valid space.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn register_touch(&self, id: RecordId, space: ExecutionSpace) -> Result<()> {
        let space = self.resolve_space(space);
        let mut state = self.state.lock();
        let record = state.records.get_mut(&id).ok_or_else(|| unknown_record(id))?;
        if !record.slot(space).is_allocated() {
            return Err(Error::invalid_access(format!("{id} has no allocation in {space}")));
        }
        record.mark_written(space);
        Ok(())
    }

    /// Register externally supplied memory as the sole, valid slot of a new record.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `bytes` bytes, aligned for
    /// the element type, for as long as the record references it. With
    /// `owned = true` it must have come from this manager's backend (see
    /// [`ArrayManager::allocate_raw`]), which then releases it on free.
    pub unsafe fn make_managed(
        &self,
        ptr: SpacePtr,
        bytes: usize,
        element_size: usize,
        space: ExecutionSpace,
        owned: bool,
    ) -> Result<RecordId> {
        let space = self.resolve_space(space);
        if element_size == 0 || bytes % element_size != 0 {
            return Err(Error::invalid_access(format!(
                "{bytes} bytes is not a whole number of {element_size}-byte elements"
            )));
        }

        let mut state = self.state.lock();
        if let Some((existing, _)) = state.pointers.get(&ptr.addr()) {
            return Err(Error::invalid_access(format!(
                "{:#x} is already managed by {existing}",
                ptr.addr()
            )));
        }

        let id = self.next_id();
        let mut record = AllocationRecord::new(element_size, None);
        record.element_count = bytes / element_size;
        *record.slot_mut(space) = SpaceSlot {
            pointer: Some(ptr),
            valid: true,
            owned,
        };
        state.pointers.insert(ptr.addr(), (id, space));
        state.records.insert(id, record);

        tracing::debug!(record = %id, space = %space, bytes, owned, "external_pointer_managed");
        Ok(id)
    }

    /// Raw backend memory, e.g. for [`ArrayManager::make_managed`] with ownership.
    pub fn allocate_raw(&self, space: ExecutionSpace, bytes: usize) -> Result<SpacePtr> {
        let space = self.resolve_space(space);
        let mut guard = self.state.lock();
        let ManagerState { backend, stats, .. } = &mut *guard;
        backend_allocate(&mut **backend, stats, space, bytes)
    }

    /// Release memory from [`ArrayManager::allocate_raw`] that no record owns.
    pub fn release_raw(&self, space: ExecutionSpace, ptr: SpacePtr) -> Result<()> {
        let space = self.resolve_space(space);
        let mut guard = self.state.lock();
        let ManagerState {
            backend,
            pointers,
            stats,
            ..
        } = &mut *guard;
        if let Some((id, _)) = pointers.get(&ptr.addr()) {
            return Err(Error::ownership(format!(
                "{:#x} belongs to {id}; free the array instead",
                ptr.addr()
            )));
        }
        backend_free(&mut **backend, stats, space, ptr)
    }

    // ============================================================================================
    // Queries
    // ============================================================================================

    /// Record and space owning a slot that starts at `ptr`.
    pub fn find_record(&self, ptr: *const u8) -> Option<(RecordId, ExecutionSpace)> {
        self.state.lock().pointers.get(&(ptr as usize)).copied()
    }

    /// Current pointer of `id` in `space`, without running the protocol.
    pub fn pointer_for(&self, id: RecordId, space: ExecutionSpace) -> Result<Option<SpacePtr>> {
        let space = self.resolve_space(space);
        let state = self.state.lock();
        let record = state.records.get(&id).ok_or_else(|| unknown_record(id))?;
        Ok(record.slot(space).pointer)
    }

    pub fn element_count(&self, id: RecordId) -> Result<usize> {
        let state = self.state.lock();
        state
            .records
            .get(&id)
            .map(|record| record.element_count)
            .ok_or_else(|| unknown_record(id))
    }

    /// Snapshot of a record's slots and flags.
    pub fn record_snapshot(&self, id: RecordId) -> Result<RecordInfo> {
        let state = self.state.lock();
        state
            .records
            .get(&id)
            .map(AllocationRecord::info)
            .ok_or_else(|| unknown_record(id))
    }

    /// Replace the callback of one record.
    pub fn set_user_callback(&self, id: RecordId, callback: Option<UserCallback>) -> Result<()> {
        let mut state = self.state.lock();
        let record = state.records.get_mut(&id).ok_or_else(|| unknown_record(id))?;
        record.callback = callback;
        Ok(())
    }

    /// Callback invoked for every record, after the record's own callback.
    pub fn set_global_callback(&self, callback: Option<UserCallback>) {
        self.state.lock().global_callback = callback;
    }

    /// Number of records holding storage in at least one space.
    pub fn total_num_arrays(&self) -> usize {
        let state = self.state.lock();
        state.records.values().filter(|record| record.has_allocation()).count()
    }

    /// Bytes held by all records across all spaces.
    pub fn total_size(&self) -> usize {
        let state = self.state.lock();
        state
            .records
            .values()
            .map(|record| record.bytes() * record.allocated().count())
            .sum()
    }

    pub fn stats(&self) -> TransferStats {
        self.state.lock().stats
    }

    pub fn backend_stats(&self) -> BackendStats {
        self.state.lock().backend.stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.state.lock().backend.name()
    }
}

impl fmt::Debug for ArrayManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ArrayManager")
            .field("backend", &state.backend.name())
            .field("records", &state.records.len())
            .field("stats", &state.stats)
            .field("default_space", &self.default_space.get())
            .finish()
    }
}

impl Drop for ArrayManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let live = state.records.values().filter(|record| record.has_allocation()).count();
        if live > 0 {
            tracing::debug!(live, "array_manager_dropped_with_live_records");
        }
    }
}

/// Guard returned by [`ArrayManager::enter_space`].
#[must_use = "the execution space reverts as soon as the scope is dropped"]
pub struct ExecutionScope<'a> {
    manager: &'a ArrayManager,
    thread: ThreadId,
    previous: ExecutionSpace,
    /// Scopes are restored on the thread that entered them.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ExecutionScope<'_> {
    fn drop(&mut self) {
        let mut spaces = self.manager.current_space.lock();
        if self.previous.is_storage() {
            spaces.insert(self.thread, self.previous);
        } else {
            spaces.remove(&self.thread);
        }
    }
}

fn check_generation(state: &ManagerState, id: RecordId, generation: u64) -> Result<()> {
    let record = state.records.get(&id).ok_or_else(|| unknown_record(id))?;
    if record.generation != generation {
        return Err(Error::invalid_access(format!(
            "{id} was freed or reallocated after this handle resolved it"
        )));
    }
    Ok(())
}

fn resolve_locked(state: &mut ManagerState, id: RecordId, space: ExecutionSpace, write_intent: bool) -> Result<SpacePtr> {
    let ManagerState {
        backend,
        records,
        pointers,
        global_callback,
        stats,
    } = state;
    let record = records.get_mut(&id).ok_or_else(|| unknown_record(id))?;
    if !record.has_allocation() {
        return Err(Error::invalid_access(format!("{id} has no storage in any space")));
    }
    let bytes = record.bytes();
    let first_touch = record.is_first_touch();

    let (ptr, fresh) = match record.slot(space).pointer {
        Some(ptr) => (ptr, false),
        None => (backend_allocate(&mut **backend, stats, space, bytes)?, true),
    };

    let mut moved_from = None;
    if !first_touch && !record.slot(space).valid {
        if let Some((source_space, source_ptr)) = record.migration_source(space) {
            let start = Instant::now();
            // SAFETY: both slots belong to this record and hold `bytes` bytes.
            let copied = unsafe { backend.copy(source_space, space, ptr, source_ptr, bytes) };
            if let Err(source) = copied {
                if fresh {
                    release_quietly(&mut **backend, stats, space, ptr);
                }
                return Err(Error::Transfer {
                    from: source_space,
                    to: space,
                    bytes,
                    source,
                });
            }
            stats.moves += 1;
            stats.bytes_moved += bytes as u64;
            performance::record_transfer(
                bytes,
                &format!("{source_space}->{space}"),
                start.elapsed().as_micros() as u64,
            );
            moved_from = Some(source_space);
        }
    }

    if fresh {
        *record.slot_mut(space) = SpaceSlot {
            pointer: Some(ptr),
            valid: false,
            owned: true,
        };
        pointers.insert(ptr.addr(), (id, space));
        tracing::debug!(record = %id, space = %space, bytes, "slot_allocated");
        record.notify(global_callback.as_ref(), Action::Alloc, space, bytes);
    }
    if let Some(source_space) = moved_from {
        tracing::debug!(record = %id, from = %source_space, to = %space, bytes, "slot_migrated");
        record.notify(global_callback.as_ref(), Action::Move, space, bytes);
    }

    if write_intent {
        record.mark_written(space);
    } else {
        record.slot_mut(space).valid = true;
    }
    tracing::trace!(record = %id, space = %space, write_intent, first_touch, "slot_resolved");
    Ok(ptr)
}

fn unknown_record(id: RecordId) -> Error {
    Error::invalid_access(format!("{id} is not registered"))
}

fn backend_allocate(
    backend: &mut dyn SpaceAllocator,
    stats: &mut TransferStats,
    space: ExecutionSpace,
    bytes: usize,
) -> Result<SpacePtr> {
    let ptr = backend
        .allocate(space, bytes)
        .map_err(|source| Error::Allocation { space, bytes, source })?;
    stats.allocations += 1;
    Ok(ptr)
}

fn backend_free(
    backend: &mut dyn SpaceAllocator,
    stats: &mut TransferStats,
    space: ExecutionSpace,
    ptr: SpacePtr,
) -> Result<()> {
    backend.free(space, ptr).map_err(|source| {
        Error::ownership(format!(
            "backend rejected release of {:#x} in {space}: {source}",
            ptr.addr()
        ))
    })?;
    stats.frees += 1;
    Ok(())
}

/// Undo an allocation on an error path.
fn release_quietly(backend: &mut dyn SpaceAllocator, stats: &mut TransferStats, space: ExecutionSpace, ptr: SpacePtr) {
    if let Err(err) = backend_free(backend, stats, space, ptr) {
        tracing::warn!(error = %err, "failed to roll back allocation");
    }
}
