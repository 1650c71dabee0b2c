//! Array handles over managed records
//!
//! A [`ManagedArray`] is a small, copyable view of one record: the manager it
//! belongs to, the record id, and the pointer it last resolved together with
//! the space that pointer lives in. Handles never own storage. Dropping one
//! releases nothing; storage goes away only through an explicit `free`.
//!
//! Copying a handle is how data follows computation. While an
//! [`crate::ExecutionScope`] is active, [`ManagedArray::try_clone`] resolves
//! the record for that scope's space and hands back a handle pointing at
//! current data there:
//!
//! ```rust
//! use coheron_core::{ArrayManager, ExecutionSpace, ManagedArray};
//!
//! # fn main() -> coheron_core::Result<()> {
//! let manager = ArrayManager::with_host_backend();
//! let mut a = ManagedArray::<u32>::new(&manager, 10, ExecutionSpace::Host)?;
//! a.set(3, 42);
//!
//! let on_device = {
//!     let _scope = manager.enter_space(ExecutionSpace::Device);
//!     a.try_clone()?
//! };
//! assert_eq!(on_device.space(), ExecutionSpace::Device);
//! assert_eq!(on_device.get(3), 42);
//! # Ok(())
//! # }
//! ```
//!
//! Handles sharing a record share its storage. Each handle remembers the
//! record generation it resolved against; once any handle frees, reallocates
//! or releases a slot of the record, the others fail with
//! [`Error::InvalidAccess`] instead of touching released memory. Copy or
//! [`ManagedArray::move_to`] from a live handle to get a fresh one.

use crate::error::{Error, Result};
use crate::manager::{ArrayManager, SlotView};
use crate::record::{RecordId, UserCallback};
use bytemuck::Pod;
use coheron_backends::{ExecutionSpace, SpacePtr};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ReadWrite {}
    impl Sealed for super::ReadOnly {}
}

/// Element access granted by a handle.
pub trait Access: sealed::Sealed + 'static {
    /// Copies of a handle with this access invalidate other spaces.
    const WRITES: bool;
}

/// Mutable elements. Copies resolve with write intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadWrite;

/// Immutable elements. Copies resolve as reads and keep other spaces valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOnly;

impl Access for ReadWrite {
    const WRITES: bool = true;
}

impl Access for ReadOnly {
    const WRITES: bool = false;
}

/// Handle to an array whose storage is kept coherent across execution spaces.
pub struct ManagedArray<T: Pod, A: Access = ReadWrite> {
    manager: Option<Arc<ArrayManager>>,
    record: Option<RecordId>,
    active: *mut T,
    space: ExecutionSpace,
    count: usize,
    generation: u64,
    observable: bool,
    _access: PhantomData<A>,
}

impl<T: Pod, A: Access> ManagedArray<T, A> {
    /// Empty handle with no manager and no record.
    pub fn null() -> Self {
        Self {
            manager: None,
            record: None,
            active: std::ptr::null_mut(),
            space: ExecutionSpace::Unspecified,
            count: 0,
            generation: 0,
            observable: true,
            _access: PhantomData,
        }
    }

    /// Empty handle bound to `manager`, ready for [`ManagedArray::allocate`].
    pub fn with_manager(manager: &Arc<ArrayManager>) -> Self {
        Self {
            manager: Some(Arc::clone(manager)),
            ..Self::null()
        }
    }

    /// Create a record with `elements` zeroed elements in `space`.
    pub fn new(manager: &Arc<ArrayManager>, elements: usize, space: ExecutionSpace) -> Result<Self> {
        let mut array = Self::with_manager(manager);
        array.allocate(elements, space, None)?;
        Ok(array)
    }

    fn bound(&self) -> Result<(&Arc<ArrayManager>, RecordId)> {
        match (&self.manager, self.record) {
            (Some(manager), Some(id)) => Ok((manager, id)),
            _ => Err(Error::invalid_access("handle does not refer to a record")),
        }
    }

    fn verbatim(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            record: self.record,
            active: self.active,
            space: self.space,
            count: self.count,
            generation: self.generation,
            observable: self.observable,
            _access: PhantomData,
        }
    }

    fn attach(&mut self, view: SlotView, space: ExecutionSpace) {
        self.generation = view.generation;
        match view.pointer {
            Some(ptr) => {
                self.active = ptr.cast();
                self.space = space;
                self.count = view.count;
            }
            None => {
                self.active = std::ptr::null_mut();
                self.space = ExecutionSpace::Unspecified;
                self.count = 0;
            }
        }
    }

    /// Re-read this handle's slot in `space` after a lifecycle call.
    fn refresh(&mut self, space: ExecutionSpace) -> Result<()> {
        let (manager, id) = self.bound()?;
        let view = manager.slot_view(id, space)?;
        self.attach(view, space);
        Ok(())
    }

    /// Copy the handle, migrating the record into the manager's current
    /// execution space when there is one.
    ///
    /// Pass-through handles, empty handles and copies made outside every
    /// execution scope are verbatim. Migrating a handle whose record was
    /// freed or reallocated through another handle is
    /// [`Error::InvalidAccess`].
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = self.verbatim();
        if !self.observable || self.active.is_null() || self.count == 0 {
            return Ok(copy);
        }
        let Ok((manager, id)) = self.bound() else {
            return Ok(copy);
        };

        let space = manager.current_execution_space();
        if !space.is_storage() {
            return Ok(copy);
        }

        let view = manager.resolve_checked(id, space, A::WRITES, self.generation)?;
        copy.attach(view, space);
        Ok(copy)
    }

    /// Verbatim copy that never runs the protocol, nor do copies made from it.
    pub fn pass_through(&self) -> Self {
        Self {
            observable: false,
            ..self.verbatim()
        }
    }

    /// Re-arm a pass-through handle.
    pub fn observable(mut self) -> Self {
        self.observable = true;
        self
    }

    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Resolve the record for `space` and point this handle there.
    ///
    /// Unlike a copy, this also re-arms a handle left stale by another
    /// handle's lifecycle call.
    pub fn move_to(&mut self, space: ExecutionSpace) -> Result<()> {
        let (manager, id) = self.bound()?;
        let space = manager.resolve_space(space);
        let generation = manager.slot_view(id, space)?.generation;
        let view = manager.resolve_checked(id, space, A::WRITES, generation)?;
        self.attach(view, space);
        Ok(())
    }

    /// Allocate `elements` elements in `space`, creating the record on first use.
    ///
    /// A callback replaces the record's existing one.
    pub fn allocate(&mut self, elements: usize, space: ExecutionSpace, callback: Option<UserCallback>) -> Result<()> {
        let manager = match &self.manager {
            Some(manager) => Arc::clone(manager),
            None => return Err(Error::invalid_access("handle has no manager to allocate from")),
        };

        let (id, created) = match self.record {
            Some(id) => {
                if callback.is_some() {
                    manager.set_user_callback(id, callback)?;
                }
                (id, false)
            }
            None => (manager.create_record(size_of::<T>(), callback), true),
        };

        match manager.allocate(id, space, elements) {
            Ok(_) => {
                self.record = Some(id);
                self.refresh(manager.resolve_space(space))
            }
            Err(err) => {
                if created {
                    manager.discard_if_empty(id);
                }
                Err(err)
            }
        }
    }

    /// Resize the record in every space it is allocated in.
    pub fn reallocate(&mut self, elements: usize) -> Result<()> {
        let (manager, id) = self.bound()?;
        manager.reallocate(id, elements)?;
        let space = manager.resolve_space(self.space);
        self.refresh(space)
    }

    /// Release the record's storage in every space. The handle stays bound
    /// and can allocate again.
    pub fn free(&mut self) -> Result<()> {
        let (manager, id) = self.bound()?;
        manager.free(id)?;
        self.refresh(ExecutionSpace::Unspecified)
    }

    /// Release the record's storage in one space.
    pub fn free_space(&mut self, space: ExecutionSpace) -> Result<()> {
        let (manager, id) = self.bound()?;
        let space = manager.resolve_space(space);
        manager.free_space(id, space)?;
        let current = self.space;
        self.refresh(current)
    }

    /// Forget which spaces hold current data.
    pub fn reset(&self) -> Result<()> {
        let (manager, id) = self.bound()?;
        manager.reset(id)
    }

    /// Declare `space` written outside the protocol.
    pub fn register_touch(&self, space: ExecutionSpace) -> Result<()> {
        let (manager, id) = self.bound()?;
        manager.register_touch(id, space)
    }

    pub fn set_user_callback(&self, callback: Option<UserCallback>) -> Result<()> {
        let (manager, id) = self.bound()?;
        manager.set_user_callback(id, callback)
    }

    /// Element count cached by this handle.
    pub fn size(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Space of the pointer this handle reads and writes.
    pub fn space(&self) -> ExecutionSpace {
        self.space
    }

    pub fn record(&self) -> Option<RecordId> {
        self.record
    }

    pub fn manager(&self) -> Option<&Arc<ArrayManager>> {
        self.manager.as_ref()
    }

    /// Detach from the record without touching it.
    pub fn clear(&mut self) {
        *self = Self::null();
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.count {
            return Err(Error::invalid_access(format!(
                "index {index} out of range for array of {} elements",
                self.count
            )));
        }
        Ok(())
    }

    /// Read one element, checking the index and that the record still holds
    /// the storage this handle points at.
    pub fn try_get(&self, index: usize) -> Result<T> {
        self.check_index(index)?;
        let (manager, id) = self.bound()?;
        // SAFETY: in bounds, and the generation check proves `active` still
        // points at `count` live elements of the record.
        manager.with_live_record(id, self.generation, || unsafe { self.active.add(index).read() })
    }

    /// # Panics
    ///
    /// Panics if `index >= self.size()` or the record was freed or
    /// reallocated through another handle.
    pub fn get(&self, index: usize) -> T {
        match self.try_get(index) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// # Safety
    ///
    /// `index` must be below [`ManagedArray::size`], the handle's space
    /// must be addressable from the calling code, and no handle may have
    /// freed or reallocated the record since this one resolved it.
    pub unsafe fn get_unchecked(&self, index: usize) -> T {
        debug_assert!(index < self.count);
        unsafe { self.active.add(index).read() }
    }

    /// # Safety
    ///
    /// No other handle may write the record while the slice is alive. The
    /// slice reflects this handle's space only.
    pub unsafe fn as_slice(&self) -> &[T] {
        if self.active.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.active, self.count) }
    }

    /// Elements of this handle's space, copied out.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        if self.active.is_null() || self.count == 0 {
            return Ok(Vec::new());
        }
        let (manager, id) = self.bound()?;
        manager.with_live_record(id, self.generation, || {
            // SAFETY: the generation check proves `active` still points at
            // `count` live elements.
            unsafe { std::slice::from_raw_parts(self.active, self.count) }.to_vec()
        })
    }

    #[cfg(feature = "raw-pointers")]
    pub fn as_ptr(&self) -> *const T {
        self.active
    }

    /// Rebuild a handle from a pointer previously taken from a slot of a
    /// managed array.
    #[cfg(feature = "raw-pointers")]
    pub fn from_raw(manager: &Arc<ArrayManager>, ptr: *const T) -> Result<Self> {
        let (id, space) = manager
            .find_record(ptr.cast())
            .ok_or_else(|| Error::invalid_access(format!("{ptr:p} is not a managed slot")))?;
        let view = manager.slot_view(id, space)?;
        Ok(Self {
            manager: Some(Arc::clone(manager)),
            record: Some(id),
            active: ptr.cast_mut(),
            space,
            count: view.count,
            generation: view.generation,
            observable: true,
            _access: PhantomData,
        })
    }
}

impl<T: Pod> ManagedArray<T, ReadWrite> {
    /// Write one element, with the same checks as [`ManagedArray::try_get`].
    pub fn try_set(&mut self, index: usize, value: T) -> Result<()> {
        self.check_index(index)?;
        let (manager, id) = self.bound()?;
        let active = self.active;
        // SAFETY: as in `try_get`.
        manager.with_live_record(id, self.generation, || unsafe { active.add(index).write(value) })
    }

    /// # Panics
    ///
    /// Panics if `index >= self.size()` or the record was freed or
    /// reallocated through another handle.
    pub fn set(&mut self, index: usize, value: T) {
        if let Err(err) = self.try_set(index, value) {
            panic!("{err}");
        }
    }

    /// # Safety
    ///
    /// Same contract as [`ManagedArray::get_unchecked`].
    pub unsafe fn set_unchecked(&mut self, index: usize, value: T) {
        debug_assert!(index < self.count);
        unsafe { self.active.add(index).write(value) }
    }

    /// # Safety
    ///
    /// No other handle may read or write the record while the slice is alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [T] {
        if self.active.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.active, self.count) }
    }

    /// Read-only view of the same record.
    pub fn read_only(&self) -> ManagedArray<T, ReadOnly> {
        ManagedArray {
            manager: self.manager.clone(),
            record: self.record,
            active: self.active,
            space: self.space,
            count: self.count,
            generation: self.generation,
            observable: self.observable,
            _access: PhantomData,
        }
    }

    #[cfg(feature = "raw-pointers")]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.active
    }
}

impl<T: Pod> From<ManagedArray<T, ReadWrite>> for ManagedArray<T, ReadOnly> {
    fn from(array: ManagedArray<T, ReadWrite>) -> Self {
        array.read_only()
    }
}

impl<T: Pod, A: Access> Default for ManagedArray<T, A> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Pod, A: Access> Clone for ManagedArray<T, A> {
    /// # Panics
    ///
    /// Panics when migrating into the current execution space fails. Use
    /// [`ManagedArray::try_clone`] to handle the error.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(err) => panic!("failed to copy managed array: {err}"),
        }
    }
}

impl<T: Pod, A: Access> fmt::Debug for ManagedArray<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedArray")
            .field("record", &self.record)
            .field("space", &self.space)
            .field("count", &self.count)
            .field("writes", &A::WRITES)
            .field("observable", &self.observable)
            .finish()
    }
}

/// Wrap externally allocated elements in a managed array.
///
/// The supplied data is the record's only valid copy, so the first copy of
/// the handle into another space reads it. With [`ReadWrite`] access `space`
/// is also registered as touched; with [`ReadOnly`] access no space is.
///
/// # Safety
///
/// `data` must be valid for `elements` elements for as long as the record
/// references it. With `owned = true` it must come from
/// [`ArrayManager::allocate_raw`] on the same manager.
pub unsafe fn make_managed_array<T: Pod, A: Access>(
    manager: &Arc<ArrayManager>,
    data: *mut T,
    elements: usize,
    space: ExecutionSpace,
    owned: bool,
) -> Result<ManagedArray<T, A>> {
    let ptr = SpacePtr::new(data.cast()).ok_or_else(|| Error::invalid_access("cannot manage a null pointer"))?;
    let element_size = size_of::<T>();
    let bytes = elements
        .checked_mul(element_size)
        .ok_or(Error::SizeOverflow { elements, element_size })?;

    let space = manager.resolve_space(space);
    // SAFETY: forwarded from the caller.
    let id = unsafe { manager.make_managed(ptr, bytes, element_size, space, owned)? };
    if A::WRITES {
        manager.register_touch(id, space)?;
    }
    let view = manager.slot_view(id, space)?;

    Ok(ManagedArray {
        manager: Some(Arc::clone(manager)),
        record: Some(id),
        active: data,
        space,
        count: elements,
        generation: view.generation,
        observable: true,
        _access: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles_are_inert() {
        let array = ManagedArray::<f32>::default();
        assert!(array.is_empty());
        assert_eq!(array.record(), None);
        assert!(array.try_clone().unwrap().is_empty());
        assert!(matches!(array.reset(), Err(Error::InvalidAccess(_))));
        assert!(unsafe { array.as_slice() }.is_empty());
    }

    #[test]
    fn test_allocate_requires_a_manager() {
        let mut array = ManagedArray::<u8>::null();
        assert!(matches!(
            array.allocate(4, ExecutionSpace::Host, None),
            Err(Error::InvalidAccess(_))
        ));
    }

    #[test]
    fn test_new_starts_zeroed_on_host() {
        let manager = ArrayManager::with_host_backend();
        let array = ManagedArray::<u64>::new(&manager, 5, ExecutionSpace::Unspecified).unwrap();
        assert_eq!(array.space(), ExecutionSpace::Host);
        assert_eq!(array.to_vec().unwrap(), vec![0; 5]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_get_out_of_range_panics() {
        let manager = ArrayManager::with_host_backend();
        let array = ManagedArray::<u8>::new(&manager, 2, ExecutionSpace::Host).unwrap();
        array.get(2);
    }

    #[test]
    fn test_copy_outside_scope_is_verbatim() {
        let manager = ArrayManager::with_host_backend();
        let array = ManagedArray::<u32>::new(&manager, 4, ExecutionSpace::Host).unwrap();
        let copy = array.clone();
        assert_eq!(copy.space(), ExecutionSpace::Host);
        assert_eq!(manager.stats().allocations, 1);
        assert_eq!(manager.stats().moves, 0);
    }

    #[test]
    fn test_pass_through_stays_verbatim_until_rearmed() {
        let manager = ArrayManager::with_host_backend();
        let array = ManagedArray::<u32>::new(&manager, 4, ExecutionSpace::Host).unwrap();
        let _scope = manager.enter_space(ExecutionSpace::Device);

        let passed = array.pass_through();
        let again = passed.clone();
        assert_eq!(again.space(), ExecutionSpace::Host);
        assert!(!again.is_observable());
        assert_eq!(manager.stats().moves, 0);

        let armed = again.observable().try_clone().unwrap();
        assert_eq!(armed.space(), ExecutionSpace::Device);
        assert_eq!(manager.stats().moves, 1);
    }

    #[test]
    fn test_read_only_copy_keeps_source_valid() {
        let manager = ArrayManager::with_host_backend();
        let mut array = ManagedArray::<u32>::new(&manager, 3, ExecutionSpace::Host).unwrap();
        array.set(1, 5);
        let view: ManagedArray<u32, ReadOnly> = array.clone().into();

        let on_device = {
            let _scope = manager.enter_space(ExecutionSpace::Device);
            view.clone()
        };
        assert_eq!(on_device.get(1), 5);

        let info = manager.record_snapshot(array.record().unwrap()).unwrap();
        assert_eq!(info.valid_spaces(), vec![ExecutionSpace::Host, ExecutionSpace::Device]);
    }

    #[test]
    fn test_move_to_points_handle_at_requested_space() {
        let manager = ArrayManager::with_host_backend();
        let mut array = ManagedArray::<i16>::new(&manager, 2, ExecutionSpace::Host).unwrap();
        array.set(0, -3);
        array.move_to(ExecutionSpace::Unified).unwrap();
        assert_eq!(array.space(), ExecutionSpace::Unified);
        assert_eq!(array.get(0), -3);
    }

    #[test]
    fn test_clear_leaves_record_alone() {
        let manager = ArrayManager::with_host_backend();
        let mut array = ManagedArray::<u8>::new(&manager, 8, ExecutionSpace::Host).unwrap();
        array.clear();
        assert!(array.record().is_none());
        assert_eq!(manager.total_num_arrays(), 1);
        assert_eq!(manager.total_size(), 8);
    }
}
