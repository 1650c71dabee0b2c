//! Per-array allocation records
//!
//! An [`AllocationRecord`] is the registry's view of one logical array: which
//! spaces hold storage for it, which of those copies are current, and who
//! must release each pointer. Records are plain state; every transition that
//! touches the backend is driven by [`crate::ArrayManager`].

use coheron_backends::{ExecutionSpace, SpacePtr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identity of a record inside one [`crate::ArrayManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec{}", self.0)
    }
}

/// Memory event reported to user callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Alloc,
    Free,
    Move,
}

/// Observation hook called with `(action, space, bytes)`.
///
/// Callbacks run while the manager's lock is held: they must not call back
/// into the [`crate::ArrayManager`] that invoked them.
pub type UserCallback = Arc<dyn Fn(Action, ExecutionSpace, usize) + Send + Sync>;

/// Storage of one record in one space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceSlot {
    /// `None` until the first allocation in this space.
    pub pointer: Option<SpacePtr>,
    /// The bytes in this space are current.
    pub valid: bool,
    /// The record releases this pointer on free.
    pub owned: bool,
}

impl SpaceSlot {
    pub fn is_allocated(&self) -> bool {
        self.pointer.is_some()
    }
}

/// Registry entry for one logical array.
pub struct AllocationRecord {
    pub(crate) element_count: usize,
    pub(crate) element_size: usize,
    pub(crate) slots: [SpaceSlot; ExecutionSpace::COUNT],
    pub(crate) touched_space: Option<ExecutionSpace>,
    pub(crate) callback: Option<UserCallback>,
    /// Bumped whenever a slot pointer is released or replaced. Handles cache
    /// it and refuse element access once it moves on.
    pub(crate) generation: u64,
}

impl AllocationRecord {
    pub(crate) fn new(element_size: usize, callback: Option<UserCallback>) -> Self {
        Self {
            element_count: 0,
            element_size,
            slots: [SpaceSlot::default(); ExecutionSpace::COUNT],
            touched_space: None,
            callback,
            generation: 0,
        }
    }

    /// Size of every slot in bytes. The product was overflow-checked when the
    /// element count was set.
    pub(crate) fn bytes(&self) -> usize {
        self.element_count * self.element_size
    }

    /// # Panics
    ///
    /// Panics if `space` is `Unspecified`; callers resolve the default space first.
    pub(crate) fn slot(&self, space: ExecutionSpace) -> &SpaceSlot {
        &self.slots[storage_index(space)]
    }

    pub(crate) fn slot_mut(&mut self, space: ExecutionSpace) -> &mut SpaceSlot {
        &mut self.slots[storage_index(space)]
    }

    /// No slot holds current data: the next access is a first touch.
    pub(crate) fn is_first_touch(&self) -> bool {
        self.slots.iter().all(|slot| !slot.valid)
    }

    pub(crate) fn has_allocation(&self) -> bool {
        self.slots.iter().any(SpaceSlot::is_allocated)
    }

    /// Allocated spaces with their pointers, in storage order.
    pub(crate) fn allocated(&self) -> impl Iterator<Item = (ExecutionSpace, SpaceSlot)> + '_ {
        ExecutionSpace::STORAGE
            .into_iter()
            .zip(self.slots.iter().copied())
            .filter(|(_, slot)| slot.is_allocated())
    }

    /// Source for refreshing a stale slot: the last written space when it is
    /// still valid, otherwise the first valid space in storage order.
    pub(crate) fn migration_source(&self, exclude: ExecutionSpace) -> Option<(ExecutionSpace, SpacePtr)> {
        let touched = self
            .touched_space
            .filter(|&space| space != exclude && self.slot(space).valid);

        touched
            .into_iter()
            .chain(ExecutionSpace::STORAGE)
            .filter(|&space| space != exclude)
            .find_map(|space| {
                let slot = self.slot(space);
                match (slot.valid, slot.pointer) {
                    (true, Some(ptr)) => Some((space, ptr)),
                    _ => None,
                }
            })
    }

    /// Make `space` the single authoritative copy.
    pub(crate) fn mark_written(&mut self, space: ExecutionSpace) {
        for (candidate, slot) in ExecutionSpace::STORAGE.into_iter().zip(self.slots.iter_mut()) {
            slot.valid = candidate == space;
        }
        self.touched_space = Some(space);
    }

    /// Pointers handed out before this call may no longer be dereferenced.
    pub(crate) fn retire_pointers(&mut self) {
        self.generation += 1;
    }

    pub(crate) fn clear_validity(&mut self) {
        for slot in &mut self.slots {
            slot.valid = false;
        }
        self.touched_space = None;
    }

    pub(crate) fn notify(&self, global: Option<&UserCallback>, action: Action, space: ExecutionSpace, bytes: usize) {
        if let Some(callback) = &self.callback {
            callback(action, space, bytes);
        }
        if let Some(callback) = global {
            callback(action, space, bytes);
        }
    }

    pub(crate) fn info(&self) -> RecordInfo {
        let mut slots = [SlotInfo::default(); ExecutionSpace::COUNT];
        for (info, slot) in slots.iter_mut().zip(self.slots.iter()) {
            *info = SlotInfo {
                allocated: slot.is_allocated(),
                valid: slot.valid,
                owned: slot.owned,
            };
        }
        RecordInfo {
            element_count: self.element_count,
            element_size: self.element_size,
            touched_space: self.touched_space,
            slots,
        }
    }
}

fn storage_index(space: ExecutionSpace) -> usize {
    match space.index() {
        Some(index) => index,
        None => panic!("{space} has no storage slot"),
    }
}

/// Snapshot of one slot's flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub allocated: bool,
    pub valid: bool,
    pub owned: bool,
}

/// Snapshot of a record, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInfo {
    pub element_count: usize,
    pub element_size: usize,
    pub touched_space: Option<ExecutionSpace>,
    pub slots: [SlotInfo; ExecutionSpace::COUNT],
}

impl RecordInfo {
    /// # Panics
    ///
    /// Panics if `space` is `Unspecified`.
    pub fn slot(&self, space: ExecutionSpace) -> SlotInfo {
        self.slots[storage_index(space)]
    }

    /// Spaces currently holding valid data.
    pub fn valid_spaces(&self) -> Vec<ExecutionSpace> {
        ExecutionSpace::STORAGE
            .into_iter()
            .filter(|&space| self.slot(space).valid)
            .collect()
    }

    pub fn allocated_spaces(&self) -> Vec<ExecutionSpace> {
        ExecutionSpace::STORAGE
            .into_iter()
            .filter(|&space| self.slot(space).allocated)
            .collect()
    }
}
