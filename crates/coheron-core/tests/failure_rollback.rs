//! Failure handling: every failed operation leaves the record as it was

use coheron_core::{
    ArrayManager, BackendError, Error, ExecutionSpace, HostBackend, ManagedArray, ManagerConfig, SpaceAllocator,
    SpacePtr,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const HOST: ExecutionSpace = ExecutionSpace::Host;
const DEVICE: ExecutionSpace = ExecutionSpace::Device;

/// Switches shared between a test and its backend.
#[derive(Default)]
struct Faults {
    fail_copies: AtomicBool,
    /// Allocations still allowed before failing; `usize::MAX` for unlimited.
    allocations_left: AtomicUsize,
}

impl Faults {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_copies: AtomicBool::new(false),
            allocations_left: AtomicUsize::new(usize::MAX),
        })
    }

    fn allow_allocations(&self, count: usize) {
        self.allocations_left.store(count, Ordering::SeqCst);
    }
}

struct FaultyBackend {
    inner: HostBackend,
    faults: Arc<Faults>,
}

impl SpaceAllocator for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty-host"
    }

    fn allocate(&mut self, space: ExecutionSpace, bytes: usize) -> coheron_backends::Result<SpacePtr> {
        let left = self.faults.allocations_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(BackendError::OutOfMemory {
                space,
                requested: bytes,
                available: 0,
            });
        }
        if left != usize::MAX {
            self.faults.allocations_left.store(left - 1, Ordering::SeqCst);
        }
        self.inner.allocate(space, bytes)
    }

    fn free(&mut self, space: ExecutionSpace, ptr: SpacePtr) -> coheron_backends::Result<()> {
        self.inner.free(space, ptr)
    }

    unsafe fn copy(
        &mut self,
        src_space: ExecutionSpace,
        dst_space: ExecutionSpace,
        dst: SpacePtr,
        src: SpacePtr,
        bytes: usize,
    ) -> coheron_backends::Result<()> {
        if self.faults.fail_copies.load(Ordering::SeqCst) {
            return Err(BackendError::other("injected copy failure"));
        }
        unsafe { self.inner.copy(src_space, dst_space, dst, src, bytes) }
    }

    fn stats(&self) -> coheron_backends::BackendStats {
        self.inner.stats()
    }
}

fn faulty_manager() -> (Arc<ArrayManager>, Arc<Faults>) {
    let faults = Faults::new();
    let backend = FaultyBackend {
        inner: HostBackend::new(),
        faults: Arc::clone(&faults),
    };
    let manager = ArrayManager::new(backend, ManagerConfig::default()).expect("default config is valid");
    (manager, faults)
}

#[test]
fn test_failed_migration_keeps_source_valid() {
    let (manager, faults) = faulty_manager();
    let mut a = ManagedArray::<u32>::new(&manager, 8, HOST).unwrap();
    a.set(0, 5);
    let id = a.record().unwrap();

    faults.fail_copies.store(true, Ordering::SeqCst);
    let err = {
        let _scope = manager.enter_space(DEVICE);
        a.try_clone().unwrap_err()
    };
    assert!(matches!(err, Error::Transfer { from: HOST, to: DEVICE, .. }));

    let info = manager.record_snapshot(id).unwrap();
    assert_eq!(info.valid_spaces(), vec![HOST]);
    assert!(!info.slot(DEVICE).allocated, "fresh slot rolled back");
    assert_eq!(manager.backend_stats().frees, 1);
    assert_eq!(a.get(0), 5);

    faults.fail_copies.store(false, Ordering::SeqCst);
    let _scope = manager.enter_space(DEVICE);
    assert_eq!(a.try_clone().unwrap().get(0), 5);
}

#[test]
fn test_failed_allocation_during_resolve() {
    let (manager, faults) = faulty_manager();
    let a = ManagedArray::<u64>::new(&manager, 4, HOST).unwrap();

    faults.allow_allocations(0);
    let _scope = manager.enter_space(DEVICE);
    let err = a.try_clone().unwrap_err();
    assert!(err.is_allocation_error());
    assert_eq!(
        manager.record_snapshot(a.record().unwrap()).unwrap().allocated_spaces(),
        vec![HOST]
    );
}

#[test]
#[should_panic(expected = "failed to copy managed array")]
fn test_clone_panics_on_failure() {
    let (manager, faults) = faulty_manager();
    let a = ManagedArray::<u8>::new(&manager, 4, HOST).unwrap();
    faults.allow_allocations(0);
    let _scope = manager.enter_space(DEVICE);
    let _ = a.clone();
}

#[test]
fn test_failed_reallocate_leaves_record_unchanged() {
    let (manager, faults) = faulty_manager();
    let mut a = ManagedArray::<u32>::new(&manager, 4, HOST).unwrap();
    a.set(2, 3);
    {
        let _scope = manager.enter_space(DEVICE);
        let _ = a.read_only().try_clone().unwrap();
    }
    let id = a.record().unwrap();
    let before = manager.record_snapshot(id).unwrap();
    let host_before = manager.pointer_for(id, HOST).unwrap();

    // The second new buffer fails after the first was acquired.
    faults.allow_allocations(1);
    assert!(a.reallocate(16).unwrap_err().is_allocation_error());

    assert_eq!(manager.record_snapshot(id).unwrap(), before);
    assert_eq!(manager.pointer_for(id, HOST).unwrap(), host_before);
    assert_eq!(a.size(), 4);
    assert_eq!(a.get(2), 3);
    assert_eq!(manager.total_size(), 2 * 16);

    faults.allow_allocations(usize::MAX);
    faults.fail_copies.store(true, Ordering::SeqCst);
    assert!(matches!(a.reallocate(16), Err(Error::Transfer { .. })));
    assert_eq!(manager.record_snapshot(id).unwrap(), before);
    assert_eq!(manager.total_size(), 2 * 16);
}

#[test]
fn test_failed_hand_off_keeps_the_freed_slot() {
    let (manager, faults) = faulty_manager();
    let a = ManagedArray::<u32>::new(&manager, 4, HOST).unwrap();
    let id = a.record().unwrap();
    let mut on_device = {
        let _scope = manager.enter_space(DEVICE);
        a.try_clone().unwrap()
    };
    on_device.set(0, 12);

    faults.fail_copies.store(true, Ordering::SeqCst);
    let err = on_device.free_space(DEVICE).unwrap_err();
    assert!(matches!(err, Error::Transfer { from: DEVICE, to: HOST, .. }));

    let info = manager.record_snapshot(id).unwrap();
    assert_eq!(info.valid_spaces(), vec![DEVICE]);
    assert_eq!(info.allocated_spaces(), vec![HOST, DEVICE]);
    assert_eq!(on_device.get(0), 12);
}

#[test]
fn test_failed_replacement_keeps_old_slot() {
    let (manager, faults) = faulty_manager();
    let mut a = ManagedArray::<u32>::new(&manager, 2, HOST).unwrap();
    a.set(1, 8);
    let id = a.record().unwrap();

    faults.allow_allocations(0);
    assert!(manager.allocate(id, HOST, 2).unwrap_err().is_allocation_error());
    assert_eq!(a.get(1), 8);
    assert!(manager.record_snapshot(id).unwrap().slot(HOST).valid);
}

#[test]
fn test_capacity_limit_surfaces_out_of_memory() {
    let backend = HostBackend::new().with_capacity_limit(DEVICE, 64);
    let manager = ArrayManager::new(backend, ManagerConfig::default()).unwrap();
    let a = ManagedArray::<u64>::new(&manager, 16, HOST).unwrap();

    let _scope = manager.enter_space(DEVICE);
    match a.try_clone() {
        Err(Error::Allocation {
            space,
            bytes,
            source: BackendError::OutOfMemory { .. },
        }) => {
            assert_eq!(space, DEVICE);
            assert_eq!(bytes, 128);
        }
        other => panic!("expected out-of-memory, got {other:?}"),
    }
}

#[test]
fn test_failed_new_registers_nothing() {
    let (manager, faults) = faulty_manager();
    faults.allow_allocations(0);
    assert!(ManagedArray::<u8>::new(&manager, 4, HOST).is_err());
    assert_eq!(manager.total_num_arrays(), 0);
    assert_eq!(manager.total_size(), 0);
}
