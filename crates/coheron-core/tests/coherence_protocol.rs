//! Integration tests for the coherence protocol through array handles

use coheron_core::{
    make_managed_array, Action, ArrayManager, Error, ExecutionSpace, ManagedArray, ReadOnly, ReadWrite, Result,
    UserCallback,
};
use parking_lot::Mutex;
use std::sync::Arc;

const HOST: ExecutionSpace = ExecutionSpace::Host;
const DEVICE: ExecutionSpace = ExecutionSpace::Device;

fn copy_into<A: coheron_core::Access>(
    manager: &ArrayManager,
    array: &ManagedArray<u32, A>,
    space: ExecutionSpace,
) -> Result<ManagedArray<u32, A>> {
    let _scope = manager.enter_space(space);
    array.try_clone()
}

// ============================================================================
// Host/device round trip
// ============================================================================

#[test]
fn test_host_device_round_trip() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 10, HOST)?;
    a.set(3, 42);
    let id = a.record().expect("allocated array has a record");

    // Write-class copy into the device: data follows, host becomes stale.
    let mut on_device = copy_into(&manager, &a, DEVICE)?;
    assert_eq!(on_device.space(), DEVICE);
    assert_eq!(on_device.get(3), 42);
    let info = manager.record_snapshot(id)?;
    assert_eq!(info.valid_spaces(), vec![DEVICE]);
    assert_eq!(info.touched_space, Some(DEVICE));

    on_device.set(3, 43);

    // A read on the device does not revive the host copy.
    let device_reader = copy_into(&manager, &on_device.read_only(), DEVICE)?;
    assert_eq!(device_reader.get(3), 43);
    assert!(!manager.record_snapshot(id)?.slot(HOST).valid);
    assert_eq!(manager.stats().moves, 1);

    // Reading back on the host refreshes it and leaves the device valid.
    let host_reader = copy_into(&manager, &a.read_only(), HOST)?;
    assert_eq!(host_reader.get(3), 43);
    assert_eq!(manager.record_snapshot(id)?.valid_spaces(), vec![HOST, DEVICE]);
    assert_eq!(manager.stats().moves, 2);

    // A write-class copy on the host invalidates the device.
    let host_writer = copy_into(&manager, &a, HOST)?;
    assert_eq!(host_writer.get(3), 43);
    assert_eq!(manager.record_snapshot(id)?.valid_spaces(), vec![HOST]);
    assert_eq!(manager.stats().moves, 2);
    Ok(())
}

#[test]
fn test_exactly_one_migration_after_invalidation() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let a = ManagedArray::<u32>::new(&manager, 16, HOST)?;

    copy_into(&manager, &a.read_only(), DEVICE)?;
    assert_eq!(manager.stats().moves, 1);

    copy_into(&manager, &a, HOST)?;
    for _ in 0..3 {
        copy_into(&manager, &a.read_only(), DEVICE)?;
    }
    assert_eq!(manager.stats().moves, 2);
    assert_eq!(manager.stats().bytes_moved, 2 * 16 * 4);
    Ok(())
}

#[test]
fn test_reads_share_across_all_spaces() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 4, HOST)?;
    a.set(0, 11);
    let view = a.read_only();

    for space in ExecutionSpace::STORAGE {
        assert_eq!(copy_into(&manager, &view, space)?.get(0), 11);
    }
    let info = manager.record_snapshot(view.record().expect("record"))?;
    assert_eq!(info.valid_spaces(), ExecutionSpace::STORAGE.to_vec());
    assert_eq!(manager.stats().moves, 3);
    Ok(())
}

#[test]
fn test_reset_then_access_never_copies() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 4, HOST)?;
    a.set(0, 9);
    copy_into(&manager, &a.read_only(), DEVICE)?;
    let moves = manager.stats().moves;

    a.reset()?;
    copy_into(&manager, &a, DEVICE)?;
    assert_eq!(manager.stats().moves, moves);

    a.reset()?;
    copy_into(&manager, &a.read_only(), ExecutionSpace::Unified)?;
    assert_eq!(manager.stats().moves, moves);
    Ok(())
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_free_releases_each_owned_slot_once() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u64>::new(&manager, 8, HOST)?;
    copy_into_u64(&manager, &a, DEVICE)?;
    assert_eq!(manager.total_size(), 2 * 64);

    a.free()?;
    assert_eq!(manager.backend_stats().frees, 2);
    assert_eq!(manager.total_num_arrays(), 0);
    assert!(a.is_empty());

    a.free()?;
    assert_eq!(manager.backend_stats().frees, 2);

    a.allocate(3, DEVICE, None)?;
    assert_eq!(a.size(), 3);
    assert_eq!(a.space(), DEVICE);
    assert_eq!(manager.total_num_arrays(), 1);
    Ok(())
}

fn copy_into_u64(manager: &ArrayManager, array: &ManagedArray<u64>, space: ExecutionSpace) -> Result<ManagedArray<u64>> {
    let _scope = manager.enter_space(space);
    array.try_clone()
}

#[test]
fn test_drop_keeps_storage() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let a = ManagedArray::<u8>::new(&manager, 32, HOST)?;
    let id = a.record().expect("record");
    drop(a.clone());
    drop(a);
    assert_eq!(manager.total_num_arrays(), 1);
    assert!(manager.record_snapshot(id)?.slot(HOST).allocated);
    manager.free(id)
}

#[test]
fn test_reallocate_preserves_prefix_per_space() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 4, HOST)?;
    for i in 0..4 {
        a.set(i, i as u32 + 1);
    }
    let device = copy_into(&manager, &a.read_only(), DEVICE)?;
    let id = device.record().expect("record");

    a.reallocate(6)?;
    assert_eq!(a.size(), 6);
    assert_eq!(a.to_vec()?, vec![1, 2, 3, 4, 0, 0]);
    assert_eq!(manager.element_count(id)?, 6);
    assert_eq!(manager.record_snapshot(id)?.valid_spaces(), vec![HOST, DEVICE]);

    // Both slots were valid, so the device copy is served without a move.
    let moves = manager.stats().moves;
    let on_device = copy_into(&manager, &a.read_only(), DEVICE)?;
    assert_eq!(on_device.to_vec()?, vec![1, 2, 3, 4, 0, 0]);
    assert_eq!(manager.stats().moves, moves);

    a.reallocate(2)?;
    assert_eq!(a.to_vec()?, vec![1, 2]);
    assert_eq!(manager.total_size(), 2 * 2 * 4);
    Ok(())
}

#[test]
fn test_make_managed_external_memory_is_not_released() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut external = vec![7u32; 100];

    let mut a: ManagedArray<u32, ReadWrite> =
        unsafe { make_managed_array(&manager, external.as_mut_ptr(), 100, HOST, false)? };
    assert_eq!(a.get(99), 7);

    let on_device = copy_into(&manager, &a, DEVICE)?;
    assert_eq!(on_device.get(50), 7);

    a.free()?;
    assert_eq!(manager.backend_stats().frees, 1, "only the device slot");
    assert_eq!(external[0], 7);
    Ok(())
}

#[test]
fn test_make_managed_read_only_keeps_external_data_valid() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut external = vec![7u32; 8];

    let view: ManagedArray<u32, ReadOnly> =
        unsafe { make_managed_array(&manager, external.as_mut_ptr(), 8, HOST, false)? };
    let info = manager.record_snapshot(view.record().expect("record"))?;
    assert_eq!(info.valid_spaces(), vec![HOST]);
    assert_eq!(info.touched_space, None);

    let on_device = copy_into(&manager, &view, DEVICE)?;
    assert_eq!(on_device.to_vec()?, vec![7; 8]);
    assert_eq!(manager.stats().moves, 1);
    assert_eq!(
        manager.record_snapshot(view.record().expect("record"))?.valid_spaces(),
        vec![HOST, DEVICE]
    );
    Ok(())
}

#[test]
fn test_make_managed_with_raw_ownership() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let raw = manager.allocate_raw(DEVICE, 16 * 4)?;

    let mut a: ManagedArray<u32> = unsafe { make_managed_array(&manager, raw.cast(), 16, DEVICE, true)? };
    assert!(manager.record_snapshot(a.record().expect("record"))?.slot(DEVICE).owned);
    a.free()?;
    assert_eq!(manager.backend_stats().frees, 1);
    Ok(())
}

#[test]
fn test_free_space_of_only_valid_slot_hands_data_to_remaining_slot() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 4, HOST)?;
    let id = a.record().expect("record");
    let mut on_device = copy_into(&manager, &a, DEVICE)?;
    on_device.set(2, 99);
    assert_eq!(manager.record_snapshot(id)?.valid_spaces(), vec![DEVICE]);

    a.free_space(DEVICE)?;
    let info = manager.record_snapshot(id)?;
    assert_eq!(info.valid_spaces(), vec![HOST]);
    assert_eq!(info.touched_space, Some(HOST));
    assert_eq!(info.allocated_spaces(), vec![HOST]);
    assert_eq!(a.size(), 4, "handle still points at its host slot");
    assert_eq!(a.get(2), 99);

    let moves = manager.stats().moves;
    let back_on_device = copy_into(&manager, &a.read_only(), DEVICE)?;
    assert_eq!(back_on_device.get(2), 99);
    assert_eq!(manager.stats().moves, moves + 1);
    Ok(())
}

// ============================================================================
// Handles outliving their storage
// ============================================================================

#[test]
fn test_handle_sharing_a_freed_record_cannot_read_it() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 4096, HOST)?;
    a.set(0, 0xdead_beef);
    let b = a.clone();

    a.free()?;
    assert!(matches!(b.try_get(0), Err(Error::InvalidAccess(_))));
    assert!(matches!(b.to_vec(), Err(Error::InvalidAccess(_))));
    assert!(matches!(copy_into(&manager, &b, DEVICE), Err(Error::InvalidAccess(_))));
    Ok(())
}

#[test]
#[should_panic(expected = "freed or reallocated")]
fn test_get_through_stale_handle_panics() {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 16, HOST).unwrap();
    let b = a.clone();
    a.free().unwrap();
    b.get(0);
}

#[test]
fn test_reallocate_through_one_handle_stales_the_others() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u32>::new(&manager, 4, HOST)?;
    let mut b = a.clone();

    a.reallocate(64)?;
    a.set(63, 5);
    assert!(matches!(b.try_set(0, 1), Err(Error::InvalidAccess(_))));

    // Moving re-reads the record, so the stale handle becomes usable again.
    b.move_to(HOST)?;
    assert_eq!(b.size(), 64);
    assert_eq!(b.try_get(63)?, 5);
    Ok(())
}

#[test]
fn test_out_of_range_access_is_an_error() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let mut a = ManagedArray::<u8>::new(&manager, 3, HOST)?;
    assert!(matches!(a.try_get(3), Err(Error::InvalidAccess(_))));
    assert!(matches!(a.try_set(3, 1), Err(Error::InvalidAccess(_))));
    a.try_set(2, 1)?;
    assert_eq!(a.try_get(2)?, 1);
    Ok(())
}

// ============================================================================
// Callbacks
// ============================================================================

#[test]
fn test_handle_callback_sees_protocol_events() -> Result<()> {
    let manager = ArrayManager::with_host_backend();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: UserCallback = Arc::new(move |action, space, bytes| sink.lock().push((action, space, bytes)));

    let mut a = ManagedArray::<u16>::with_manager(&manager);
    a.allocate(4, HOST, Some(callback))?;
    copy_into_u16(&manager, &a, DEVICE)?;
    a.reallocate(2)?;

    let events = events.lock().clone();
    assert_eq!(
        events,
        vec![
            (Action::Alloc, HOST, 8),
            (Action::Alloc, DEVICE, 8),
            (Action::Move, DEVICE, 8),
            (Action::Alloc, HOST, 4),
            (Action::Free, HOST, 8),
            (Action::Alloc, DEVICE, 4),
            (Action::Free, DEVICE, 8),
        ]
    );
    Ok(())
}

fn copy_into_u16(manager: &ArrayManager, array: &ManagedArray<u16>, space: ExecutionSpace) -> Result<ManagedArray<u16>> {
    let _scope = manager.enter_space(space);
    array.try_clone()
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn test_configured_default_space() -> Result<()> {
    let config = coheron_core::ManagerConfig::from_json_str(r#"{ "default_space": "unified", "alignment": 128 }"#)?;
    let manager = ArrayManager::from_config(config)?;
    assert!(manager.set_default_allocation_space(HOST).is_err());

    let a = ManagedArray::<u8>::new(&manager, 1, ExecutionSpace::Unspecified)?;
    assert_eq!(a.space(), ExecutionSpace::Unified);
    let ptr = manager
        .pointer_for(a.record().expect("record"), ExecutionSpace::Unified)?
        .expect("unified slot");
    assert_eq!(ptr.addr() % 128, 0);
    Ok(())
}
