//! Walk an array from the host to the device and back, logging every
//! protocol step.
//!
//! ```text
//! COHERON_TRACING_PROFILE=coherence cargo run -p coheron-core --example host_device_roundtrip
//! ```

use coheron_core::{Action, ArrayManager, ExecutionSpace, ManagedArray, UserCallback};
use coheron_tracing::{init_global_tracing, TracingConfig};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_global_tracing(&TracingConfig::from_env())?;

    let manager = ArrayManager::from_env()?;
    let callback: UserCallback = Arc::new(|action, space, bytes| {
        let verb = match action {
            Action::Alloc => "allocated",
            Action::Free => "freed",
            Action::Move => "moved into",
        };
        println!("  {bytes} bytes {verb} {space}");
    });

    let mut a = ManagedArray::<u32>::with_manager(&manager);
    a.allocate(10, ExecutionSpace::Host, Some(callback))?;
    a.set(3, 42);
    println!("host wrote a[3] = {}", a.get(3));

    let mut on_device = {
        let _scope = manager.enter_space(ExecutionSpace::Device);
        a.try_clone()?
    };
    println!("device sees a[3] = {}", on_device.get(3));
    on_device.set(3, on_device.get(3) + 1);

    let back_on_host = {
        let _scope = manager.enter_space(ExecutionSpace::Host);
        a.read_only().try_clone()?
    };
    println!("host reads a[3] = {}", back_on_host.get(3));

    let stats = manager.stats();
    println!(
        "{} allocations, {} moves, {} bytes moved",
        stats.allocations, stats.moves, stats.bytes_moved
    );

    a.free()?;
    Ok(())
}
