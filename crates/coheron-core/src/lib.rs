//! # Coheron Core
//!
//! Arrays that live in several memory spaces at once, with copies kept
//! coherent by a central registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │    ManagedArray<T, A>  (handles, copies)    │
//! └──────────────────────┬──────────────────────┘
//!                        │  resolve_for_access
//! ┌──────────────────────▼──────────────────────┐
//! │ ArrayManager (records, protocol, scopes)    │
//! └──────────────────────┬──────────────────────┘
//!                        │  allocate / free / copy
//! ┌──────────────────────▼──────────────────────┐
//! │ SpaceAllocator (coheron-backends)           │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Each record holds at most one buffer per storage space. Reads from a space
//! whose buffer is stale copy current data in from a valid space first. A
//! write leaves only the written space valid.
//!
//! ## Example
//!
//! ```rust
//! use coheron_core::{ArrayManager, ExecutionSpace, ManagedArray};
//!
//! # fn main() -> coheron_core::Result<()> {
//! let manager = ArrayManager::with_host_backend();
//! let mut a = ManagedArray::<f32>::new(&manager, 4, ExecutionSpace::Host)?;
//! a.set(0, 1.5);
//!
//! let device_view = {
//!     let _scope = manager.enter_space(ExecutionSpace::Device);
//!     a.try_clone()?
//! };
//! assert_eq!(device_view.get(0), 1.5);
//!
//! a.free()?;
//! assert_eq!(manager.total_num_arrays(), 0);
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod config;
pub mod error;
pub mod manager;
pub mod record;

pub use array::{make_managed_array, Access, ManagedArray, ReadOnly, ReadWrite};
pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use manager::{ArrayManager, ExecutionScope, TransferStats};
pub use record::{Action, AllocationRecord, RecordId, RecordInfo, SlotInfo, SpaceSlot, UserCallback};

pub use coheron_backends::{BackendError, BackendStats, ExecutionSpace, HostBackend, SpaceAllocator, SpacePtr};
