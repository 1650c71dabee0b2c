//! Allocator trait and the types it is expressed in

mod traits;
mod types;

pub use traits::SpaceAllocator;
pub use types::{BackendStats, ExecutionSpace, ParseSpaceError, SpacePtr, DEFAULT_ALIGNMENT};
