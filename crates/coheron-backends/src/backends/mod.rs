//! Concrete allocator implementations

pub mod host;

pub use host::HostBackend;
