//! Emulated address space: permission-tagged regions with checked access.

/// Permission model and access-failure types.
pub mod access;
/// Ordered region map.
pub mod map;

pub use access::{AccessKind, MemoryError, Permissions};
pub use map::{
    align_up, AddressSpace, RegionInfo, ADDRESS_LIMIT, ALLOCATION_FLOOR, ALLOCATION_GRANULARITY,
    PAGE_SIZE,
};
