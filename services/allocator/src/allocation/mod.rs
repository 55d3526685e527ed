//! Allocations: requirement matching, the free pool and the allocation
//! registry.

pub mod free_pool;
pub mod model;
pub mod registry;
pub mod requirements;

pub use free_pool::FreePool;
pub use model::{Allocation, Inaugurated, Liveness};
pub use registry::AllocationsRegistry;
pub use requirements::{HardwareConstraints, NodeRequirement, Requirements, SlotRequirement};
