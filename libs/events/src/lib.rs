//! # rackalloc-events
//!
//! Allocation lifecycle events published by the allocator.
//!
//! ## Design Principles
//!
//! - Events are notifications, not the source of truth: the allocator state
//!   is authoritative and publishing is best-effort
//! - Every event belongs to exactly one allocation
//! - Events are versioned for schema evolution
//!
//! ## Event Types
//!
//! - `allocation.created`: hosts reserved, provisioning started
//! - `allocation.node_inaugurated`: one node reached its requested image
//! - `allocation.done`: every node is inaugurated
//! - `allocation.freed`: the client released the allocation
//! - `allocation.dead`: heartbeat timeout or provisioning failure

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
