//! # rackalloc-id
//!
//! Identifier types for the rackalloc physical host allocator.
//!
//! ## Kinds of identifiers
//!
//! - [`HostId`]: operator-assigned, stable across restarts, taken from the
//!   rack inventory.
//! - [`HostIndex`] and [`AllocationIndex`]: dense numeric indexes handed out
//!   by the allocator. Allocation indexes are monotonic and never reused
//!   within a process lifetime.
//! - [`RequestId`] and [`EventId`]: ULID-based `{prefix}_{ulid}` ids used to
//!   correlate commands and broadcast events.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for the `define_id!` macro.
pub use ulid::Ulid;
