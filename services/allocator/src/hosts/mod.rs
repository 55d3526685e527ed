//! Physical hosts and their lifecycle.

pub mod host;
pub mod registry;
pub mod state_machine;

pub use host::{HardwareProfile, Host, DEFAULT_HARDWARE_POOL};
pub use registry::HostRegistry;
pub use state_machine::{
    Deadline, DeadlineKind, HostState, HostStateMachine, HostTimeouts, Owner, ReclamationKind,
};
