//! Allocator error taxonomy.
//!
//! Every failure a command can produce is one of these kinds. The command
//! boundary turns them into the `{exceptionType, exceptionString}` envelope;
//! none of them is fatal to the process.

use rackalloc_id::HostId;
use thiserror::Error;

use crate::hosts::HostState;

/// Result type for allocator operations.
pub type AllocatorResult<T> = Result<T, AllocatorError>;

/// Errors produced by the allocation engine and the command layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocatorError {
    /// Unknown allocation index, host id or node id.
    #[error("{0}")]
    NotFound(String),

    /// Not enough free hosts match the requirements.
    #[error("{0}")]
    InsufficientCapacity(String),

    /// The operation is not allowed in the current allocation or host state.
    #[error("{0}")]
    PreconditionFailed(String),

    /// The host state machine does not have this edge.
    #[error("host {host} cannot move from {from} to {to}")]
    InvalidTransition {
        host: HostId,
        from: HostState,
        to: HostState,
    },

    /// Client and server speak different protocol versions.
    #[error("{0}")]
    ProtocolMismatch(String),

    /// A provisioning collaborator reported (or timed out on) a host.
    #[error("provisioning of {host} failed: {detail}")]
    ProvisioningFailure { host: HostId, detail: String },

    /// Command arguments did not match the command's schema.
    #[error("{0}")]
    InvalidArguments(String),

    /// A collaborator call made on behalf of a command failed.
    #[error("{0}")]
    Collaborator(String),
}

impl AllocatorError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    /// The `exceptionType` reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            AllocatorError::NotFound(_) => "NotFound",
            AllocatorError::InsufficientCapacity(_) => "InsufficientCapacity",
            AllocatorError::PreconditionFailed(_) => "PreconditionFailed",
            AllocatorError::InvalidTransition { .. } => "InvalidTransition",
            AllocatorError::ProtocolMismatch(_) => "ProtocolMismatch",
            AllocatorError::ProvisioningFailure { .. } => "ProvisioningFailure",
            AllocatorError::InvalidArguments(_) => "InvalidArguments",
            AllocatorError::Collaborator(_) => "CollaboratorFailure",
        }
    }
}

impl From<serde_json::Error> for AllocatorError {
    fn from(err: serde_json::Error) -> Self {
        AllocatorError::InvalidArguments(err.to_string())
    }
}
