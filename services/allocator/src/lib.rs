//! rackalloc allocator library.
//!
//! This crate primarily ships the `allocator` binary, but we expose the
//! engine and the HTTP surface as a library to enable integration testing
//! and reuse.

pub mod allocation;
pub mod api;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod deadlines;
pub mod effects;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod inventory;
pub mod state;
pub mod status;
