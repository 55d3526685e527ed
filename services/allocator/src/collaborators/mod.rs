//! Interfaces to the systems around the allocator.
//!
//! The engine never calls these directly. Provisioning, power and broadcast
//! calls are queued as effects and run by the effect dispatcher; PXE,
//! credential and artifact calls are made by command handlers after the
//! engine lock is released.

pub mod artifacts;
pub mod broadcast;
pub mod mock;
pub mod ssh;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rackalloc_events::EventEnvelope;
use rackalloc_id::HostId;
use rackalloc_networking::{MacAddress, SshCredentials};
use tracing::info;

use crate::hosts::Host;
use crate::status::PostMortem;

pub use artifacts::FsArtifactStore;
pub use broadcast::{LogBroadcaster, WebhookBroadcaster};
pub use mock::RecordingCollaborators;
pub use ssh::PortForwardTranslator;

/// Drives image provisioning ("inauguration") on hosts.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Ask the host to boot into the given image label.
    async fn provide_label(&self, host: &Host, label: &str, hint: Option<&str>) -> Result<()>;

    /// Begin a quick reclamation: a soft reset back to the idle image.
    async fn soft_reclaim(&self, host: &Host) -> Result<()>;
}

/// Out-of-band power control.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Power cycle the host. Used for slow reclamation and client requests.
    async fn cold_restart(&self, host: &Host) -> Result<()>;
}

/// Per-MAC network boot control.
#[async_trait]
pub trait PxeControl: Send + Sync {
    /// Stop answering PXE requests from this MAC.
    async fn disable_pxe(&self, mac: MacAddress) -> Result<()>;

    /// Answer PXE requests from this MAC again.
    async fn enable_pxe(&self, mac: MacAddress) -> Result<()>;
}

/// Turns in-rack SSH credentials into ones a client can use.
pub trait CredentialTranslator: Send + Sync {
    fn translate(&self, host: &Host) -> Result<SshCredentials>;
}

/// Publishes allocation lifecycle events.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope<serde_json::Value>) -> Result<()>;
}

/// Serial logs and post-mortem packs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Where the serial log of a host lives, for references in post-mortems.
    fn serial_log_location(&self, host: &HostId) -> String;

    /// The serial log of a host, if one was captured.
    async fn serial_log(&self, host: &HostId) -> Result<Option<String>>;

    /// Stores a post-mortem pack and returns where it was written.
    async fn store_post_mortem(&self, pack: &PostMortem) -> Result<String>;
}

/// Every collaborator the allocator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn Provisioner>,
    pub power: Arc<dyn PowerControl>,
    pub pxe: Arc<dyn PxeControl>,
    pub credentials: Arc<dyn CredentialTranslator>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

// =============================================================================
// Logging defaults
// =============================================================================

/// Provisioner, power and PXE control that only log.
///
/// Used when the allocator runs without real rack control; hosts are then
/// driven entirely through the host event endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRackControl;

#[async_trait]
impl Provisioner for LoggingRackControl {
    async fn provide_label(&self, host: &Host, label: &str, hint: Option<&str>) -> Result<()> {
        info!(host = %host.id, label, hint, "provide label");
        Ok(())
    }

    async fn soft_reclaim(&self, host: &Host) -> Result<()> {
        info!(host = %host.id, "soft reclaim");
        Ok(())
    }
}

#[async_trait]
impl PowerControl for LoggingRackControl {
    async fn cold_restart(&self, host: &Host) -> Result<()> {
        info!(host = %host.id, "cold restart");
        Ok(())
    }
}

#[async_trait]
impl PxeControl for LoggingRackControl {
    async fn disable_pxe(&self, mac: MacAddress) -> Result<()> {
        info!(mac = %mac, "PXE disabled");
        Ok(())
    }

    async fn enable_pxe(&self, mac: MacAddress) -> Result<()> {
        info!(mac = %mac, "PXE enabled");
        Ok(())
    }
}
