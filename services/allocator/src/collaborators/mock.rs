//! Recording collaborators for tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rackalloc_events::EventEnvelope;
use rackalloc_id::HostId;
use rackalloc_networking::{MacAddress, SshCredentials};
use tracing::info;

use super::{
    ArtifactStore, Broadcaster, Collaborators, CredentialTranslator, PortForwardTranslator,
    PowerControl, Provisioner, PxeControl,
};
use crate::hosts::Host;
use crate::status::PostMortem;

/// One collaborator call, as recorded.
#[derive(Debug, Clone)]
pub enum Call {
    ProvideLabel { host: HostId, label: String },
    SoftReclaim(HostId),
    ColdRestart(HostId),
    DisablePxe(MacAddress),
    EnablePxe(MacAddress),
    Published(EventEnvelope<serde_json::Value>),
    PostMortem(PostMortem),
}

/// Records every call and otherwise succeeds, unless told to fail power
/// operations.
pub struct RecordingCollaborators {
    calls: Mutex<Vec<Call>>,
    serial_logs: Mutex<HashMap<HostId, String>>,
    translator: PortForwardTranslator,
    fail_power: bool,
}

impl RecordingCollaborators {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            serial_logs: Mutex::new(HashMap::new()),
            translator: PortForwardTranslator::new(Ipv4Addr::new(10, 0, 0, 1)),
            fail_power: false,
        }
    }

    /// Power control calls fail.
    pub fn failing_power() -> Self {
        Self {
            fail_power: true,
            ..Self::new()
        }
    }

    /// Wraps this recorder as every collaborator.
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            provisioner: self.clone(),
            power: self.clone(),
            pxe: self.clone(),
            credentials: self.clone(),
            broadcaster: self.clone(),
            artifacts: self.clone(),
        }
    }

    pub fn set_serial_log(&self, host: HostId, log: impl Into<String>) {
        if let Ok(mut logs) = self.serial_logs.lock() {
            logs.insert(host, log.into());
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Event types published so far, in order.
    pub fn published(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Published(envelope) => Some(envelope.event_type),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Default for RecordingCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for RecordingCollaborators {
    async fn provide_label(&self, host: &Host, label: &str, _hint: Option<&str>) -> Result<()> {
        info!(host = %host.id, label, "[MOCK] provide label");
        self.record(Call::ProvideLabel {
            host: host.id.clone(),
            label: label.to_string(),
        });
        Ok(())
    }

    async fn soft_reclaim(&self, host: &Host) -> Result<()> {
        self.record(Call::SoftReclaim(host.id.clone()));
        Ok(())
    }
}

#[async_trait]
impl PowerControl for RecordingCollaborators {
    async fn cold_restart(&self, host: &Host) -> Result<()> {
        if self.fail_power {
            anyhow::bail!("power controller for {} unreachable", host.id);
        }
        self.record(Call::ColdRestart(host.id.clone()));
        Ok(())
    }
}

#[async_trait]
impl PxeControl for RecordingCollaborators {
    async fn disable_pxe(&self, mac: MacAddress) -> Result<()> {
        self.record(Call::DisablePxe(mac));
        Ok(())
    }

    async fn enable_pxe(&self, mac: MacAddress) -> Result<()> {
        self.record(Call::EnablePxe(mac));
        Ok(())
    }
}

impl CredentialTranslator for RecordingCollaborators {
    fn translate(&self, host: &Host) -> Result<SshCredentials> {
        self.translator.translate(host)
    }
}

#[async_trait]
impl Broadcaster for RecordingCollaborators {
    async fn publish(&self, envelope: &EventEnvelope<serde_json::Value>) -> Result<()> {
        self.record(Call::Published(envelope.clone()));
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for RecordingCollaborators {
    fn serial_log_location(&self, host: &HostId) -> String {
        format!("memory://serial/{host}")
    }

    async fn serial_log(&self, host: &HostId) -> Result<Option<String>> {
        Ok(self
            .serial_logs
            .lock()
            .ok()
            .and_then(|logs| logs.get(host).cloned()))
    }

    async fn store_post_mortem(&self, pack: &PostMortem) -> Result<String> {
        self.record(Call::PostMortem(pack.clone()));
        Ok(format!("memory://post-mortem/{}", pack.index))
    }
}
