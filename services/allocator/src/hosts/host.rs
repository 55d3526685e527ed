//! Immutable hardware descriptor of a physical host.

use std::net::Ipv4Addr;

use rackalloc_id::{HostId, HostIndex};
use rackalloc_networking::{MacAddress, SshCredentials};
use serde::{Deserialize, Serialize};

/// Pool used when the inventory does not name one.
pub const DEFAULT_HARDWARE_POOL: &str = "default";

/// What a host offers to requirement matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareProfile {
    pub pool: String,
    pub cpus: u32,
    pub ram_gb: u32,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            pool: DEFAULT_HARDWARE_POOL.to_string(),
            cpus: 1,
            ram_gb: 1,
        }
    }
}

/// A physical host as known from the rack inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub index: HostIndex,
    pub id: HostId,
    pub primary_mac: MacAddress,
    pub secondary_mac: MacAddress,
    pub ip_address: Ipv4Addr,
    pub ssh: SshCredentials,
    pub hardware: HardwareProfile,
}
