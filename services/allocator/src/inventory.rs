//! Rack inventory loading.
//!
//! The inventory is a TOML list of hosts. A host's index is its position in
//! the list, which also fixes its default IP address and its forwarded SSH
//! port, so hosts should only ever be appended.
//!
//! ```toml
//! [[hosts]]
//! id = "rack01-server01"
//! primary_mac = "52:54:00:12:34:01"
//! secondary_mac = "52:54:00:12:35:01"
//!
//! [hosts.hardware]
//! pool = "default"
//! cpus = 32
//! ram_gb = 128
//!
//! [hosts.ssh]
//! password = "secret"
//! ```

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use rackalloc_id::{HostId, HostIndex};
use rackalloc_networking::{MacAddress, RackSubnet, SshCredentials};
use serde::Deserialize;

use crate::hosts::{HardwareProfile, Host};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: Vec<InventoryHost>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryHost {
    pub id: HostId,
    pub primary_mac: MacAddress,
    pub secondary_mac: MacAddress,
    /// Overrides the subnet-derived address.
    #[serde(default)]
    pub ip_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub hardware: HardwareProfile,
    #[serde(default)]
    pub ssh: InventorySsh,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventorySsh {
    pub username: String,
    pub password: String,
    pub port: u16,
}

impl Default for InventorySsh {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: String::new(),
            port: 22,
        }
    }
}

impl Inventory {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading inventory {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing inventory {}", path.display()))
    }

    /// Builds host descriptors, assigning indexes and addresses.
    pub fn into_hosts(self, subnet: &RackSubnet) -> Result<Vec<Host>> {
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_macs = std::collections::HashSet::new();
        let mut hosts = Vec::with_capacity(self.hosts.len());

        for (position, entry) in self.hosts.into_iter().enumerate() {
            let index = u32::try_from(position).context("too many hosts")?;
            if !seen_ids.insert(entry.id.clone()) {
                anyhow::bail!("duplicate host id {}", entry.id);
            }
            for mac in [entry.primary_mac, entry.secondary_mac] {
                if !seen_macs.insert(mac) {
                    anyhow::bail!("duplicate MAC address {} (host {})", mac, entry.id);
                }
            }

            let ip_address = match entry.ip_address {
                Some(addr) => addr,
                None => subnet
                    .host_address(index)
                    .with_context(|| format!("no address for host {}", entry.id))?,
            };

            hosts.push(Host {
                index: HostIndex::new(index),
                id: entry.id,
                primary_mac: entry.primary_mac,
                secondary_mac: entry.secondary_mac,
                ip_address,
                ssh: SshCredentials {
                    hostname: ip_address.to_string(),
                    port: entry.ssh.port,
                    username: entry.ssh.username,
                    password: entry.ssh.password,
                },
                hardware: entry.hardware,
            });
        }

        Ok(hosts)
    }
}
