//! Networking utilities for the rack.
//!
//! This library provides helpers for:
//! - Rack IPv4 addressing (gateway, netmask, per-host addresses)
//! - MAC address parsing for PXE control
//! - Translating in-rack SSH endpoints to public port-forwarded endpoints

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// No address or port left for this host index.
    #[error("address space exhausted: {0}")]
    Exhausted(String),
}

// ============================================================================
// Rack Subnet
// ============================================================================

/// Offset of the first host address from the gateway.
///
/// Addresses between the gateway and this offset are reserved for rack
/// infrastructure (switches, power controllers).
pub const DEFAULT_FIRST_HOST_OFFSET: u32 = 10;

/// The rack's private IPv4 subnet.
///
/// The gateway doubles as the inaugurator/PXE server address; hosts get
/// `gateway + first_host_offset + index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RackSubnet {
    /// Gateway (and provisioning server) address.
    pub gateway: Ipv4Addr,

    /// Prefix length (e.g., 24 for 255.255.255.0).
    pub prefix_len: u8,

    /// Offset of host index 0 from the gateway.
    pub first_host_offset: u32,
}

impl RackSubnet {
    /// Create a subnet, validating the prefix length.
    pub fn new(gateway: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 30 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} leaves no room for hosts",
                prefix_len
            )));
        }

        Ok(Self {
            gateway,
            prefix_len,
            first_host_offset: DEFAULT_FIRST_HOST_OFFSET,
        })
    }

    /// Parse from `gateway/prefix` notation (e.g., "192.168.1.1/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let gateway = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(gateway, prefix_len)
    }

    /// Netmask in dotted-quad form.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix_len))
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.gateway) & mask_bits(self.prefix_len))
    }

    /// Broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !mask_bits(self.prefix_len))
    }

    /// Check if an address is within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_bits(self.prefix_len) == u32::from(self.network())
    }

    /// Address assigned to the host with the given index.
    pub fn host_address(&self, host_index: u32) -> Result<Ipv4Addr, NetworkError> {
        let addr = u32::from(self.gateway)
            .checked_add(self.first_host_offset)
            .and_then(|a| a.checked_add(host_index))
            .ok_or_else(|| NetworkError::Exhausted(format!("host index {}", host_index)))?;
        let addr = Ipv4Addr::from(addr);

        if !self.contains(addr) || addr == self.broadcast() {
            return Err(NetworkError::Exhausted(format!(
                "host index {} falls outside {}",
                host_index, self
            )));
        }

        Ok(addr)
    }

    /// First and last host address (DHCP range).
    pub fn host_range(&self) -> Result<(Ipv4Addr, Ipv4Addr), NetworkError> {
        let first = self.host_address(0)?;
        let last = Ipv4Addr::from(u32::from(self.broadcast()) - 1);
        Ok((first, last))
    }
}

impl std::fmt::Display for RackSubnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.gateway, self.prefix_len)
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

// ============================================================================
// MAC Addresses
// ============================================================================

/// A 48-bit Ethernet MAC address, rendered lower-case and colon separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = NetworkError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(NetworkError::InvalidMac(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SSH Port Forwarding
// ============================================================================

/// Default first public port used for per-host SSH forwarding.
pub const DEFAULT_SSH_BASE_PORT: u16 = 2000;

/// SSH credentials for reaching a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredentials {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Static port forwarding from the allocator's public address to each host's
/// SSH port: host `i` is reachable at `public_ip:(base_port + i)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshPortForwarding {
    pub public_ip: Ipv4Addr,
    pub base_port: u16,
}

impl SshPortForwarding {
    pub fn new(public_ip: Ipv4Addr) -> Self {
        Self {
            public_ip,
            base_port: DEFAULT_SSH_BASE_PORT,
        }
    }

    /// Public port for the given host index.
    pub fn public_port(&self, host_index: u32) -> Result<u16, NetworkError> {
        u16::try_from(host_index)
            .ok()
            .and_then(|i| self.base_port.checked_add(i))
            .ok_or_else(|| NetworkError::Exhausted(format!("no SSH port for host index {}", host_index)))
    }

    /// Rewrite in-rack credentials so a client outside the rack can use them.
    pub fn translate(
        &self,
        host_index: u32,
        credentials: &SshCredentials,
    ) -> Result<SshCredentials, NetworkError> {
        Ok(SshCredentials {
            hostname: self.public_ip.to_string(),
            port: self.public_port(host_index)?,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_from_cidr() {
        let subnet = RackSubnet::from_cidr("192.168.1.1/24").unwrap();
        assert_eq!(subnet.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn test_subnet_rejects_bad_input() {
        assert!(matches!(
            RackSubnet::from_cidr("192.168.1.1"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            RackSubnet::from_cidr("not-an-ip/24"),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(RackSubnet::from_cidr("10.0.0.1/31").is_err());
    }

    #[test]
    fn test_host_address() {
        let subnet = RackSubnet::from_cidr("192.168.1.1/24").unwrap();
        assert_eq!(subnet.host_address(0).unwrap(), Ipv4Addr::new(192, 168, 1, 11));
        assert_eq!(subnet.host_address(5).unwrap(), Ipv4Addr::new(192, 168, 1, 16));
        // 1 + 10 + 243 = 254 is the last usable address
        assert!(subnet.host_address(243).is_ok());
        assert!(subnet.host_address(244).is_err());
    }

    #[test]
    fn test_host_range() {
        let subnet = RackSubnet::from_cidr("10.0.0.1/16").unwrap();
        let (first, last) = subnet.host_range().unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 0, 11));
        assert_eq!(last, Ipv4Addr::new(10, 0, 255, 254));
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "AA-bb-CC-00-11-2f".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:00:11:2f");
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x2f]);
    }

    #[test]
    fn test_mac_rejects_malformed() {
        for bad in ["", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:fg", "aaa:bb:cc:dd:ee:ff"] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_ssh_translation() {
        let forwarding = SshPortForwarding::new(Ipv4Addr::new(203, 0, 113, 7));
        let inner = SshCredentials {
            hostname: "192.168.1.14".to_string(),
            port: 22,
            username: "root".to_string(),
            password: "secret".to_string(),
        };
        let outer = forwarding.translate(3, &inner).unwrap();
        assert_eq!(outer.hostname, "203.0.113.7");
        assert_eq!(outer.port, 2003);
        assert_eq!(outer.username, "root");
    }

    #[test]
    fn test_ssh_port_overflow() {
        let forwarding = SshPortForwarding::new(Ipv4Addr::LOCALHOST);
        assert!(forwarding.public_port(70_000).is_err());
    }
}
