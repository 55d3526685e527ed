//! Allocator configuration.
//!
//! Every setting is a command line flag with a `RACKALLOC_*` environment
//! variable fallback.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rackalloc_networking::RackSubnet;

use crate::engine::EngineConfig;
use crate::hosts::HostTimeouts;

#[derive(Debug, Clone, Parser)]
#[command(name = "allocator")]
#[command(author, version, about = "Physical host allocator", long_about = None)]
pub struct Args {
    /// Address the HTTP API listens on.
    #[arg(long, env = "RACKALLOC_LISTEN_ADDR", default_value = "127.0.0.1:7000")]
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "RACKALLOC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Rack inventory (TOML).
    #[arg(long, env = "RACKALLOC_INVENTORY", default_value = "/etc/rackalloc/rack.toml")]
    pub inventory: PathBuf,

    /// Directory holding per-host serial logs.
    #[arg(long, env = "RACKALLOC_SERIAL_LOGS_DIR", default_value = "/var/lib/rackalloc/serial")]
    pub serial_logs_dir: PathBuf,

    /// Directory post-mortem packs are written to.
    #[arg(
        long,
        env = "RACKALLOC_POST_MORTEM_DIR",
        default_value = "/var/lib/rackalloc/post-mortems"
    )]
    pub post_mortem_dir: PathBuf,

    /// Address clients use to reach forwarded SSH ports.
    #[arg(long, env = "RACKALLOC_PUBLIC_IP", default_value = "127.0.0.1")]
    pub public_ip: Ipv4Addr,

    /// Rack subnet as gateway/prefix, e.g. 192.168.1.1/24.
    #[arg(long, env = "RACKALLOC_SUBNET", default_value = "192.168.1.1/24")]
    pub subnet: String,

    /// Image provisioning server handed to nodes. Defaults to the gateway.
    #[arg(long, env = "RACKALLOC_PROVISIONING_SERVER_IP")]
    pub provisioning_server_ip: Option<Ipv4Addr>,

    /// Webhook receiving allocation events. Events are only logged if unset.
    #[arg(long, env = "RACKALLOC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    #[arg(long, env = "RACKALLOC_HEARTBEAT_TIMEOUT_SECS", default_value_t = 60)]
    pub heartbeat_timeout_secs: u64,

    #[arg(long, env = "RACKALLOC_LABEL_DEADLINE_SECS", default_value_t = 60)]
    pub label_deadline_secs: u64,

    #[arg(long, env = "RACKALLOC_INAUGURATION_DEADLINE_SECS", default_value_t = 600)]
    pub inauguration_deadline_secs: u64,

    #[arg(long, env = "RACKALLOC_QUICK_RECLAMATION_TIMEOUT_SECS", default_value_t = 180)]
    pub quick_reclamation_timeout_secs: u64,

    #[arg(long, env = "RACKALLOC_SLOW_RECLAMATION_TIMEOUT_SECS", default_value_t = 900)]
    pub slow_reclamation_timeout_secs: u64,

    /// Slow reclamation attempts before a host is destroyed.
    #[arg(long, env = "RACKALLOC_MAX_SLOW_RECLAMATION_ATTEMPTS", default_value_t = 3)]
    pub max_slow_reclamation_attempts: u32,

    /// How long released allocations stay queryable.
    #[arg(long, env = "RACKALLOC_ALLOCATION_RETENTION_SECS", default_value_t = 600)]
    pub allocation_retention_secs: u64,

    /// Deadline worker period.
    #[arg(long, env = "RACKALLOC_TICK_INTERVAL_MS", default_value_t = 1000)]
    pub tick_interval_ms: u64,

    /// Image label used when a node names none.
    #[arg(long, env = "RACKALLOC_DEFAULT_IMAGE_LABEL", default_value = "default")]
    pub default_image_label: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub inventory: PathBuf,
    pub serial_logs_dir: PathBuf,
    pub post_mortem_dir: PathBuf,
    pub public_ip: Ipv4Addr,
    pub subnet: RackSubnet,
    pub provisioning_server_ip: Ipv4Addr,
    pub webhook_url: Option<String>,
    pub tick_interval: Duration,
    pub engine: EngineConfig,
}

impl Config {
    /// Parses the process command line and environment.
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Configuration from environment variables and defaults only.
    pub fn from_env() -> Result<Self> {
        Self::from_args(Args::try_parse_from(["allocator"])?)
    }

    pub fn from_args(args: Args) -> Result<Self> {
        let subnet = RackSubnet::from_cidr(&args.subnet)?;

        if args.max_slow_reclamation_attempts == 0 {
            anyhow::bail!("max slow reclamation attempts must be at least 1");
        }
        if args.tick_interval_ms == 0 {
            anyhow::bail!("tick interval must be positive");
        }
        if args.default_image_label.trim().is_empty() {
            anyhow::bail!("default image label must not be empty");
        }

        let engine = EngineConfig {
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            host_timeouts: HostTimeouts {
                label: Duration::from_secs(args.label_deadline_secs),
                inauguration: Duration::from_secs(args.inauguration_deadline_secs),
                quick_reclamation: Duration::from_secs(args.quick_reclamation_timeout_secs),
                slow_reclamation: Duration::from_secs(args.slow_reclamation_timeout_secs),
            },
            max_slow_attempts: args.max_slow_reclamation_attempts,
            allocation_retention: Duration::from_secs(args.allocation_retention_secs),
            default_image_label: args.default_image_label,
        };

        Ok(Self {
            listen_addr: args.listen_addr,
            log_level: args.log_level,
            inventory: args.inventory,
            serial_logs_dir: args.serial_logs_dir,
            post_mortem_dir: args.post_mortem_dir,
            public_ip: args.public_ip,
            provisioning_server_ip: args.provisioning_server_ip.unwrap_or(subnet.gateway),
            subnet,
            webhook_url: args.webhook_url.filter(|url| !url.trim().is_empty()),
            tick_interval: Duration::from_millis(args.tick_interval_ms),
            engine,
        })
    }
}
