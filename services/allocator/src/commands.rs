//! The client command surface.
//!
//! Requests arrive as `{"cmd": <name>, "arguments": {...}}`. The name picks
//! a command from a fixed table and the arguments are decoded into that
//! command's own struct, rejecting unknown fields. Execution takes the
//! engine lock only for engine work; PXE, credential and power calls happen
//! after it is released.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use rackalloc_id::{AllocationIndex, HostId};
use rackalloc_networking::{MacAddress, SshCredentials};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{AllocatorError, AllocatorResult};
use crate::hosts::Host;
use crate::state::{AppState, NodeNetwork};
use crate::status::StatusSnapshot;

/// Protocol version spoken by this allocator.
pub const API_VERSION: u32 = 1;

/// Reply to a successful heartbeat.
pub const HEARTBEAT_OK: &str = "OK";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRequest {
    pub cmd: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Handshake,
    Allocate,
    AllocationNodes,
    AllocationFree,
    AllocationDone,
    AllocationDead,
    Heartbeat,
    DisablePxe,
    EnablePxe,
    RootSshCredentials,
    ColdRestart,
    QueryStatus,
}

impl CommandName {
    const TABLE: [(&'static str, CommandName); 12] = [
        ("handshake", CommandName::Handshake),
        ("allocate", CommandName::Allocate),
        ("allocation.nodes", CommandName::AllocationNodes),
        ("allocation.free", CommandName::AllocationFree),
        ("allocation.done", CommandName::AllocationDone),
        ("allocation.dead", CommandName::AllocationDead),
        ("heartbeat", CommandName::Heartbeat),
        ("disablepxe", CommandName::DisablePxe),
        ("enablepxe", CommandName::EnablePxe),
        ("node.rootSSHCredentials", CommandName::RootSshCredentials),
        ("node.coldRestart", CommandName::ColdRestart),
        ("admin.queryStatus", CommandName::QueryStatus),
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, command)| *command)
    }

    pub fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, command)| *command == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HandshakeArgs {
    pub version_info: VersionInfo,
}

/// Client version details. Fields beyond the API version are informational.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub api_version: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AllocateArgs {
    pub requirements: Value,
    #[serde(default)]
    pub allocation_info: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdArgs {
    pub id: AllocationIndex,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatArgs {
    pub ids: Vec<AllocationIndex>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacArgs {
    pub mac: MacAddress,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeArgs {
    #[serde(rename = "allocationID")]
    pub allocation_id: AllocationIndex,
    #[serde(rename = "nodeID")]
    pub node_id: HostId,
}

/// A decoded command.
#[derive(Debug, Clone)]
pub enum Command {
    Handshake(HandshakeArgs),
    Allocate(AllocateArgs),
    AllocationNodes(IdArgs),
    AllocationFree(IdArgs),
    AllocationDone(IdArgs),
    AllocationDead(IdArgs),
    Heartbeat(HeartbeatArgs),
    DisablePxe(MacArgs),
    EnablePxe(MacArgs),
    RootSshCredentials(NodeArgs),
    ColdRestart(NodeArgs),
    QueryStatus,
}

fn arguments<T: DeserializeOwned>(name: CommandName, arguments: Value) -> AllocatorResult<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| {
        AllocatorError::invalid_arguments(format!("bad arguments for {}: {e}", name.name()))
    })
}

impl Command {
    pub fn parse(request: CommandRequest) -> AllocatorResult<Self> {
        let name = CommandName::from_name(&request.cmd).ok_or_else(|| {
            AllocatorError::invalid_arguments(format!("unknown command {:?}", request.cmd))
        })?;
        let args = request.arguments;
        let command = match name {
            CommandName::Handshake => Command::Handshake(arguments(name, args)?),
            CommandName::Allocate => Command::Allocate(arguments(name, args)?),
            CommandName::AllocationNodes => Command::AllocationNodes(arguments(name, args)?),
            CommandName::AllocationFree => Command::AllocationFree(arguments(name, args)?),
            CommandName::AllocationDone => Command::AllocationDone(arguments(name, args)?),
            CommandName::AllocationDead => Command::AllocationDead(arguments(name, args)?),
            CommandName::Heartbeat => Command::Heartbeat(arguments(name, args)?),
            CommandName::DisablePxe => Command::DisablePxe(arguments(name, args)?),
            CommandName::EnablePxe => Command::EnablePxe(arguments(name, args)?),
            CommandName::RootSshCredentials => {
                Command::RootSshCredentials(arguments(name, args)?)
            }
            CommandName::ColdRestart => Command::ColdRestart(arguments(name, args)?),
            CommandName::QueryStatus => {
                let _: NoArgs = arguments(name, args)?;
                Command::QueryStatus
            }
        };
        Ok(command)
    }

    pub fn name(&self) -> CommandName {
        match self {
            Command::Handshake(_) => CommandName::Handshake,
            Command::Allocate(_) => CommandName::Allocate,
            Command::AllocationNodes(_) => CommandName::AllocationNodes,
            Command::AllocationFree(_) => CommandName::AllocationFree,
            Command::AllocationDone(_) => CommandName::AllocationDone,
            Command::AllocationDead(_) => CommandName::AllocationDead,
            Command::Heartbeat(_) => CommandName::Heartbeat,
            Command::DisablePxe(_) => CommandName::DisablePxe,
            Command::EnablePxe(_) => CommandName::EnablePxe,
            Command::RootSshCredentials(_) => CommandName::RootSshCredentials,
            Command::ColdRestart(_) => CommandName::ColdRestart,
            Command::QueryStatus => CommandName::QueryStatus,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

/// One node of a done allocation, as returned by `allocation.nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: HostId,
    #[serde(rename = "primaryMACAddress")]
    pub primary_mac_address: MacAddress,
    #[serde(rename = "secondaryMACAddress")]
    pub secondary_mac_address: MacAddress,
    #[serde(rename = "ipAddress")]
    pub ip_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(rename = "inauguratorServerIP")]
    pub inaugurator_server_ip: Ipv4Addr,
    #[serde(rename = "provisioningServerIP")]
    pub provisioning_server_ip: Ipv4Addr,
}

impl NodeInfo {
    pub fn new(host: &Host, network: &NodeNetwork) -> Self {
        Self {
            id: host.id.clone(),
            primary_mac_address: host.primary_mac,
            secondary_mac_address: host.secondary_mac,
            ip_address: host.ip_address,
            netmask: network.netmask,
            gateway: network.gateway,
            inaugurator_server_ip: network.inaugurator_server_ip,
            provisioning_server_ip: network.provisioning_server_ip,
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

fn to_value<T: Serialize>(value: T) -> AllocatorResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| AllocatorError::Collaborator(format!("encoding response: {e}")))
}

fn collaborator_error(what: &str) -> impl FnOnce(anyhow::Error) -> AllocatorError + '_ {
    move |e| AllocatorError::Collaborator(format!("{what}: {e:#}"))
}

/// Runs a command and returns its result document.
pub async fn execute(state: &AppState, command: Command) -> AllocatorResult<Value> {
    match command {
        Command::Handshake(args) => {
            if args.version_info.api_version != API_VERSION {
                return Err(AllocatorError::ProtocolMismatch(format!(
                    "allocator API version is {API_VERSION}, client speaks {}",
                    args.version_info.api_version
                )));
            }
            Ok(Value::Null)
        }

        Command::Allocate(args) => {
            let index = state
                .with_engine(|engine, now| {
                    engine.allocate(&args.requirements, args.allocation_info, now)
                })
                .await?;
            to_value(index)
        }

        Command::AllocationNodes(IdArgs { id }) => {
            let network = state.network();
            let nodes: BTreeMap<String, NodeInfo> = state
                .with_engine(|engine, _| {
                    engine.nodes(id).map(|nodes| {
                        nodes
                            .into_iter()
                            .map(|(name, host)| (name, NodeInfo::new(host, network)))
                            .collect::<BTreeMap<_, _>>()
                    })
                })
                .await?;
            to_value(nodes)
        }

        Command::AllocationFree(IdArgs { id }) => {
            state.with_engine(|engine, now| engine.free(id, now)).await?;
            Ok(Value::Null)
        }

        Command::AllocationDone(IdArgs { id }) => {
            let done = state.with_engine(|engine, _| engine.done(id)).await?;
            Ok(Value::Bool(done))
        }

        Command::AllocationDead(IdArgs { id }) => {
            let dead = state.with_engine(|engine, _| engine.dead(id)).await?;
            Ok(Value::Bool(dead))
        }

        Command::Heartbeat(HeartbeatArgs { ids }) => {
            state
                .with_engine(|engine, now| engine.heartbeat(&ids, now))
                .await?;
            Ok(Value::String(HEARTBEAT_OK.to_string()))
        }

        Command::DisablePxe(MacArgs { mac }) => {
            state
                .collaborators()
                .pxe
                .disable_pxe(mac)
                .await
                .map_err(collaborator_error("disabling PXE"))?;
            Ok(Value::Null)
        }

        Command::EnablePxe(MacArgs { mac }) => {
            state
                .collaborators()
                .pxe
                .enable_pxe(mac)
                .await
                .map_err(collaborator_error("enabling PXE"))?;
            Ok(Value::Null)
        }

        Command::RootSshCredentials(args) => {
            let host = inaugurated_node(state, &args).await?;
            let credentials: SshCredentials = state
                .collaborators()
                .credentials
                .translate(&host)
                .map_err(collaborator_error("translating SSH credentials"))?;
            to_value(credentials)
        }

        Command::ColdRestart(args) => {
            let host = inaugurated_node(state, &args).await?;
            info!(
                allocation = %args.allocation_id,
                node = %args.node_id,
                "Cold restarting node by client request"
            );
            state
                .collaborators()
                .power
                .cold_restart(&host)
                .await
                .map_err(collaborator_error("cold restart"))?;
            Ok(Value::Null)
        }

        Command::QueryStatus => {
            let snapshot = state
                .with_engine(|engine, now| StatusSnapshot::capture(engine, now))
                .await;
            to_value(snapshot)
        }
    }
}

async fn inaugurated_node(state: &AppState, args: &NodeArgs) -> AllocatorResult<Host> {
    state
        .with_engine(|engine, _| {
            engine
                .find_inaugurated_node(args.allocation_id, &args.node_id)
                .cloned()
        })
        .await
}
