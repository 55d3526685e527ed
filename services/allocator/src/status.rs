//! Read-only views of allocator state: the admin status snapshot and
//! post-mortem packs.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rackalloc_events::DeathReason;
use rackalloc_id::{AllocationIndex, HostId, HostIndex};
use rackalloc_networking::MacAddress;
use serde::Serialize;

use crate::allocation::{Allocation, Liveness};
use crate::engine::Engine;
use crate::error::AllocatorResult;
use crate::hosts::{HostState, HostStateMachine};

// =============================================================================
// admin.queryStatus
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub allocations: Vec<AllocationStatus>,
    pub hosts: Vec<HostStatus>,
    pub free_hosts: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStatus {
    pub index: AllocationIndex,
    pub allocation_info: serde_json::Value,
    /// Node name to host index; empty until done.
    pub allocated: BTreeMap<String, HostIndex>,
    /// True once the allocation is done or dead.
    pub done: bool,
    pub dead: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub death_reason: Option<DeathReason>,
    pub freed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub index: HostIndex,
    pub id: HostId,
    #[serde(rename = "primaryMACAddress")]
    pub primary_mac_address: MacAddress,
    #[serde(rename = "secondaryMACAddress")]
    pub secondary_mac_address: MacAddress,
    pub ip_address: Ipv4Addr,
    pub state: HostState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationIndex>,
    pub seconds_in_state: u64,
}

impl StatusSnapshot {
    pub fn capture(engine: &Engine, now: Instant) -> Self {
        Self {
            allocations: engine.allocations().all().map(AllocationStatus::from).collect(),
            hosts: engine
                .hosts()
                .iter()
                .map(|machine| HostStatus::capture(machine, now))
                .collect(),
            free_hosts: engine.pool().len(),
        }
    }
}

impl From<&Allocation> for AllocationStatus {
    fn from(allocation: &Allocation) -> Self {
        Self {
            index: allocation.index(),
            allocation_info: allocation.info().clone(),
            allocated: allocation.committed().cloned().unwrap_or_default(),
            done: allocation.dead() || allocation.done(),
            dead: allocation.dead(),
            death_reason: allocation.death_reason().cloned(),
            freed: *allocation.liveness() == Liveness::Freed,
        }
    }
}

impl HostStatus {
    fn capture(machine: &HostStateMachine, now: Instant) -> Self {
        let host = machine.host();
        Self {
            index: host.index,
            id: host.id.clone(),
            primary_mac_address: host.primary_mac,
            secondary_mac_address: host.secondary_mac,
            ip_address: host.ip_address,
            state: machine.state(),
            allocation: machine.owner().allocation(),
            seconds_in_state: machine.time_in_state(now).as_secs(),
        }
    }
}

// =============================================================================
// Post-mortem
// =============================================================================

/// Everything known about an allocation, kept for later debugging.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMortem {
    pub index: AllocationIndex,
    pub created_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub allocation_info: serde_json::Value,
    pub requirements: serde_json::Value,
    pub done: bool,
    pub dead: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub death_reason: Option<DeathReason>,
    pub nodes: Vec<PostMortemNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMortemNode {
    pub name: String,
    pub host_id: HostId,
    pub host_index: HostIndex,
    pub state: HostState,
    pub inaugurated: bool,
    pub serial_log: String,
}

impl PostMortem {
    /// Captures the pack for `index`. `serial_log` names where each host's
    /// serial log is kept.
    pub fn capture<F>(engine: &Engine, index: AllocationIndex, serial_log: F) -> AllocatorResult<Self>
    where
        F: Fn(&HostId) -> String,
    {
        let allocation = engine.allocations().by_index(index)?;
        let inaugurated: Vec<&str> = allocation.inaugurated().map(|(name, _)| name).collect();

        let mut nodes = Vec::with_capacity(allocation.slots().len());
        for (name, host) in allocation.slots() {
            let machine = engine.hosts().get(*host)?;
            let host_id = machine.host().id.clone();
            nodes.push(PostMortemNode {
                name: name.clone(),
                serial_log: serial_log(&host_id),
                host_id,
                host_index: *host,
                state: machine.state(),
                inaugurated: inaugurated.contains(&name.as_str()),
            });
        }

        Ok(Self {
            index,
            created_at: allocation.created_at(),
            captured_at: Utc::now(),
            allocation_info: allocation.info().clone(),
            requirements: allocation.requirements().raw().clone(),
            done: allocation.done(),
            dead: allocation.dead(),
            death_reason: allocation.death_reason().cloned(),
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::engine::EngineConfig;
    use crate::hosts::host::tests::test_host;

    fn engine(now: Instant) -> Engine {
        let mut engine = Engine::new(EngineConfig::default());
        for i in 0..2 {
            let index = engine.add_host(test_host(i), now).unwrap();
            engine.checked_in(index, now).unwrap();
        }
        engine
    }

    #[test]
    fn test_status_snapshot_shape() {
        let now = Instant::now();
        let mut engine = engine(now);
        let index = engine
            .allocate(&json!({"count": 1}), json!({"user": "ci"}), now)
            .unwrap();

        let json = serde_json::to_value(StatusSnapshot::capture(&engine, now)).unwrap();
        assert_eq!(json["freeHosts"], 1);
        assert_eq!(json["allocations"][0]["index"], index.value());
        assert_eq!(json["allocations"][0]["allocationInfo"]["user"], "ci");
        assert_eq!(json["allocations"][0]["allocated"], json!({}));
        assert_eq!(json["allocations"][0]["done"], false);

        let host = &json["hosts"][0];
        assert_eq!(host["id"], "server0");
        assert_eq!(host["primaryMACAddress"], "52:54:00:00:01:00");
        assert_eq!(host["ipAddress"], "192.168.1.10");
        assert_eq!(host["state"], "CHECKED_IN");
        assert_eq!(host["allocation"], index.value());
        assert_eq!(json["hosts"][1]["state"], "CHECKED_IN");
        assert!(json["hosts"][1].get("allocation").is_none());
    }

    #[test]
    fn test_dead_allocation_reports_done() {
        let now = Instant::now();
        let mut engine = engine(now);
        let index = engine.allocate(&json!({"count": 1}), json!(null), now).unwrap();
        engine
            .provisioning_failed(HostIndex::new(0), "no disk", now)
            .unwrap();

        let snapshot = StatusSnapshot::capture(&engine, now);
        let status = &snapshot.allocations[0];
        assert_eq!(status.index, index);
        assert!(status.done);
        assert!(status.dead);
        assert!(status.death_reason.is_some());
    }

    #[test]
    fn test_post_mortem_lists_nodes() {
        let now = Instant::now();
        let mut engine = engine(now);
        let index = engine
            .allocate(&json!({"count": 2, "imageLabel": "ubuntu"}), json!({"job": 7}), now)
            .unwrap();
        engine.label_provided(HostIndex::new(1), now).unwrap();
        engine.inauguration_done(HostIndex::new(1), now).unwrap();

        let pack = PostMortem::capture(&engine, index, |id| format!("/logs/{id}.log")).unwrap();
        assert_eq!(pack.requirements["imageLabel"], "ubuntu");
        assert_eq!(pack.allocation_info, json!({"job": 7}));
        assert_eq!(pack.nodes.len(), 2);
        assert_eq!(pack.nodes[0].serial_log, "/logs/server0.log");
        assert!(!pack.nodes[0].inaugurated);
        assert!(pack.nodes[1].inaugurated);
        assert_eq!(pack.nodes[1].state, HostState::InaugurationDone);
    }
}
