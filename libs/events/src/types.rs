//! Allocation lifecycle events and their payloads.

use std::collections::BTreeMap;

use rackalloc_id::{AllocationIndex, HostId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const ALLOCATION_CREATED: &str = "allocation.created";
    pub const ALLOCATION_NODE_INAUGURATED: &str = "allocation.node_inaugurated";
    pub const ALLOCATION_DONE: &str = "allocation.done";
    pub const ALLOCATION_FREED: &str = "allocation.freed";
    pub const ALLOCATION_DEAD: &str = "allocation.dead";

    /// Every event type this crate knows how to decode.
    pub const ALL: &[&str] = &[
        ALLOCATION_CREATED,
        ALLOCATION_NODE_INAUGURATED,
        ALLOCATION_DONE,
        ALLOCATION_FREED,
        ALLOCATION_DEAD,
    ];
}

// =============================================================================
// Reasons
// =============================================================================

/// Why an allocation died.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeathReason {
    /// The client stopped heartbeating.
    HeartbeatTimeout,

    /// A host could not be provisioned in time or reported a failure.
    ProvisioningFailure { host_id: HostId, detail: String },
}

impl std::fmt::Display for DeathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeathReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            DeathReason::ProvisioningFailure { host_id, detail } => {
                write!(f, "provisioning of {host_id} failed: {detail}")
            }
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload for `allocation.created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationCreatedPayload {
    pub index: AllocationIndex,
    /// Node name to reserved host.
    pub hosts: BTreeMap<String, HostId>,
    /// Opaque client-supplied allocation info.
    pub allocation_info: serde_json::Value,
}

/// Payload for `allocation.node_inaugurated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInauguratedPayload {
    pub index: AllocationIndex,
    pub node_name: String,
    pub host_id: HostId,
}

/// Payload for `allocation.done` and `allocation.freed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRefPayload {
    pub index: AllocationIndex,
}

/// Payload for `allocation.dead`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDeadPayload {
    pub index: AllocationIndex,
    pub reason: DeathReason,
}

// =============================================================================
// Typed Events
// =============================================================================

/// A lifecycle event published for an allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationEvent {
    Created(AllocationCreatedPayload),
    NodeInaugurated(NodeInauguratedPayload),
    Done(AllocationRefPayload),
    Freed(AllocationRefPayload),
    Dead(AllocationDeadPayload),
}

impl AllocationEvent {
    /// The dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            AllocationEvent::Created(_) => event_types::ALLOCATION_CREATED,
            AllocationEvent::NodeInaugurated(_) => event_types::ALLOCATION_NODE_INAUGURATED,
            AllocationEvent::Done(_) => event_types::ALLOCATION_DONE,
            AllocationEvent::Freed(_) => event_types::ALLOCATION_FREED,
            AllocationEvent::Dead(_) => event_types::ALLOCATION_DEAD,
        }
    }

    /// The allocation this event is about.
    pub fn index(&self) -> AllocationIndex {
        match self {
            AllocationEvent::Created(p) => p.index,
            AllocationEvent::NodeInaugurated(p) => p.index,
            AllocationEvent::Done(p) | AllocationEvent::Freed(p) => p.index,
            AllocationEvent::Dead(p) => p.index,
        }
    }

    /// Serializes the payload alone.
    pub fn payload_json(&self) -> Result<serde_json::Value, EventError> {
        let value = match self {
            AllocationEvent::Created(p) => serde_json::to_value(p)?,
            AllocationEvent::NodeInaugurated(p) => serde_json::to_value(p)?,
            AllocationEvent::Done(p) | AllocationEvent::Freed(p) => serde_json::to_value(p)?,
            AllocationEvent::Dead(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Rebuilds a typed event from its type name and payload.
    pub fn from_parts(event_type: &str, payload: serde_json::Value) -> Result<Self, EventError> {
        let event = match event_type {
            event_types::ALLOCATION_CREATED => {
                AllocationEvent::Created(serde_json::from_value(payload)?)
            }
            event_types::ALLOCATION_NODE_INAUGURATED => {
                AllocationEvent::NodeInaugurated(serde_json::from_value(payload)?)
            }
            event_types::ALLOCATION_DONE => AllocationEvent::Done(serde_json::from_value(payload)?),
            event_types::ALLOCATION_FREED => {
                AllocationEvent::Freed(serde_json::from_value(payload)?)
            }
            event_types::ALLOCATION_DEAD => AllocationEvent::Dead(serde_json::from_value(payload)?),
            other => return Err(EventError::UnknownEventType(other.to_string())),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str) -> HostId {
        HostId::parse(id).unwrap()
    }

    #[test]
    fn test_event_type_names_are_unique() {
        let unique: std::collections::HashSet<_> = event_types::ALL.iter().collect();
        assert_eq!(unique.len(), event_types::ALL.len());
    }

    #[test]
    fn test_death_reason_serialization() {
        let json = serde_json::to_value(DeathReason::HeartbeatTimeout).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "heartbeat_timeout"}));

        let json = serde_json::to_value(DeathReason::ProvisioningFailure {
            host_id: host("server1"),
            detail: "label deadline exceeded".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "provisioning_failure");
        assert_eq!(json["host_id"], "server1");
    }

    #[test]
    fn test_dead_event_decodes_from_parts() {
        let event = AllocationEvent::Dead(AllocationDeadPayload {
            index: AllocationIndex::new(4),
            reason: DeathReason::HeartbeatTimeout,
        });
        let payload = event.payload_json().unwrap();
        let decoded = AllocationEvent::from_parts(event.event_type(), payload).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.index(), AllocationIndex::new(4));
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result = AllocationEvent::from_parts("allocation.exploded", serde_json::json!({}));
        assert!(matches!(result, Err(EventError::UnknownEventType(_))));
    }
}
