//! Allocation requirement parsing and host matching.
//!
//! Clients send either a count of identical nodes:
//!
//! ```json
//! {"count": 2, "imageLabel": "ubuntu-24.04", "hardwareConstraints": {"minimumCpus": 8}}
//! ```
//!
//! or a map of named slots:
//!
//! ```json
//! {"master": {"imageLabel": "solvent-master"}, "worker": {"imageHint": "worker"}}
//! ```
//!
//! Counted requests expand to slots `node0`, `node1`, ...

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AllocatorError, AllocatorResult};
use crate::hosts::HardwareProfile;

/// Hardware a slot needs. Absent fields match any host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HardwareConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_ram_gb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

impl HardwareConstraints {
    pub fn matches(&self, profile: &HardwareProfile) -> bool {
        self.minimum_cpus.is_none_or(|cpus| profile.cpus >= cpus)
            && self.minimum_ram_gb.is_none_or(|ram| profile.ram_gb >= ram)
            && self.pool.as_ref().is_none_or(|pool| &profile.pool == pool)
    }

    /// How many constraints are set. More specific slots are matched first
    /// so a loose slot cannot take the only host a strict slot could use.
    pub fn specificity(&self) -> usize {
        usize::from(self.minimum_cpus.is_some())
            + usize::from(self.minimum_ram_gb.is_some())
            + usize::from(self.pool.is_some())
    }
}

/// One named slot as sent by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeRequirement {
    #[serde(default)]
    pub image_label: Option<String>,
    #[serde(default)]
    pub image_hint: Option<String>,
    #[serde(default)]
    pub hardware_constraints: HardwareConstraints,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CountedRequirement {
    count: u32,
    #[serde(default)]
    image_label: Option<String>,
    #[serde(default)]
    image_hint: Option<String>,
    #[serde(default)]
    hardware_constraints: HardwareConstraints,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRequirements {
    Counted(CountedRequirement),
    Named(BTreeMap<String, NodeRequirement>),
}

/// A slot after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRequirement {
    pub image_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_hint: Option<String>,
    pub hardware_constraints: HardwareConstraints,
}

impl SlotRequirement {
    pub fn matches(&self, profile: &HardwareProfile) -> bool {
        self.hardware_constraints.matches(profile)
    }
}

/// Validated requirements of one allocation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirements {
    slots: BTreeMap<String, SlotRequirement>,
    raw: serde_json::Value,
}

impl Requirements {
    /// Parses and validates a requirement document.
    ///
    /// A request for more than `capacity` nodes fails with
    /// InsufficientCapacity before any slot is built.
    pub fn parse(
        raw: &serde_json::Value,
        default_label: &str,
        capacity: usize,
    ) -> AllocatorResult<Self> {
        let parsed: RawRequirements = serde_json::from_value(raw.clone()).map_err(|e| {
            AllocatorError::invalid_arguments(format!("malformed requirements: {e}"))
        })?;

        let resolve = |label: Option<String>| label.unwrap_or_else(|| default_label.to_string());

        let slots: BTreeMap<String, SlotRequirement> = match parsed {
            RawRequirements::Counted(counted) => {
                if counted.count == 0 {
                    return Err(AllocatorError::invalid_arguments(
                        "requirement count must be at least 1",
                    ));
                }
                ensure_capacity(counted.count as usize, capacity)?;
                let slot = SlotRequirement {
                    image_label: resolve(counted.image_label),
                    image_hint: counted.image_hint,
                    hardware_constraints: counted.hardware_constraints,
                };
                (0..counted.count)
                    .map(|i| (format!("node{i}"), slot.clone()))
                    .collect()
            }
            RawRequirements::Named(named) => {
                if let Some(name) = named.keys().find(|name| name.trim().is_empty()) {
                    return Err(AllocatorError::invalid_arguments(format!(
                        "invalid node name {name:?}"
                    )));
                }
                ensure_capacity(named.len(), capacity)?;
                named
                    .into_iter()
                    .map(|(name, node)| {
                        let slot = SlotRequirement {
                            image_label: resolve(node.image_label),
                            image_hint: node.image_hint,
                            hardware_constraints: node.hardware_constraints,
                        };
                        (name, slot)
                    })
                    .collect()
            }
        };

        if slots.is_empty() {
            return Err(AllocatorError::invalid_arguments(
                "requirements must name at least one node",
            ));
        }

        Ok(Self {
            slots,
            raw: raw.clone(),
        })
    }

    pub fn slots(&self) -> &BTreeMap<String, SlotRequirement> {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&SlotRequirement> {
        self.slots.get(name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The document as the client sent it.
    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// Slot names, most constrained first, ties broken by name.
    pub fn matching_order(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        names.sort_by_key(|name| {
            std::cmp::Reverse(self.slots[*name].hardware_constraints.specificity())
        });
        names
    }
}

fn ensure_capacity(requested: usize, capacity: usize) -> AllocatorResult<()> {
    if requested > capacity {
        return Err(AllocatorError::InsufficientCapacity(format!(
            "{requested} nodes requested, rack has {capacity} hosts"
        )));
    }
    Ok(())
}
