//! A single client allocation.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rackalloc_events::DeathReason;
use rackalloc_id::{AllocationIndex, HostIndex};

use super::Requirements;
use crate::error::{AllocatorError, AllocatorResult};

/// Whether the client still holds the allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Active,
    /// Released by the client.
    Freed,
    Dead(DeathReason),
}

/// Progress reported when a slot reaches INAUGURATION_DONE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inaugurated {
    pub node_name: String,
    /// This slot was the last one outstanding.
    pub became_done: bool,
}

/// One client request and the hosts reserved for it.
///
/// The slot mapping is fixed at creation. `held` shrinks as hosts are
/// reclaimed and checked back in; the allocation is retired once it is no
/// longer active, holds nothing and its retention has passed.
#[derive(Debug, Clone)]
pub struct Allocation {
    index: AllocationIndex,
    requirements: Requirements,
    info: serde_json::Value,
    slots: BTreeMap<String, HostIndex>,
    held: BTreeSet<HostIndex>,
    inaugurated: BTreeSet<String>,
    committed: Option<BTreeMap<String, HostIndex>>,
    liveness: Liveness,
    heartbeat_timeout: Duration,
    heartbeat_deadline: Option<Instant>,
    created_at: DateTime<Utc>,
    released_at: Option<Instant>,
}

impl Allocation {
    pub fn new(
        index: AllocationIndex,
        requirements: Requirements,
        info: serde_json::Value,
        slots: BTreeMap<String, HostIndex>,
        heartbeat_timeout: Duration,
        now: Instant,
    ) -> Self {
        Self {
            index,
            requirements,
            info,
            held: slots.values().copied().collect(),
            slots,
            inaugurated: BTreeSet::new(),
            committed: None,
            liveness: Liveness::Active,
            heartbeat_timeout,
            heartbeat_deadline: Some(now + heartbeat_timeout),
            created_at: Utc::now(),
            released_at: None,
        }
    }

    pub fn index(&self) -> AllocationIndex {
        self.index
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    pub fn info(&self) -> &serde_json::Value {
        &self.info
    }

    /// Node name to host, as reserved at creation.
    pub fn slots(&self) -> &BTreeMap<String, HostIndex> {
        &self.slots
    }

    /// Hosts still attached to this allocation.
    pub fn held(&self) -> &BTreeSet<HostIndex> {
        &self.held
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn is_active(&self) -> bool {
        self.liveness == Liveness::Active
    }

    pub fn done(&self) -> bool {
        self.committed.is_some()
    }

    pub fn dead(&self) -> bool {
        matches!(self.liveness, Liveness::Dead(_))
    }

    pub fn death_reason(&self) -> Option<&DeathReason> {
        match &self.liveness {
            Liveness::Dead(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.heartbeat_deadline
    }

    pub fn slot_of(&self, host: HostIndex) -> Option<&str> {
        self.slots
            .iter()
            .find(|(_, index)| **index == host)
            .map(|(name, _)| name.as_str())
    }

    /// Fails with a NotFound-class error unless the client still holds it.
    pub fn ensure_active(&self) -> AllocatorResult<()> {
        match &self.liveness {
            Liveness::Active => Ok(()),
            Liveness::Freed => Err(AllocatorError::not_found(format!(
                "allocation {} was freed",
                self.index
            ))),
            Liveness::Dead(reason) => Err(AllocatorError::not_found(format!(
                "allocation {} is dead: {reason}",
                self.index
            ))),
        }
    }

    /// Pushes the heartbeat deadline forward.
    pub fn heartbeat(&mut self, now: Instant) -> AllocatorResult<()> {
        self.ensure_active()?;
        self.heartbeat_deadline = Some(now + self.heartbeat_timeout);
        Ok(())
    }

    pub fn heartbeat_expired(&self, now: Instant) -> bool {
        self.is_active() && self.heartbeat_deadline.is_some_and(|at| at <= now)
    }

    /// Records that a slot's host finished inauguration.
    ///
    /// Returns `None` if the host does not back a slot of this allocation.
    pub fn mark_inaugurated(&mut self, host: HostIndex) -> Option<Inaugurated> {
        let node_name = self.slot_of(host)?.to_string();
        self.inaugurated.insert(node_name.clone());
        let became_done = self.committed.is_none() && self.inaugurated.len() == self.slots.len();
        if became_done {
            self.committed = Some(self.slots.clone());
        }
        Some(Inaugurated {
            node_name,
            became_done,
        })
    }

    /// Slots whose host reached INAUGURATION_DONE so far.
    pub fn inaugurated(&self) -> impl Iterator<Item = (&str, HostIndex)> + '_ {
        self.inaugurated
            .iter()
            .filter_map(|name| self.slots.get(name).map(|index| (name.as_str(), *index)))
    }

    /// The committed node mapping. Readable once done, and only while the
    /// client still holds the allocation.
    pub fn allocated(&self) -> AllocatorResult<&BTreeMap<String, HostIndex>> {
        match &self.liveness {
            Liveness::Active => {}
            Liveness::Freed => {
                return Err(AllocatorError::precondition(format!(
                    "allocation {} was freed",
                    self.index
                )));
            }
            Liveness::Dead(reason) => {
                return Err(AllocatorError::precondition(format!(
                    "allocation {} is dead: {reason}",
                    self.index
                )));
            }
        }
        self.committed.as_ref().ok_or_else(|| {
            AllocatorError::precondition(format!("allocation {} is not done", self.index))
        })
    }

    /// The committed mapping regardless of liveness, for status reporting.
    pub fn committed(&self) -> Option<&BTreeMap<String, HostIndex>> {
        self.committed.as_ref()
    }

    /// Client release. Returns `false` if already released or dead.
    pub fn free(&mut self, now: Instant) -> bool {
        self.release(Liveness::Freed, now)
    }

    /// Marks the allocation dead. Returns `false` if already released or dead.
    pub fn kill(&mut self, reason: DeathReason, now: Instant) -> bool {
        self.release(Liveness::Dead(reason), now)
    }

    fn release(&mut self, liveness: Liveness, now: Instant) -> bool {
        if !self.is_active() {
            return false;
        }
        self.liveness = liveness;
        self.heartbeat_deadline = None;
        self.released_at = Some(now);
        true
    }

    /// Detaches a host once it has been reclaimed.
    pub fn release_host(&mut self, host: HostIndex) -> bool {
        self.held.remove(&host)
    }

    /// Released, holding no hosts and past its retention.
    pub fn retired(&self, now: Instant, retention: Duration) -> bool {
        self.held.is_empty()
            && self
                .released_at
                .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }
}
