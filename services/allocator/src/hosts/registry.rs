//! Canonical set of known hosts.

use std::collections::HashMap;
use std::time::Instant;

use rackalloc_id::{HostId, HostIndex};

use super::{Host, HostStateMachine, HostTimeouts};
use crate::error::{AllocatorError, AllocatorResult};

/// All hosts, keyed by index, with a secondary lookup by id.
///
/// Hosts are never removed: a destroyed host stays visible in status.
#[derive(Debug, Default)]
pub struct HostRegistry {
    machines: Vec<HostStateMachine>,
    by_id: HashMap<HostId, HostIndex>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly discovered host. Its index must be the next free one.
    pub fn add(
        &mut self,
        host: Host,
        timeouts: HostTimeouts,
        now: Instant,
    ) -> AllocatorResult<HostIndex> {
        if self.by_id.contains_key(&host.id) {
            return Err(AllocatorError::precondition(format!(
                "host {} is already registered",
                host.id
            )));
        }
        let expected = HostIndex::new(self.machines.len() as u32);
        if host.index != expected {
            return Err(AllocatorError::precondition(format!(
                "host {} has index {}, expected {}",
                host.id, host.index, expected
            )));
        }
        let index = host.index;
        self.by_id.insert(host.id.clone(), index);
        self.machines
            .push(HostStateMachine::discovered(host, timeouts, now));
        Ok(index)
    }

    pub fn get(&self, index: HostIndex) -> AllocatorResult<&HostStateMachine> {
        self.machines
            .get(index.value() as usize)
            .ok_or_else(|| AllocatorError::not_found(format!("no host with index {index}")))
    }

    pub fn get_mut(&mut self, index: HostIndex) -> AllocatorResult<&mut HostStateMachine> {
        self.machines
            .get_mut(index.value() as usize)
            .ok_or_else(|| AllocatorError::not_found(format!("no host with index {index}")))
    }

    pub fn index_of(&self, id: &HostId) -> AllocatorResult<HostIndex> {
        self.by_id
            .get(id)
            .copied()
            .ok_or_else(|| AllocatorError::not_found(format!("unknown host {id}")))
    }

    pub fn by_id(&self, id: &HostId) -> AllocatorResult<&HostStateMachine> {
        self.get(self.index_of(id)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostStateMachine> {
        self.machines.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HostStateMachine> {
        self.machines.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
