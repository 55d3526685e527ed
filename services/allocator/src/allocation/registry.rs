//! Index-keyed store of allocations.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rackalloc_id::{AllocationIndex, HostIndex};

use super::{Allocation, Requirements};
use crate::error::{AllocatorError, AllocatorResult};

/// Allocations by index. Indexes are handed out in increasing order and
/// never reused, even after an allocation is pruned.
#[derive(Debug)]
pub struct AllocationsRegistry {
    allocations: BTreeMap<AllocationIndex, Allocation>,
    next_index: AllocationIndex,
}

impl Default for AllocationsRegistry {
    fn default() -> Self {
        Self {
            allocations: BTreeMap::new(),
            next_index: AllocationIndex::FIRST,
        }
    }
}

impl AllocationsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new allocation over already reserved hosts.
    pub fn create(
        &mut self,
        requirements: Requirements,
        info: serde_json::Value,
        slots: BTreeMap<String, HostIndex>,
        heartbeat_timeout: Duration,
        now: Instant,
    ) -> &mut Allocation {
        let index = self.next_index;
        self.next_index = index.next();
        self.allocations.entry(index).or_insert_with(|| {
            Allocation::new(index, requirements, info, slots, heartbeat_timeout, now)
        })
    }

    pub fn by_index(&self, index: AllocationIndex) -> AllocatorResult<&Allocation> {
        self.allocations
            .get(&index)
            .ok_or_else(|| AllocatorError::not_found(format!("no allocation with index {index}")))
    }

    pub fn by_index_mut(&mut self, index: AllocationIndex) -> AllocatorResult<&mut Allocation> {
        self.allocations
            .get_mut(&index)
            .ok_or_else(|| AllocatorError::not_found(format!("no allocation with index {index}")))
    }

    /// Current allocations in index order. Each call starts a fresh pass.
    pub fn all(&self) -> impl Iterator<Item = &Allocation> + '_ {
        self.allocations.values()
    }

    /// Heartbeat several allocations. Every index is checked before any
    /// deadline moves, so a bad id leaves all of them untouched.
    pub fn heartbeat(&mut self, indexes: &[AllocationIndex], now: Instant) -> AllocatorResult<()> {
        for index in indexes {
            self.by_index(*index)?.ensure_active()?;
        }
        for index in indexes {
            self.by_index_mut(*index)?.heartbeat(now)?;
        }
        Ok(())
    }

    /// Drops released allocations whose retention has passed.
    pub fn prune_retired(&mut self, now: Instant, retention: Duration) -> Vec<AllocationIndex> {
        let retired: Vec<AllocationIndex> = self
            .allocations
            .values()
            .filter(|a| a.retired(now, retention))
            .map(Allocation::index)
            .collect();
        for index in &retired {
            self.allocations.remove(index);
        }
        retired
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.allocations.values().filter(|a| a.is_active()).count()
    }
}
