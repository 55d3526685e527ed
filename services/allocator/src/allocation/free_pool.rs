//! The set of idle, clean hosts available for allocation.

use std::collections::{BTreeMap, BTreeSet};

use rackalloc_id::HostIndex;

use super::Requirements;
use crate::error::{AllocatorError, AllocatorResult};
use crate::hosts::{HostRegistry, HostState, HostStateMachine, Owner};

/// Hosts owned by nobody but the pool. Every member is CHECKED_IN.
///
/// Selection is deterministic: the lowest host index that matches wins.
#[derive(Debug, Default)]
pub struct FreePool {
    members: BTreeSet<HostIndex>,
}

impl FreePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, index: HostIndex) -> bool {
        self.members.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = HostIndex> + '_ {
        self.members.iter().copied()
    }

    /// Re-admits a host. It must be CHECKED_IN and not already pooled.
    pub fn return_host(&mut self, machine: &mut HostStateMachine) -> AllocatorResult<()> {
        let index = machine.host().index;
        if machine.state() != HostState::CheckedIn {
            return Err(AllocatorError::precondition(format!(
                "host {} is {}; only CHECKED_IN hosts may join the free pool",
                machine.host().id,
                machine.state()
            )));
        }
        if !self.members.insert(index) {
            return Err(AllocatorError::precondition(format!(
                "host {} is already in the free pool",
                machine.host().id
            )));
        }
        machine.set_owner(Owner::FreePool);
        Ok(())
    }

    /// Drops a host from the pool, e.g. when it is destroyed.
    pub fn remove(&mut self, index: HostIndex) -> bool {
        self.members.remove(&index)
    }

    /// Takes `count` hosts accepted by `accept`, lowest index first.
    ///
    /// All-or-nothing: if fewer match, the pool is left untouched.
    pub fn take_matching<F>(
        &mut self,
        hosts: &HostRegistry,
        count: usize,
        mut accept: F,
    ) -> AllocatorResult<Vec<HostIndex>>
    where
        F: FnMut(&HostStateMachine) -> bool,
    {
        let chosen: Vec<HostIndex> = self
            .members
            .iter()
            .copied()
            .filter(|index| hosts.get(*index).map(&mut accept).unwrap_or(false))
            .take(count)
            .collect();

        if chosen.len() < count {
            return Err(AllocatorError::InsufficientCapacity(format!(
                "needed {count} matching hosts, {} available",
                chosen.len()
            )));
        }
        for index in &chosen {
            self.members.remove(index);
        }
        Ok(chosen)
    }

    /// Reserves one host per slot of `requirements`.
    ///
    /// Slots are matched most-constrained first. On failure every host
    /// reserved by this call is put back, leaving the pool as it was.
    pub fn reserve(
        &mut self,
        hosts: &HostRegistry,
        requirements: &Requirements,
    ) -> AllocatorResult<BTreeMap<String, HostIndex>> {
        let mut reserved = BTreeMap::new();
        for name in requirements.matching_order() {
            let Some(slot) = requirements.slot(name) else {
                continue;
            };
            match self.take_matching(hosts, 1, |machine| slot.matches(&machine.host().hardware)) {
                Ok(taken) => {
                    reserved.extend(taken.into_iter().map(|index| (name.to_string(), index)));
                }
                Err(_) => {
                    self.members.extend(reserved.values().copied());
                    return Err(AllocatorError::InsufficientCapacity(format!(
                        "no free host satisfies node {name:?} ({} of {} nodes matched, {} hosts free)",
                        reserved.len(),
                        requirements.len(),
                        self.members.len()
                    )));
                }
            }
        }
        Ok(reserved)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::hosts::host::tests::test_host;
    use crate::hosts::{HardwareProfile, HostTimeouts};

    fn pooled_registry(profiles: &[HardwareProfile]) -> (HostRegistry, FreePool) {
        let now = Instant::now();
        let mut hosts = HostRegistry::new();
        let mut pool = FreePool::new();
        for (i, profile) in profiles.iter().enumerate() {
            let mut host = test_host(i as u32);
            host.hardware = profile.clone();
            let index = hosts.add(host, HostTimeouts::default(), now).unwrap();
            let machine = hosts.get_mut(index).unwrap();
            machine.checked_in(now).unwrap();
            pool.return_host(machine).unwrap();
        }
        (hosts, pool)
    }

    fn profile(pool: &str, cpus: u32) -> HardwareProfile {
        HardwareProfile {
            pool: pool.to_string(),
            cpus,
            ram_gb: 8,
        }
    }

    #[test]
    fn test_take_lowest_index_first() {
        let (hosts, mut pool) = pooled_registry(&vec![HardwareProfile::default(); 4]);
        let taken = pool.take_matching(&hosts, 2, |_| true).unwrap();
        assert_eq!(taken, vec![HostIndex::new(0), HostIndex::new(1)]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_take_is_all_or_nothing() {
        let (hosts, mut pool) = pooled_registry(&vec![HardwareProfile::default(); 2]);
        let err = pool.take_matching(&hosts, 3, |_| true).unwrap_err();
        assert!(matches!(err, AllocatorError::InsufficientCapacity(_)));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_return_requires_checked_in() {
        let now = Instant::now();
        let mut hosts = HostRegistry::new();
        let index = hosts
            .add(test_host(0), HostTimeouts::default(), now)
            .unwrap();
        let mut pool = FreePool::new();

        let machine = hosts.get_mut(index).unwrap();
        assert!(pool.return_host(machine).is_err());

        machine.checked_in(now).unwrap();
        pool.return_host(machine).unwrap();
        assert_eq!(machine.owner(), Owner::FreePool);
        assert!(matches!(
            pool.return_host(machine),
            Err(AllocatorError::PreconditionFailed(_))
        ));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_reserve_prefers_constrained_slots() {
        // Host 0 is the only gpu host; the loose slot must not take it.
        let (hosts, mut pool) =
            pooled_registry(&[profile("gpu", 32), profile("default", 4)]);
        let reqs = Requirements::parse(
            &json!({
                "any": {},
                "trainer": {"hardwareConstraints": {"pool": "gpu"}}
            }),
            "default",
            16,
        )
        .unwrap();

        let reserved = pool.reserve(&hosts, &reqs).unwrap();
        assert_eq!(reserved["trainer"], HostIndex::new(0));
        assert_eq!(reserved["any"], HostIndex::new(1));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_reserve_failure_restores_pool() {
        let (hosts, mut pool) =
            pooled_registry(&[profile("default", 4), profile("default", 4), profile("gpu", 8)]);
        let before: Vec<_> = pool.iter().collect();
        let reqs = Requirements::parse(
            &json!({
                "a": {"hardwareConstraints": {"pool": "gpu"}},
                "b": {"hardwareConstraints": {"pool": "gpu"}}
            }),
            "default",
            16,
        )
        .unwrap();

        let err = pool.reserve(&hosts, &reqs).unwrap_err();
        assert!(matches!(err, AllocatorError::InsufficientCapacity(_)));
        assert_eq!(pool.iter().collect::<Vec<_>>(), before);
    }

    proptest! {
        #[test]
        fn prop_reserve_is_atomic_and_disjoint(
            cpus in prop::collection::vec(1u32..16, 1..12),
            requests in prop::collection::vec((1u32..4, 1u32..16), 1..6),
        ) {
            let profiles: Vec<_> = cpus.iter().map(|c| profile("default", *c)).collect();
            let (hosts, mut pool) = pooled_registry(&profiles);
            let mut owned: BTreeSet<HostIndex> = BTreeSet::new();

            for (count, min_cpus) in requests {
                let before: Vec<_> = pool.iter().collect();
                let reqs = Requirements::parse(
                    &json!({"count": count, "hardwareConstraints": {"minimumCpus": min_cpus}}),
                    "default",
                    16,
                )
                .unwrap();

                match pool.reserve(&hosts, &reqs) {
                    Ok(reserved) => {
                        prop_assert_eq!(reserved.len(), count as usize);
                        for index in reserved.values() {
                            prop_assert!(owned.insert(*index), "host reserved twice");
                            prop_assert!(!pool.contains(*index));
                            prop_assert!(hosts.get(*index).unwrap().host().hardware.cpus >= min_cpus);
                        }
                    }
                    Err(_) => {
                        prop_assert_eq!(pool.iter().collect::<Vec<_>>(), before);
                    }
                }
                prop_assert_eq!(pool.len() + owned.len(), profiles.len());
            }
        }
    }
}
