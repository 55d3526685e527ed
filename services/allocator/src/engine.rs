//! The allocation engine.
//!
//! All allocator state lives here: the host registry, the free pool and the
//! allocations. The engine is synchronous and is only ever touched under the
//! single lock held by [`crate::state::AppState`]. Operations never perform
//! I/O; instead they queue [`Effect`]s which the caller drains and hands to
//! the effect dispatcher once the lock is released.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rackalloc_events::{
    ActorType, AllocationCreatedPayload, AllocationDeadPayload, AllocationEvent,
    AllocationRefPayload, DeathReason, NodeInauguratedPayload,
};
use rackalloc_id::{AllocationIndex, HostId, HostIndex};
use tracing::{info, warn};

use crate::allocation::{AllocationsRegistry, FreePool, Requirements};
use crate::effects::Effect;
use crate::error::{AllocatorError, AllocatorResult};
use crate::hosts::{
    DeadlineKind, Host, HostRegistry, HostState, HostTimeouts, Owner, ReclamationKind,
};

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub heartbeat_timeout: Duration,
    pub host_timeouts: HostTimeouts,
    /// Slow reclamation attempts before a host is destroyed.
    pub max_slow_attempts: u32,
    /// How long a released allocation stays queryable after its hosts leave.
    pub allocation_retention: Duration,
    pub default_image_label: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            host_timeouts: HostTimeouts::default(),
            max_slow_attempts: 3,
            allocation_retention: Duration::from_secs(10 * 60),
            default_image_label: "default".to_string(),
        }
    }
}

/// What one deadline pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub heartbeat_timeouts: usize,
    pub provisioning_failures: usize,
    pub escalations: usize,
    pub slow_retries: usize,
    pub destroyed: usize,
    pub pruned: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    hosts: HostRegistry,
    pool: FreePool,
    allocations: AllocationsRegistry,
    effects: Vec<Effect>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            hosts: HostRegistry::new(),
            pool: FreePool::new(),
            allocations: AllocationsRegistry::new(),
            effects: Vec::new(),
        }
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    pub fn pool(&self) -> &FreePool {
        &self.pool
    }

    pub fn allocations(&self) -> &AllocationsRegistry {
        &self.allocations
    }

    /// Takes the side effects queued since the last drain, in order.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn publish(&mut self, event: AllocationEvent, actor: ActorType) {
        self.effects.push(Effect::Publish { event, actor });
    }

    fn request_reclaim(&mut self, host: HostIndex, kind: ReclamationKind) -> AllocatorResult<()> {
        let host = self.hosts.get(host)?.host().clone();
        self.effects.push(Effect::Reclaim { host, kind });
        Ok(())
    }

    // =========================================================================
    // Fleet
    // =========================================================================

    /// Registers a discovered host. It is slow-reclaimed before it may be
    /// allocated.
    pub fn add_host(&mut self, host: Host, now: Instant) -> AllocatorResult<HostIndex> {
        let id = host.id.clone();
        let index = self.hosts.add(host, self.config.host_timeouts, now)?;
        self.request_reclaim(index, ReclamationKind::Slow)?;
        info!(host = %id, index = %index, "host discovered");
        Ok(index)
    }

    pub fn host_index(&self, id: &HostId) -> AllocatorResult<HostIndex> {
        self.hosts.index_of(id)
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    /// Reserves hosts for `requirements` and starts provisioning them.
    ///
    /// All-or-nothing: on failure the pool and every host are unchanged.
    pub fn allocate(
        &mut self,
        requirements: &serde_json::Value,
        info: serde_json::Value,
        now: Instant,
    ) -> AllocatorResult<AllocationIndex> {
        let requirements = Requirements::parse(
            requirements,
            &self.config.default_image_label,
            self.hosts.len(),
        )?;
        let slots = self.pool.reserve(&self.hosts, &requirements)?;

        let labels: Vec<(HostIndex, String, Option<String>)> = slots
            .iter()
            .filter_map(|(name, host)| {
                requirements
                    .slot(name)
                    .map(|slot| (*host, slot.image_label.clone(), slot.image_hint.clone()))
            })
            .collect();

        let allocation = self.allocations.create(
            requirements,
            info,
            slots,
            self.config.heartbeat_timeout,
            now,
        );
        let index = allocation.index();
        let allocation_info = allocation.info().clone();
        let slots = allocation.slots().clone();

        for (host, label, hint) in labels {
            let machine = self.hosts.get_mut(host)?;
            machine.begin_provisioning(index, label.clone(), now)?;
            self.effects.push(Effect::ProvideLabel {
                host: machine.host().clone(),
                label,
                hint,
            });
        }

        let mut hosts = BTreeMap::new();
        for (name, host) in &slots {
            hosts.insert(name.clone(), self.hosts.get(*host)?.host().id.clone());
        }
        info!(
            allocation = %index,
            nodes = slots.len(),
            free_hosts = self.pool.len(),
            "allocation created"
        );
        self.publish(
            AllocationEvent::Created(AllocationCreatedPayload {
                index,
                hosts,
                allocation_info,
            }),
            ActorType::Client,
        );
        Ok(index)
    }

    /// Client release. Provisioned hosts are quick-reclaimed. A second call
    /// is a no-op.
    pub fn free(&mut self, index: AllocationIndex, now: Instant) -> AllocatorResult<()> {
        let allocation = self.allocations.by_index_mut(index)?;
        if !allocation.free(now) {
            return Ok(());
        }
        let held: Vec<HostIndex> = allocation.held().iter().copied().collect();

        for host in held {
            let kind = match self.hosts.get(host)?.state() {
                HostState::LabelProvided | HostState::InaugurationDone => ReclamationKind::Quick,
                // The label may still be in flight; only a cold restart is safe.
                HostState::CheckedIn => ReclamationKind::Slow,
                HostState::QuickReclamationInProgress | HostState::SlowReclamationInProgress => {
                    continue
                }
                HostState::Destroyed => {
                    self.allocations.by_index_mut(index)?.release_host(host);
                    continue;
                }
            };
            self.hosts.get_mut(host)?.reclaim(kind, now)?;
            self.request_reclaim(host, kind)?;
        }

        info!(allocation = %index, "allocation freed");
        self.publish(
            AllocationEvent::Freed(AllocationRefPayload { index }),
            ActorType::Client,
        );
        Ok(())
    }

    /// Keeps allocations alive. Every index is validated before any moves.
    pub fn heartbeat(&mut self, indexes: &[AllocationIndex], now: Instant) -> AllocatorResult<()> {
        self.allocations.heartbeat(indexes, now)
    }

    pub fn done(&self, index: AllocationIndex) -> AllocatorResult<bool> {
        Ok(self.allocations.by_index(index)?.done())
    }

    pub fn dead(&self, index: AllocationIndex) -> AllocatorResult<bool> {
        Ok(self.allocations.by_index(index)?.dead())
    }

    /// The committed node mapping of a done, live allocation.
    pub fn nodes(&self, index: AllocationIndex) -> AllocatorResult<BTreeMap<String, &Host>> {
        let allocation = self.allocations.by_index(index)?;
        if let Some(DeathReason::ProvisioningFailure { host_id, detail }) =
            allocation.death_reason()
        {
            return Err(AllocatorError::ProvisioningFailure {
                host: host_id.clone(),
                detail: detail.clone(),
            });
        }
        allocation
            .allocated()?
            .iter()
            .map(|(name, host)| -> AllocatorResult<(String, &Host)> {
                Ok((name.clone(), self.hosts.get(*host)?.host()))
            })
            .collect()
    }

    /// An inaugurated node of an allocation, by host id.
    pub fn find_inaugurated_node(
        &self,
        index: AllocationIndex,
        node_id: &HostId,
    ) -> AllocatorResult<&Host> {
        let allocation = self.allocations.by_index(index)?;
        allocation
            .inaugurated()
            .filter_map(|(_, host)| self.hosts.get(host).ok())
            .find(|machine| {
                &machine.host().id == node_id
                    && machine.state() == HostState::InaugurationDone
                    && machine.owner() == Owner::Allocation(index)
            })
            .map(|machine| machine.host())
            .ok_or_else(|| {
                AllocatorError::not_found(format!(
                    "node with id {node_id} was not found in allocation {index}"
                ))
            })
    }

    // =========================================================================
    // Provisioning callbacks
    // =========================================================================

    pub fn label_provided(&mut self, host: HostIndex, now: Instant) -> AllocatorResult<()> {
        let machine = self.hosts.get_mut(host)?;
        if machine.owner().allocation().is_none() {
            return Err(AllocatorError::precondition(format!(
                "host {} is not allocated",
                machine.host().id
            )));
        }
        machine.label_provided(now)?;
        info!(host = %machine.host().id, "label provided");
        Ok(())
    }

    pub fn inauguration_done(&mut self, host: HostIndex, now: Instant) -> AllocatorResult<()> {
        let machine = self.hosts.get_mut(host)?;
        let Some(index) = machine.owner().allocation() else {
            return Err(AllocatorError::precondition(format!(
                "host {} is not allocated",
                machine.host().id
            )));
        };
        machine.inauguration_done(now)?;
        let host_id = machine.host().id.clone();

        let Some(progress) = self.allocations.by_index_mut(index)?.mark_inaugurated(host) else {
            return Ok(());
        };
        info!(allocation = %index, node = %progress.node_name, host = %host_id, "node inaugurated");
        self.publish(
            AllocationEvent::NodeInaugurated(NodeInauguratedPayload {
                index,
                node_name: progress.node_name,
                host_id,
            }),
            ActorType::Provisioner,
        );
        if progress.became_done {
            info!(allocation = %index, "allocation done");
            self.publish(
                AllocationEvent::Done(AllocationRefPayload { index }),
                ActorType::Provisioner,
            );
        }
        Ok(())
    }

    /// A host failed to provision. Its allocation dies; an unallocated host
    /// is pulled from the pool and slow-reclaimed.
    pub fn provisioning_failed(
        &mut self,
        host: HostIndex,
        detail: &str,
        now: Instant,
    ) -> AllocatorResult<()> {
        self.fail_host(host, detail, ActorType::Provisioner, now)
    }

    fn fail_host(
        &mut self,
        host: HostIndex,
        detail: &str,
        actor: ActorType,
        now: Instant,
    ) -> AllocatorResult<()> {
        let machine = self.hosts.get(host)?;
        let host_id = machine.host().id.clone();
        if machine.state().is_terminal() {
            return Err(AllocatorError::InvalidTransition {
                host: host_id,
                from: HostState::Destroyed,
                to: HostState::SlowReclamationInProgress,
            });
        }
        warn!(host = %host_id, detail, "provisioning failed");

        if let Some(index) = machine.owner().allocation() {
            if self.allocations.by_index(index)?.is_active() {
                let reason = DeathReason::ProvisioningFailure {
                    host_id,
                    detail: detail.to_string(),
                };
                return self.kill(index, reason, actor, now);
            }
        }

        self.pool.remove(host);
        self.hosts.get_mut(host)?.reclaim(ReclamationKind::Slow, now)?;
        self.request_reclaim(host, ReclamationKind::Slow)
    }

    /// The host re-announced itself idle and clean; it rejoins the pool.
    pub fn checked_in(&mut self, host: HostIndex, now: Instant) -> AllocatorResult<()> {
        let machine = self.hosts.get_mut(host)?;
        if !machine.checked_in(now)? {
            return Ok(());
        }
        if let Some(index) = machine.owner().allocation() {
            if let Ok(allocation) = self.allocations.by_index_mut(index) {
                allocation.release_host(host);
            }
        }
        self.pool.return_host(machine)?;
        info!(host = %machine.host().id, free_hosts = self.pool.len(), "host checked in");
        Ok(())
    }

    /// Takes a host out of rotation for good.
    pub fn destroy(&mut self, host: HostIndex, now: Instant) -> AllocatorResult<()> {
        self.destroy_host(host, "host destroyed", ActorType::Provisioner, now)
    }

    fn destroy_host(
        &mut self,
        host: HostIndex,
        detail: &str,
        actor: ActorType,
        now: Instant,
    ) -> AllocatorResult<()> {
        let machine = self.hosts.get_mut(host)?;
        let owner = machine.owner();
        let host_id = machine.host().id.clone();
        machine.destroy(now)?;
        self.pool.remove(host);
        warn!(host = %host_id, detail, "host destroyed");

        if let Some(index) = owner.allocation() {
            if self.allocations.by_index(index)?.is_active() {
                let reason = DeathReason::ProvisioningFailure {
                    host_id,
                    detail: detail.to_string(),
                };
                self.kill(index, reason, actor, now)?;
            }
            self.allocations.by_index_mut(index)?.release_host(host);
        }
        Ok(())
    }

    /// Marks an allocation dead and slow-reclaims everything it holds.
    fn kill(
        &mut self,
        index: AllocationIndex,
        reason: DeathReason,
        actor: ActorType,
        now: Instant,
    ) -> AllocatorResult<()> {
        let allocation = self.allocations.by_index_mut(index)?;
        if !allocation.kill(reason.clone(), now) {
            return Ok(());
        }
        let held: Vec<HostIndex> = allocation.held().iter().copied().collect();

        for host in held {
            match self.hosts.get(host)?.state() {
                HostState::SlowReclamationInProgress => continue,
                HostState::Destroyed => {
                    self.allocations.by_index_mut(index)?.release_host(host);
                    continue;
                }
                _ => {}
            }
            self.hosts
                .get_mut(host)?
                .reclaim(ReclamationKind::Slow, now)?;
            self.request_reclaim(host, ReclamationKind::Slow)?;
        }

        warn!(allocation = %index, reason = %reason, "allocation dead");
        self.publish(
            AllocationEvent::Dead(AllocationDeadPayload { index, reason }),
            actor,
        );
        Ok(())
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    /// Expires heartbeats and host deadlines, then prunes retired
    /// allocations.
    pub fn tick(&mut self, now: Instant) -> AllocatorResult<TickReport> {
        let mut report = TickReport::default();

        let expired: Vec<AllocationIndex> = self
            .allocations
            .all()
            .filter(|a| a.heartbeat_expired(now))
            .map(|a| a.index())
            .collect();
        for index in expired {
            self.kill(index, DeathReason::HeartbeatTimeout, ActorType::System, now)?;
            report.heartbeat_timeouts += 1;
        }

        let due: Vec<(HostIndex, DeadlineKind)> = self
            .hosts
            .iter()
            .filter_map(|m| m.expired(now).map(|kind| (m.host().index, kind)))
            .collect();
        for (host, kind) in due {
            // An earlier step of this pass may have re-armed the deadline.
            if self.hosts.get(host)?.expired(now) != Some(kind) {
                continue;
            }
            match kind {
                DeadlineKind::LabelProvided | DeadlineKind::Inauguration => {
                    let detail = match kind {
                        DeadlineKind::LabelProvided => "label was not provided in time",
                        _ => "inauguration did not finish in time",
                    };
                    self.fail_host(host, detail, ActorType::System, now)?;
                    report.provisioning_failures += 1;
                }
                DeadlineKind::QuickReclamation => {
                    let machine = self.hosts.get_mut(host)?;
                    warn!(host = %machine.host().id, "quick reclamation timed out, escalating");
                    machine.reclaim(ReclamationKind::Slow, now)?;
                    self.request_reclaim(host, ReclamationKind::Slow)?;
                    report.escalations += 1;
                }
                DeadlineKind::SlowReclamation => {
                    let machine = self.hosts.get_mut(host)?;
                    if machine.slow_attempts() >= self.config.max_slow_attempts {
                        let detail = format!(
                            "slow reclamation failed {} times",
                            machine.slow_attempts()
                        );
                        self.destroy_host(host, &detail, ActorType::System, now)?;
                        report.destroyed += 1;
                    } else {
                        let attempt = machine.retry_slow_reclamation(now)?;
                        warn!(host = %machine.host().id, attempt, "slow reclamation timed out, retrying");
                        self.request_reclaim(host, ReclamationKind::Slow)?;
                        report.slow_retries += 1;
                    }
                }
            }
        }

        let pruned = self
            .allocations
            .prune_retired(now, self.config.allocation_retention);
        for index in &pruned {
            info!(allocation = %index, "allocation pruned");
        }
        report.pruned = pruned.len();

        Ok(report)
    }
}
