//! Per-host provisioning lifecycle.
//!
//! Every host has exactly one [`HostStateMachine`]. It tracks the lifecycle
//! state, which party owns the host, and at most one pending deadline. The
//! legal edges live in one table, [`HostState::can_transition_to`]; every
//! mutation goes through [`HostStateMachine::transition`] so an illegal edge
//! is rejected with the state left untouched.

use std::time::{Duration, Instant};

use rackalloc_id::AllocationIndex;
use serde::Serialize;
use tracing::debug;

use super::Host;
use crate::error::{AllocatorError, AllocatorResult};

// =============================================================================
// States
// =============================================================================

/// Lifecycle state of a host. Discriminants are the wire ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostState {
    QuickReclamationInProgress = 1,
    SlowReclamationInProgress = 2,
    CheckedIn = 3,
    LabelProvided = 4,
    InaugurationDone = 5,
    Destroyed = 6,
}

impl HostState {
    pub const ALL: [HostState; 6] = [
        HostState::QuickReclamationInProgress,
        HostState::SlowReclamationInProgress,
        HostState::CheckedIn,
        HostState::LabelProvided,
        HostState::InaugurationDone,
        HostState::Destroyed,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            HostState::QuickReclamationInProgress => "QUICK_RECLAMATION_IN_PROGRESS",
            HostState::SlowReclamationInProgress => "SLOW_RECLAMATION_IN_PROGRESS",
            HostState::CheckedIn => "CHECKED_IN",
            HostState::LabelProvided => "LABEL_PROVIDED",
            HostState::InaugurationDone => "INAUGURATION_DONE",
            HostState::Destroyed => "DESTROYED",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == HostState::Destroyed
    }

    /// The transition table.
    pub fn can_transition_to(self, to: HostState) -> bool {
        use HostState::*;
        match (self, to) {
            (_, Destroyed) => true,
            (Destroyed, _) => false,
            (CheckedIn, LabelProvided) => true,
            (LabelProvided, InaugurationDone) => true,
            (LabelProvided | InaugurationDone, QuickReclamationInProgress) => true,
            (_, SlowReclamationInProgress) => true,
            (QuickReclamationInProgress | SlowReclamationInProgress, CheckedIn) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for HostState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

/// Reclamation flavour: quick is a soft reset, slow is a cold restart and wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclamationKind {
    Quick,
    Slow,
}

impl ReclamationKind {
    pub fn state(self) -> HostState {
        match self {
            ReclamationKind::Quick => HostState::QuickReclamationInProgress,
            ReclamationKind::Slow => HostState::SlowReclamationInProgress,
        }
    }
}

// =============================================================================
// Ownership and deadlines
// =============================================================================

/// Who currently holds a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    FreePool,
    Allocation(AllocationIndex),
    /// Newly discovered hosts awaiting their first reclamation, hosts
    /// returning from an allocation that no longer exists, and destroyed hosts.
    Unowned,
}

impl Owner {
    pub fn allocation(self) -> Option<AllocationIndex> {
        match self {
            Owner::Allocation(index) => Some(index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    LabelProvided,
    Inauguration,
    QuickReclamation,
    SlowReclamation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub kind: DeadlineKind,
}

/// Bounds on how long a host may sit in each in-flight state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTimeouts {
    pub label: Duration,
    pub inauguration: Duration,
    pub quick_reclamation: Duration,
    pub slow_reclamation: Duration,
}

impl Default for HostTimeouts {
    fn default() -> Self {
        Self {
            label: Duration::from_secs(60),
            inauguration: Duration::from_secs(10 * 60),
            quick_reclamation: Duration::from_secs(3 * 60),
            slow_reclamation: Duration::from_secs(15 * 60),
        }
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone)]
pub struct HostStateMachine {
    host: Host,
    state: HostState,
    owner: Owner,
    entered_at: Instant,
    label: Option<String>,
    deadline: Option<Deadline>,
    slow_attempts: u32,
    timeouts: HostTimeouts,
}

impl HostStateMachine {
    /// A freshly discovered host. Its condition is unknown, so it starts in
    /// slow reclamation and joins the pool once it checks in.
    pub fn discovered(host: Host, timeouts: HostTimeouts, now: Instant) -> Self {
        Self {
            host,
            state: HostState::SlowReclamationInProgress,
            owner: Owner::Unowned,
            entered_at: now,
            label: None,
            deadline: Some(Deadline {
                at: now + timeouts.slow_reclamation,
                kind: DeadlineKind::SlowReclamation,
            }),
            slow_attempts: 1,
            timeouts,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    /// Image label requested by the current owner, if provisioning started.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn slow_attempts(&self) -> u32 {
        self.slow_attempts
    }

    pub(crate) fn set_owner(&mut self, owner: Owner) {
        self.owner = owner;
    }

    /// Moves along one edge of the transition table.
    ///
    /// Clears any pending deadline. Rejected edges leave the machine untouched.
    pub fn transition(&mut self, to: HostState, now: Instant) -> AllocatorResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(AllocatorError::InvalidTransition {
                host: self.host.id.clone(),
                from: self.state,
                to,
            });
        }
        debug!(host = %self.host.id, from = %self.state, to = %to, "host transition");
        self.state = to;
        self.entered_at = now;
        self.deadline = None;
        Ok(())
    }

    /// Hands the host to an allocation and arms the label deadline.
    ///
    /// The host stays CHECKED_IN until the provisioner reports the label.
    pub fn begin_provisioning(
        &mut self,
        allocation: AllocationIndex,
        label: String,
        now: Instant,
    ) -> AllocatorResult<()> {
        if self.state != HostState::CheckedIn {
            return Err(AllocatorError::precondition(format!(
                "host {} is {} and cannot be provisioned",
                self.host.id, self.state
            )));
        }
        self.owner = Owner::Allocation(allocation);
        self.label = Some(label);
        self.deadline = Some(Deadline {
            at: now + self.timeouts.label,
            kind: DeadlineKind::LabelProvided,
        });
        Ok(())
    }

    pub fn label_provided(&mut self, now: Instant) -> AllocatorResult<()> {
        self.transition(HostState::LabelProvided, now)?;
        self.deadline = Some(Deadline {
            at: now + self.timeouts.inauguration,
            kind: DeadlineKind::Inauguration,
        });
        Ok(())
    }

    pub fn inauguration_done(&mut self, now: Instant) -> AllocatorResult<()> {
        self.transition(HostState::InaugurationDone, now)
    }

    /// Starts reclamation of the given kind and arms its deadline.
    pub fn reclaim(&mut self, kind: ReclamationKind, now: Instant) -> AllocatorResult<()> {
        self.transition(kind.state(), now)?;
        let (timeout, deadline_kind) = match kind {
            ReclamationKind::Quick => {
                (self.timeouts.quick_reclamation, DeadlineKind::QuickReclamation)
            }
            ReclamationKind::Slow => {
                self.slow_attempts = 1;
                (self.timeouts.slow_reclamation, DeadlineKind::SlowReclamation)
            }
        };
        self.label = None;
        self.deadline = Some(Deadline {
            at: now + timeout,
            kind: deadline_kind,
        });
        Ok(())
    }

    /// Re-arms a timed-out slow reclamation. Returns the attempt number.
    pub fn retry_slow_reclamation(&mut self, now: Instant) -> AllocatorResult<u32> {
        if self.state != HostState::SlowReclamationInProgress {
            return Err(AllocatorError::precondition(format!(
                "host {} is {}, not in slow reclamation",
                self.host.id, self.state
            )));
        }
        self.slow_attempts += 1;
        self.deadline = Some(Deadline {
            at: now + self.timeouts.slow_reclamation,
            kind: DeadlineKind::SlowReclamation,
        });
        Ok(self.slow_attempts)
    }

    /// The host re-announced itself idle and clean.
    ///
    /// Returns `false` if it was already CHECKED_IN.
    pub fn checked_in(&mut self, now: Instant) -> AllocatorResult<bool> {
        if self.state == HostState::CheckedIn {
            return Ok(false);
        }
        self.transition(HostState::CheckedIn, now)?;
        self.slow_attempts = 0;
        self.label = None;
        Ok(true)
    }

    pub fn destroy(&mut self, now: Instant) -> AllocatorResult<()> {
        self.transition(HostState::Destroyed, now)?;
        self.owner = Owner::Unowned;
        self.label = None;
        Ok(())
    }

    /// The pending deadline, if it has passed.
    pub fn expired(&self, now: Instant) -> Option<DeadlineKind> {
        self.deadline.filter(|d| d.at <= now).map(|d| d.kind)
    }
}
