//! Side effects of engine operations and their dispatcher.
//!
//! Engine operations queue effects while holding the engine lock. The state
//! layer forwards them, still under the lock, into an unbounded channel so
//! their order matches the order of the state changes. The dispatcher drains
//! the channel and performs the collaborator calls without the lock. Calls
//! are fire-and-forget: failures are logged, and the deadline worker
//! recovers hosts whose reclamation never completes.

use rackalloc_events::{ActorType, AllocationEvent, EventEnvelope};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::collaborators::Collaborators;
use crate::hosts::{Host, ReclamationKind};

/// A collaborator call requested by the engine.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Start provisioning `host` with an image label.
    ProvideLabel {
        host: Host,
        label: String,
        hint: Option<String>,
    },
    /// Start reclaiming `host`.
    Reclaim { host: Host, kind: ReclamationKind },
    /// Broadcast an allocation event.
    Publish {
        event: AllocationEvent,
        actor: ActorType,
    },
}

pub type EffectSender = mpsc::UnboundedSender<Effect>;

/// Performs queued effects in order.
pub struct EffectDispatcher {
    collaborators: Collaborators,
    receiver: mpsc::UnboundedReceiver<Effect>,
}

impl EffectDispatcher {
    /// Creates a dispatcher and the sender feeding it.
    pub fn channel(collaborators: Collaborators) -> (EffectSender, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                collaborators,
                receiver,
            },
        )
    }

    /// Runs until shutdown is signaled or every sender is gone. Effects
    /// already queued at shutdown are still performed.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting effect dispatcher");

        loop {
            tokio::select! {
                effect = self.receiver.recv() => {
                    match effect {
                        Some(effect) => self.dispatch(effect).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.receiver.close();
                        while let Some(effect) = self.receiver.recv().await {
                            self.dispatch(effect).await;
                        }
                        break;
                    }
                }
            }
        }

        info!("Effect dispatcher shutting down");
    }

    /// Performs one effect, logging failures.
    pub async fn dispatch(&self, effect: Effect) {
        match effect {
            Effect::ProvideLabel { host, label, hint } => {
                debug!(host = %host.id, label = %label, "dispatching label");
                if let Err(e) = self
                    .collaborators
                    .provisioner
                    .provide_label(&host, &label, hint.as_deref())
                    .await
                {
                    warn!(host = %host.id, error = %e, "Failed to provide label");
                }
            }
            Effect::Reclaim { host, kind } => {
                let result = match kind {
                    ReclamationKind::Quick => self.collaborators.provisioner.soft_reclaim(&host).await,
                    ReclamationKind::Slow => self.collaborators.power.cold_restart(&host).await,
                };
                if let Err(e) = result {
                    warn!(host = %host.id, ?kind, error = %e, "Failed to start reclamation");
                }
            }
            Effect::Publish { event, actor } => {
                let envelope = match EventEnvelope::from_event(&event, actor, None) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(event_type = event.event_type(), error = %e, "Failed to encode event");
                        return;
                    }
                };
                if let Err(e) = self.collaborators.broadcaster.publish(&envelope).await {
                    warn!(
                        event_type = %envelope.event_type,
                        allocation = %envelope.allocation,
                        error = %e,
                        "Failed to publish event"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rackalloc_events::AllocationRefPayload;
    use rackalloc_id::AllocationIndex;

    use super::*;
    use crate::collaborators::mock::Call;
    use crate::collaborators::RecordingCollaborators;
    use crate::hosts::host::tests::test_host;

    #[tokio::test]
    async fn test_reclaim_kinds_map_to_collaborators() {
        let recorder = Arc::new(RecordingCollaborators::new());
        let (_sender, dispatcher) = EffectDispatcher::channel(recorder.collaborators());

        dispatcher
            .dispatch(Effect::Reclaim {
                host: test_host(0),
                kind: ReclamationKind::Quick,
            })
            .await;
        dispatcher
            .dispatch(Effect::Reclaim {
                host: test_host(1),
                kind: ReclamationKind::Slow,
            })
            .await;

        let calls = recorder.calls();
        assert!(matches!(&calls[0], Call::SoftReclaim(id) if id.as_str() == "server0"));
        assert!(matches!(&calls[1], Call::ColdRestart(id) if id.as_str() == "server1"));
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let recorder = Arc::new(RecordingCollaborators::new());
        let (sender, dispatcher) = EffectDispatcher::channel(recorder.collaborators());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for i in 0..3 {
            sender
                .send(Effect::Publish {
                    event: AllocationEvent::Freed(AllocationRefPayload {
                        index: AllocationIndex::new(i),
                    }),
                    actor: ActorType::Client,
                })
                .unwrap();
        }
        shutdown_tx.send(true).unwrap();
        dispatcher.run(shutdown_rx).await;

        assert_eq!(recorder.published(), vec!["allocation.freed"; 3]);
    }

    #[tokio::test]
    async fn test_collaborator_failure_is_logged_not_raised() {
        let recorder = Arc::new(RecordingCollaborators::failing_power());
        let (_sender, dispatcher) = EffectDispatcher::channel(recorder.collaborators());
        dispatcher
            .dispatch(Effect::Reclaim {
                host: test_host(0),
                kind: ReclamationKind::Slow,
            })
            .await;
        assert!(recorder.calls().is_empty());
    }
}
