//! Application state shared across request handlers and workers.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use rackalloc_networking::RackSubnet;
use tokio::sync::Mutex;
use tracing::error;

use crate::collaborators::Collaborators;
use crate::effects::{EffectDispatcher, EffectSender};
use crate::engine::Engine;

/// Addresses handed to clients alongside node descriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeNetwork {
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub inaugurator_server_ip: Ipv4Addr,
    pub provisioning_server_ip: Ipv4Addr,
}

impl NodeNetwork {
    pub fn new(subnet: &RackSubnet, provisioning_server_ip: Ipv4Addr) -> Self {
        Self {
            netmask: subnet.netmask(),
            gateway: subnet.gateway,
            inaugurator_server_ip: subnet.gateway,
            provisioning_server_ip,
        }
    }
}

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Mutex<Engine>,
    effects: EffectSender,
    collaborators: Collaborators,
    network: NodeNetwork,
}

impl AppState {
    /// Create the state and the dispatcher that performs its effects.
    pub fn new(
        engine: Engine,
        collaborators: Collaborators,
        network: NodeNetwork,
    ) -> (Self, EffectDispatcher) {
        let (effects, dispatcher) = EffectDispatcher::channel(collaborators.clone());
        let state = Self {
            inner: Arc::new(AppStateInner {
                engine: Mutex::new(engine),
                effects,
                collaborators,
                network,
            }),
        };
        (state, dispatcher)
    }

    /// Runs `f` with exclusive access to the engine.
    ///
    /// Effects queued by `f` are handed to the dispatcher before the lock is
    /// released, so they are performed in the order the engine produced them.
    pub async fn with_engine<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut Engine, Instant) -> T,
    {
        let mut engine = self.inner.engine.lock().await;
        let result = f(&mut engine, Instant::now());
        for effect in engine.drain_effects() {
            if self.inner.effects.send(effect).is_err() {
                error!("Effect dispatcher is gone; dropping effect");
            }
        }
        result
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub fn network(&self) -> &NodeNetwork {
        &self.inner.network
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::collaborators::RecordingCollaborators;
    use crate::engine::EngineConfig;
    use crate::hosts::host::tests::test_host;

    #[tokio::test]
    async fn test_effects_reach_dispatcher_in_order() {
        let recorder = Arc::new(RecordingCollaborators::new());
        let subnet = RackSubnet::from_cidr("192.168.1.1/24").unwrap();
        let (state, dispatcher) = AppState::new(
            Engine::new(EngineConfig::default()),
            recorder.collaborators(),
            NodeNetwork::new(&subnet, subnet.gateway),
        );
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        state
            .with_engine(|engine, now| {
                let host = engine.add_host(test_host(0), now)?;
                engine.checked_in(host, now)?;
                let index = engine.allocate(&json!({"count": 1}), json!(null), now)?;
                engine.free(index, now)
            })
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            recorder.published(),
            vec!["allocation.created", "allocation.freed"]
        );
        // Discovery cold restart, label, then slow reclaim of the unlabelled host.
        let calls = recorder.calls();
        assert_eq!(calls.len(), 5);
    }

    #[test]
    fn test_node_network_from_subnet() {
        let subnet = RackSubnet::from_cidr("10.0.0.1/16").unwrap();
        let network = NodeNetwork::new(&subnet, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(network.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(network.inaugurator_server_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(network.provisioning_server_ip, Ipv4Addr::new(10, 0, 0, 2));
    }
}
