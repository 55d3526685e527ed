//! Deadline background worker.
//!
//! Periodically expires heartbeats, provisioning deadlines and reclamation
//! timeouts by running an engine tick under the engine lock.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::state::AppState;

pub struct DeadlineWorker {
    state: AppState,
    interval: Duration,
}

impl DeadlineWorker {
    pub fn new(state: AppState, interval: Duration) -> Self {
        Self { state, interval }
    }

    /// Run the deadline worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting deadline worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_pass().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Deadline worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single deadline pass.
    pub async fn run_pass(&self) {
        match self.state.with_engine(|engine, now| engine.tick(now)).await {
            Ok(report) if report.is_idle() => debug!("deadline pass idle"),
            Ok(report) => info!(
                heartbeat_timeouts = report.heartbeat_timeouts,
                provisioning_failures = report.provisioning_failures,
                escalations = report.escalations,
                slow_retries = report.slow_retries,
                destroyed = report.destroyed,
                pruned = report.pruned,
                "Deadline pass complete"
            ),
            Err(e) => error!(error = %e, "Deadline pass failed"),
        }
    }
}
