//! rackalloc allocator
//!
//! Hands out physical hosts of a rack to clients, drives their provisioning
//! and reclaims them when clients are done or gone.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rackalloc_allocator::{
    api,
    collaborators::{
        Broadcaster, Collaborators, FsArtifactStore, LogBroadcaster, LoggingRackControl,
        PortForwardTranslator, WebhookBroadcaster,
    },
    config::Config,
    deadlines::DeadlineWorker,
    engine::Engine,
    inventory::Inventory,
    state::{AppState, NodeNetwork},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RACKALLOC_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rackalloc allocator");
    info!(listen_addr = %config.listen_addr, subnet = %config.subnet, "Configuration loaded");

    let hosts = Inventory::load(&config.inventory)?.into_hosts(&config.subnet)?;
    if let Ok((first, last)) = config.subnet.host_range() {
        info!(hosts = hosts.len(), %first, %last, "Rack inventory loaded");
    }

    let mut engine = Engine::new(config.engine.clone());
    let now = Instant::now();
    for host in hosts {
        let id = host.id.clone();
        engine
            .add_host(host, now)
            .with_context(|| format!("registering host {id}"))?;
    }

    let broadcaster: Arc<dyn Broadcaster> = match &config.webhook_url {
        Some(url) => {
            info!(url = %url, "Publishing allocation events to webhook");
            Arc::new(WebhookBroadcaster::new(url.clone())?)
        }
        None => Arc::new(LogBroadcaster),
    };
    let rack_control = Arc::new(LoggingRackControl);
    let collaborators = Collaborators {
        provisioner: rack_control.clone(),
        power: rack_control.clone(),
        pxe: rack_control,
        credentials: Arc::new(PortForwardTranslator::new(config.public_ip)),
        broadcaster,
        artifacts: Arc::new(FsArtifactStore::new(
            config.serial_logs_dir.clone(),
            config.post_mortem_dir.clone(),
        )),
    };

    let network = NodeNetwork::new(&config.subnet, config.provisioning_server_ip);
    let (state, dispatcher) = AppState::new(engine, collaborators, network);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let deadline_worker = DeadlineWorker::new(state.clone(), config.tick_interval);
    let deadline_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            deadline_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, deadline_handle).await {
        warn!(error = %e, "Deadline worker did not shut down in time");
    }

    // Last, so effects queued by the final requests are still performed.
    if let Err(e) = tokio::time::timeout(shutdown_timeout, dispatcher_handle).await {
        warn!(error = %e, "Effect dispatcher did not shut down in time");
    }

    info!("Allocator shutdown complete");
    Ok(())
}
