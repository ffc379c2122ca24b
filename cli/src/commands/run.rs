// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground hub runner
//!
//! Loads and validates the manifest, wires the default adapters, restores
//! persisted state, starts the background loops and waits for Ctrl+C or
//! SIGTERM before shutting down gracefully.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};

use enclave_core::domain::config::HubConfigManifest;
use enclave_core::domain::events::HubEvent;
use enclave_core::infrastructure::event_bus::EventBusError;
use enclave_core::infrastructure::{build_dependencies, EventBus};
use enclave_core::Hub;

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config =
        HubConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        "Configuration loaded: hub={}, agents={}",
        config.metadata.name,
        config.spec.agents.len()
    );

    let events = EventBus::with_default_capacity();
    spawn_event_logger(&events);

    let hub = Hub::new(&config, build_dependencies(&config, events));
    let restored = hub.init().await.context("Failed to initialize hub")?;
    info!(
        tokens = restored.tokens,
        tasks = restored.tasks,
        pending_messages = restored.pending_messages,
        "Hub initialized"
    );

    hub.start();
    info!("Enclave hub running");

    shutdown_signal().await?;

    hub.shutdown().await.context("Hub shutdown failed")?;
    info!("Enclave hub stopped");
    Ok(())
}

/// Mirrors hub events into the log at debug level, warnings for health.
fn spawn_event_logger(events: &EventBus) {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(EventBusError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} events", skipped);
                    continue;
                }
                Err(_) => break,
            };
            match &event {
                HubEvent::SessionUnhealthy {
                    session_name,
                    consecutive_failures,
                    detail,
                    ..
                } => warn!(
                    session = %session_name,
                    failures = consecutive_failures,
                    "Session unhealthy: {}",
                    detail.as_deref().unwrap_or("no detail")
                ),
                other => tracing::debug!(event = ?other, "Hub event"),
            }
        }
    });
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            info!("Received Ctrl+C signal");
        },
        res = terminate => {
            res?;
            info!("Received SIGTERM signal");
        },
    }
    Ok(())
}
