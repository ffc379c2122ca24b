// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Offline inspection of the persisted hub snapshot

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use enclave_core::application::persistence::HubSnapshot;
use enclave_core::domain::config::HubConfigManifest;

#[derive(Subcommand)]
pub enum StateCommand {
    /// Summarize the snapshot at the configured state path
    Show {
        /// Print the raw snapshot document
        #[arg(long)]
        json: bool,
    },
}

pub async fn handle_command(command: StateCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        StateCommand::Show { json } => show(config_override, json).await,
    }
}

async fn show(config_override: Option<PathBuf>, as_json: bool) -> Result<()> {
    let config = HubConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    let path = &config.spec.hub.state_path;

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("{}", format!("No snapshot at {}", path.display()).yellow());
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let snapshot: HubSnapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("Snapshot at {} is not readable", path.display()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let flushed = chrono_millis(snapshot.flushed_at);
    println!("{} {}", "Snapshot:".bold(), path.display());
    println!("  Flushed at: {}", flushed);
    println!("  Tokens: {}", snapshot.registry.tokens.len());
    println!("  Tasks: {}", snapshot.router.tasks.len());
    for (id, task) in &snapshot.router.tasks {
        println!("    {} {} {} {}", id, task.status, task.agent_name, task.description.dimmed());
    }
    let pending: usize = snapshot.messages.pending.iter().map(|(_, m)| m.len()).sum();
    println!("  Pending messages: {}", pending);
    println!("  Audit entries: {}", snapshot.messages.log.len());

    Ok(())
}

fn chrono_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
