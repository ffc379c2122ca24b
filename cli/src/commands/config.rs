// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use enclave_core::domain::config::HubConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Write a manifest with every default spelled out
    Generate {
        #[arg(short, long, default_value = "./enclave-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = HubConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. ENCLAVE_CONFIG_PATH: {}",
            std::env::var("ENCLAVE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./enclave-config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{} {}", "Hub:".bold(), config.metadata.name);
    println!("  State file: {}", spec.hub.state_path.display());
    println!("  Token TTL: {:?}", spec.hub.token_ttl);
    println!("  Audit capacity: {}", spec.hub.audit_capacity);
    println!();

    println!("{}", "Sessions:".bold());
    println!("  Default backend: {}", spec.sessions.default_backend);
    println!("  Default TTL: {:?}", spec.sessions.default_ttl);
    println!("  Data root: {}", spec.sessions.data_root.display());
    println!(
        "  Health: every {:?}, timeout {:?}, recycle after {} failures",
        spec.health.interval, spec.health.timeout, spec.health.failure_threshold
    );
    println!("  Image verification: {}", spec.image_verification.mode);
    println!();

    println!("{}", "Agents:".bold());
    if spec.agents.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for agent in &spec.agents {
        let caps: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        println!(
            "  {} {} [{}]{}",
            agent.name.bold(),
            agent.image,
            caps.join(", "),
            if agent.hardened { " hardened" } else { "" }
        );
    }
    println!();

    if !spec.mounts.is_empty() {
        println!("{}", "Profile mounts:".bold());
        for mount in &spec.mounts {
            println!(
                "  {} ${} → {}{}",
                mount.name,
                mount.variable,
                mount.target,
                if mount.enabled { "" } else { " (disabled)" }
            );
        }
        println!();
    }

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config =
        HubConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    HubConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_config_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enclave-config.yaml");

        generate(path.clone()).unwrap();
        validate(Some(path)).unwrap();
    }
}
