// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Hub Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing one
// hub process:
// - background loop intervals, token TTL and audit capacity
// - health monitoring thresholds
// - session defaults (data root, TTL, backend, port allocation)
// - image verification and profile-derived mounts
// - per-backend settings, secret references and the agent catalog
//
// Every field carries a default so that `spec: {}` is a valid manifest.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::agent::AgentDefinition;
use crate::domain::collaborators::ImageVerificationMode;
use crate::domain::session::BackendKind;

pub const API_VERSION: &str = "enclave.dev/v1";
pub const KIND: &str = "HubConfig";

/// Top-level Kubernetes-style hub configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfigManifest {
    /// API version (must be "enclave.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "HubConfig")
    pub kind: String,

    #[serde(default)]
    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: HubConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

impl Default for ManifestMetadata {
    fn default() -> Self {
        Self {
            name: "enclave-hub".to_string(),
            version: None,
            labels: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfigSpec {
    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub sessions: SessionSettings,

    #[serde(default)]
    pub image_verification: ImageVerificationSettings,

    /// Profile-derived mount definitions, resolved per session role
    #[serde(default)]
    pub mounts: Vec<ProfileMountConfig>,

    #[serde(default)]
    pub backends: BackendsConfig,

    /// Logical secret name -> reference (`env:VAR_NAME`)
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Snapshot file written by the periodic flush
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// How often RUNNING tasks are reconciled against tracked sessions
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,

    #[serde(default = "default_token_ttl", with = "humantime_serde")]
    pub token_ttl: Duration,

    /// Ring buffer size of the message audit log
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,

    /// Minimum spacing between bulk sweeps of expired tokens
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Issued-token count that forces a bulk sweep regardless of time
    #[serde(default = "default_sweep_every_issued")]
    pub sweep_every_issued: usize,

    /// Stop and remove every tracked session during shutdown
    #[serde(default = "default_true")]
    pub recycle_on_shutdown: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            flush_interval: default_flush_interval(),
            reconcile_interval: default_reconcile_interval(),
            token_ttl: default_token_ttl(),
            audit_capacity: default_audit_capacity(),
            sweep_interval: default_sweep_interval(),
            sweep_every_issued: default_sweep_every_issued(),
            recycle_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Per-check bound enforced around every backend health probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Consecutive failures before a session is recycled
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Parent of the per-session data directories bound at `/session`
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Base for workspace-relative profile mount defaults
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Directory holding `<profile>.env` files
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,

    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    #[serde(default = "default_backend")]
    pub default_backend: BackendKind,

    /// First host port handed out to sessions
    #[serde(default = "default_port_base")]
    pub port_base: u16,

    /// Graceful stop window before a forced kill
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            workspace_root: default_workspace_root(),
            profiles_dir: default_profiles_dir(),
            default_ttl: default_session_ttl(),
            default_backend: default_backend(),
            port_base: default_port_base(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageVerificationSettings {
    #[serde(default)]
    pub mode: ImageVerificationMode,

    /// Allowed `sha256:` digests; empty accepts any pinned digest
    #[serde(default)]
    pub pinned_digests: Vec<String>,
}

/// One mount type resolved from a profile's environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMountConfig {
    pub name: String,

    /// Profile variable holding the host path
    pub variable: String,

    /// Workspace-relative fallback when the variable is unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Mount point inside the session
    pub target: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub docker: DockerBackendConfig,

    #[serde(default)]
    pub vm: VmBackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerBackendConfig {
    /// Path to Docker socket. Default: local defaults of the Docker client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Port the agent listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: i64,

    #[serde(default = "default_nano_cpus")]
    pub nano_cpus: i64,

    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            network: None,
            container_port: default_container_port(),
            memory_bytes: default_memory_bytes(),
            nano_cpus: default_nano_cpus(),
            pids_limit: default_pids_limit(),
            tmpfs_size: default_tmpfs_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmBackendConfig {
    #[serde(default = "default_limactl")]
    pub limactl: String,

    /// Lima template used when the agent image is not itself a template or file
    #[serde(default = "default_vm_template")]
    pub template: String,

    #[serde(default = "default_vm_cpus")]
    pub cpus: u32,

    #[serde(default = "default_vm_memory_gib")]
    pub memory_gib: u32,

    /// Guest port forwarded to the session's loopback port
    #[serde(default = "default_container_port")]
    pub guest_port: u16,

    /// Upper bound for a single limactl invocation
    #[serde(default = "default_vm_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for VmBackendConfig {
    fn default() -> Self {
        Self {
            limactl: default_limactl(),
            template: default_vm_template(),
            cpus: default_vm_cpus(),
            memory_gib: default_vm_memory_gib(),
            guest_port: default_container_port(),
            command_timeout: default_vm_command_timeout(),
        }
    }
}

impl Default for HubConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata::default(),
            spec: HubConfigSpec::default(),
        }
    }
}

impl HubConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. ENCLAVE_CONFIG_PATH environment variable
    /// 2. ./enclave-config.yaml (working directory)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ENCLAVE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./enclave-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENCLAVE_STATE_PATH") {
            tracing::info!("Environment override: ENCLAVE_STATE_PATH={}", val);
            self.spec.hub.state_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ENCLAVE_IMAGE_VERIFICATION") {
            match val.to_lowercase().as_str() {
                "enforce" => self.spec.image_verification.mode = ImageVerificationMode::Enforce,
                "warn" => self.spec.image_verification.mode = ImageVerificationMode::Warn,
                "off" => self.spec.image_verification.mode = ImageVerificationMode::Off,
                _ => {
                    tracing::warn!(
                        "Invalid value for ENCLAVE_IMAGE_VERIFICATION: '{}'. Expected enforce/warn/off. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("ENCLAVE_DEFAULT_BACKEND") {
            match val.parse::<BackendKind>() {
                Ok(kind) => self.spec.sessions.default_backend = kind,
                Err(e) => tracing::warn!("Ignoring ENCLAVE_DEFAULT_BACKEND: {}", e),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.health.failure_threshold == 0 {
            anyhow::bail!("spec.health.failure_threshold must be at least 1");
        }

        if self.spec.health.timeout.is_zero() {
            anyhow::bail!("spec.health.timeout cannot be zero");
        }

        if self.spec.hub.audit_capacity == 0 {
            anyhow::bail!("spec.hub.audit_capacity must be at least 1");
        }

        if self.spec.hub.token_ttl.is_zero() {
            anyhow::bail!("spec.hub.token_ttl cannot be zero");
        }

        let mut seen = std::collections::BTreeSet::new();
        for agent in &self.spec.agents {
            agent
                .validate()
                .map_err(|e| anyhow::anyhow!("spec.agents: {}", e))?;
            if !seen.insert(agent.name.as_str()) {
                anyhow::bail!("spec.agents: duplicate agent '{}'", agent.name);
            }
        }

        for mount in &self.spec.mounts {
            if mount.variable.is_empty() {
                anyhow::bail!("Mount '{}' has no variable", mount.name);
            }
            if !mount.target.starts_with('/') {
                anyhow::bail!(
                    "Mount '{}' target '{}' must be an absolute path",
                    mount.name,
                    mount.target
                );
            }
        }

        for (name, reference) in &self.spec.secrets {
            if !reference.starts_with("env:") {
                anyhow::bail!(
                    "Secret '{}' reference '{}' is not supported. Use env:VAR_NAME",
                    name,
                    reference
                );
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./.enclave/state.json")
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_audit_capacity() -> usize {
    100
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sweep_every_issued() -> usize {
    256
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./.enclave/sessions")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_profiles_dir() -> PathBuf {
    PathBuf::from("./.enclave/profiles")
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_backend() -> BackendKind {
    BackendKind::Docker
}

fn default_port_base() -> u16 {
    18080
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_container_port() -> u16 {
    8080
}

fn default_memory_bytes() -> i64 {
    2 * 1024 * 1024 * 1024
}

fn default_nano_cpus() -> i64 {
    1_000_000_000
}

fn default_pids_limit() -> i64 {
    256
}

fn default_tmpfs_size() -> String {
    "64m".to_string()
}

fn default_limactl() -> String {
    "limactl".to_string()
}

fn default_vm_template() -> String {
    "default".to_string()
}

fn default_vm_cpus() -> u32 {
    2
}

fn default_vm_memory_gib() -> u32 {
    4
}

fn default_vm_command_timeout() -> Duration {
    Duration::from_secs(600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = HubConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.health.failure_threshold, 3);
        assert_eq!(manifest.spec.health.timeout, Duration::from_secs(5));
        assert_eq!(manifest.spec.hub.audit_capacity, 100);
        assert_eq!(manifest.spec.hub.token_ttl, Duration::from_secs(3600));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_empty_spec_loads_with_defaults() {
        let yaml = "apiVersion: enclave.dev/v1\nkind: HubConfig\nspec: {}\n";
        let manifest = HubConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "enclave-hub");
        assert_eq!(manifest.spec.hub.flush_interval, Duration::from_secs(30));
        assert_eq!(manifest.spec.sessions.default_backend, BackendKind::Docker);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
apiVersion: enclave.dev/v1
kind: HubConfig
metadata:
  name: test-hub
spec:
  hub:
    token_ttl: 15m
    audit_capacity: 10
  health:
    interval: 10s
    failure_threshold: 2
  image_verification:
    mode: enforce
  mounts:
    - name: repo
      variable: REPO_PATH
      default: repo
      target: /workspace
  secrets:
    api_key: env:AGENT_API_KEY
  agents:
    - name: developer
      image: ghcr.io/acme/dev@sha256:abc
      capabilities: [fs.read, fs.write]
      hardened: true
"#;
        let manifest = HubConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.hub.token_ttl, Duration::from_secs(900));
        assert_eq!(manifest.spec.health.interval, Duration::from_secs(10));
        assert_eq!(
            manifest.spec.image_verification.mode,
            ImageVerificationMode::Enforce
        );
        assert!(manifest.spec.mounts[0].enabled);
        assert_eq!(manifest.spec.agents[0].capabilities.len(), 2);
        assert!(manifest.spec.agents[0].hardened);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut manifest = HubConfigManifest::default();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.health.failure_threshold = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.health.failure_threshold = 3;

        manifest.spec.hub.audit_capacity = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.hub.audit_capacity = 100;

        manifest.spec.agents.push(AgentDefinition::new("developer", ""));
        assert!(manifest.validate().is_err());
        manifest.spec.agents[0].image = "alpine".to_string();
        assert!(manifest.validate().is_ok());

        manifest
            .spec
            .secrets
            .insert("token".to_string(), "vault:secret/x".to_string());
        assert!(manifest.validate().is_err());
    }
}
