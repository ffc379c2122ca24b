// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared fixtures for the hub integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use enclave_core::domain::agent::AgentDefinition;
use enclave_core::domain::clock::ManualClock;
use enclave_core::domain::collaborators::{
    ImageVerificationMode, ImageVerifier, ProfileEnvironmentSource, SecretsContext,
    SecretsProvider, VerificationResult,
};
use enclave_core::domain::config::HubConfigManifest;
use enclave_core::domain::error::HubError;
use enclave_core::domain::runtime::{
    BackendError, ExecOutput, HealthStatus, SessionBackend, SessionIdentity, SessionInfo,
    VolumeMount,
};
use enclave_core::domain::session::{BackendKind, SessionContext};
use enclave_core::infrastructure::{EventBus, InMemoryStateStore};
use enclave_core::{Hub, HubDependencies};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Backend that keeps instances in a map. Health can be toggled per session
/// and provisioning can be held open to observe in-flight pipelines.
#[derive(Default)]
pub struct InMemoryBackend {
    instances: Mutex<HashMap<String, String>>,
    unhealthy: Mutex<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    secrets_seen: Mutex<HashMap<String, BTreeMap<String, String>>>,
    gate: Mutex<Option<Arc<Notify>>>,
    provisioning: Notify,
}

impl InMemoryBackend {
    /// Every later `provision` creates its instance and then waits for the
    /// returned gate to be notified.
    pub fn hold_provisioning(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Resolves once a `provision` call has created its instance.
    pub async fn provisioning_started(&self) {
        self.provisioning.notified().await;
    }

    pub fn set_unhealthy(&self, session: &str) {
        self.unhealthy.lock().insert(session.to_string());
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn has_instance(&self, session: &str) -> bool {
        self.instances.lock().contains_key(session)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn secrets_for(&self, session: &str) -> Option<BTreeMap<String, String>> {
        self.secrets_seen.lock().get(session).cloned()
    }
}

#[async_trait]
impl SessionBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn provision(
        &self,
        ctx: &SessionContext,
        _image: &str,
        _volumes: &[VolumeMount],
        _hardened: bool,
    ) -> Result<String, BackendError> {
        self.instances
            .lock()
            .insert(ctx.session_name.clone(), "created".to_string());
        self.provisioning.notify_one();
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(ctx.instance_name())
    }

    async fn configure(
        &self,
        ctx: &SessionContext,
        secrets: &BTreeMap<String, String>,
        _identity: &SessionIdentity,
    ) -> Result<(), BackendError> {
        self.secrets_seen
            .lock()
            .insert(ctx.session_name.clone(), secrets.clone());
        Ok(())
    }

    async fn start(&self, ctx: &SessionContext) -> Result<String, BackendError> {
        self.instances
            .lock()
            .insert(ctx.session_name.clone(), "running".to_string());
        Ok(format!("http://127.0.0.1:{}", ctx.port.unwrap_or_default()))
    }

    async fn stop(&self, ctx: &SessionContext, _timeout: Duration) -> Result<(), BackendError> {
        if let Some(state) = self.instances.lock().get_mut(&ctx.session_name) {
            *state = "exited".to_string();
        }
        Ok(())
    }

    async fn remove(&self, ctx: &SessionContext) -> Result<(), BackendError> {
        self.instances.lock().remove(&ctx.session_name);
        self.removed.lock().push(ctx.session_name.clone());
        Ok(())
    }

    async fn health_check(
        &self,
        ctx: &SessionContext,
        _timeout: Duration,
    ) -> Result<HealthStatus, BackendError> {
        if self.unhealthy.lock().contains(&ctx.session_name) {
            return Err(BackendError::HealthCheck("container exited".to_string()));
        }
        Ok(HealthStatus::healthy())
    }

    async fn exec_command(
        &self,
        _ctx: &SessionContext,
        command: &[String],
    ) -> Result<ExecOutput, BackendError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: command.join(" "),
            stderr: String::new(),
        })
    }

    async fn get_sessions_info(&self) -> Result<Vec<SessionInfo>, BackendError> {
        Ok(self
            .instances
            .lock()
            .iter()
            .map(|(name, status)| SessionInfo {
                backend_kind: BackendKind::Docker,
                session_name: name.clone(),
                instance_id: format!("enclave-{}", name),
                status: status.clone(),
                image: None,
            })
            .collect())
    }
}

pub struct StaticSecrets(pub BTreeMap<String, String>);

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn resolve(&self, _context: &SecretsContext) -> Result<BTreeMap<String, String>, HubError> {
        Ok(self.0.clone())
    }
}

pub struct AcceptAll;

#[async_trait]
impl ImageVerifier for AcceptAll {
    async fn verify(&self, _image: &str, _mode: ImageVerificationMode) -> VerificationResult {
        VerificationResult::verified()
    }
}

pub struct NoProfiles;

#[async_trait]
impl ProfileEnvironmentSource for NoProfiles {
    async fn read(&self, _profile: &str) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

pub struct TestHub {
    pub hub: Hub,
    pub backend: Arc<InMemoryBackend>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStateStore>,
    pub events: EventBus,
}

pub fn agents() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new("developer", "ghcr.io/acme/developer:1")
            .with_capabilities(["fs.read", "fs.write"])
            .hardened(true),
        AgentDefinition::new("reviewer", "ghcr.io/acme/reviewer:1").with_capabilities(["fs.read"]),
    ]
}

pub fn config() -> HubConfigManifest {
    let mut config = HubConfigManifest::default();
    config.spec.agents = agents();
    config.spec.health.failure_threshold = 3;
    config.spec.hub.audit_capacity = 100;
    config
}

pub async fn hub_with(config: HubConfigManifest, store: Arc<InMemoryStateStore>) -> TestHub {
    let backend = Arc::new(InMemoryBackend::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let events = EventBus::new(256);
    let secrets = BTreeMap::from([("GITHUB_TOKEN".to_string(), "ghp_test".to_string())]);

    let hub = Hub::new(
        &config,
        HubDependencies {
            backends: vec![backend.clone() as Arc<dyn SessionBackend>],
            secrets: Arc::new(StaticSecrets(secrets)),
            image_verifier: Arc::new(AcceptAll),
            profiles: Arc::new(NoProfiles),
            events: Arc::new(events.clone()),
            store: store.clone(),
            clock: clock.clone(),
        },
    );
    hub.init().await.unwrap();

    TestHub {
        hub,
        backend,
        clock,
        store,
        events,
    }
}

pub async fn hub() -> TestHub {
    hub_with(config(), Arc::new(InMemoryStateStore::new())).await
}
