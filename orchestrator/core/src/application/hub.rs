// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Hub
//!
//! Composition root. Builds the registry, lifecycle controller, health
//! monitor, routers and persistence from a [`HubConfigManifest`] plus the
//! injected collaborators, and owns their lifecycle:
//!
//! 1. [`Hub::new`] wires components together.
//! 2. [`Hub::init`] loads the agent catalog and restores persisted state.
//! 3. [`Hub::start`] spawns the health, reconciliation and flush loops.
//! 4. [`Hub::shutdown`] cancels and awaits the loops, waits for in-flight
//!    session pipelines, optionally recycles remaining sessions, then
//!    performs the final flush.
//!
//! Everything an outer transport layer needs is exposed as a method here.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::health_monitor::{HealthCycleReport, HealthMonitor, HealthMonitorConfig};
use crate::application::lifecycle::{
    LifecycleConfig, LifecycleDependencies, RecycleRequest, SessionLifecycleController,
    SessionRequest,
};
use crate::application::message_router::MessageRouter;
use crate::application::persistence::{HubSnapshot, RestoreReport, StatePersistence};
use crate::application::registry::{AgentRegistry, RegistryConfig};
use crate::application::task_router::{TaskRouter, TaskRouterConfig};
use crate::application::volumes::VolumeResolver;
use crate::domain::agent::AgentDefinition;
use crate::domain::clock::Clock;
use crate::domain::collaborators::{
    EventSink, ImageVerifier, PersistenceStore, ProfileEnvironmentSource, SecretsProvider,
};
use crate::domain::config::HubConfigManifest;
use crate::domain::error::HubError;
use crate::domain::message::{AuditEntry, Message, RouteOutcome};
use crate::domain::runtime::{ExecOutput, SessionBackend, SessionInfo, VolumeMount};
use crate::domain::session::{BackendKind, SessionContext};
use crate::domain::task::{Task, TaskId, TaskStatus};
use crate::domain::token::{Token, TokenId};

/// Collaborators the hub is assembled from.
pub struct HubDependencies {
    pub backends: Vec<Arc<dyn SessionBackend>>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub image_verifier: Arc<dyn ImageVerifier>,
    pub profiles: Arc<dyn ProfileEnvironmentSource>,
    pub events: Arc<dyn EventSink>,
    pub store: Arc<dyn PersistenceStore>,
    pub clock: Arc<dyn Clock>,
}

/// Combined view of hub state for display.
#[derive(Debug, Clone, Serialize)]
pub struct HubState {
    pub agents: Vec<AgentDefinition>,
    pub tokens: Vec<Token>,
    pub tasks: Vec<Task>,
    pub sessions: Vec<SessionContext>,
    pub pending_messages: BTreeMap<TokenId, usize>,
    pub audit_log: Vec<AuditEntry>,
}

pub struct Hub {
    registry: Arc<AgentRegistry>,
    lifecycle: Arc<SessionLifecycleController>,
    health: Arc<HealthMonitor>,
    tasks: Arc<TaskRouter>,
    messages: Arc<MessageRouter>,
    persistence: Arc<StatePersistence>,
    agents: Vec<AgentDefinition>,
    default_backend: BackendKind,
    recycle_on_shutdown: bool,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(config: &HubConfigManifest, deps: HubDependencies) -> Self {
        let spec = &config.spec;
        let shutdown_token = CancellationToken::new();

        let registry = Arc::new(AgentRegistry::new(
            RegistryConfig {
                default_ttl: spec.hub.token_ttl,
                sweep_interval: spec.hub.sweep_interval,
                sweep_every_issued: spec.hub.sweep_every_issued,
            },
            deps.clock.clone(),
        ));

        let lifecycle = Arc::new(SessionLifecycleController::new(
            LifecycleConfig {
                default_ttl: spec.sessions.default_ttl,
                port_base: spec.sessions.port_base,
                stop_timeout: spec.sessions.stop_timeout,
                image_verification: spec.image_verification.mode,
            },
            LifecycleDependencies {
                backends: deps.backends,
                secrets: deps.secrets,
                image_verifier: deps.image_verifier,
                volumes: VolumeResolver::new(
                    spec.sessions.data_root.clone(),
                    spec.sessions.workspace_root.clone(),
                    spec.mounts.clone(),
                    deps.profiles,
                ),
                events: deps.events.clone(),
                clock: deps.clock.clone(),
            },
        ));

        let health = Arc::new(HealthMonitor::new(
            lifecycle.clone(),
            deps.events.clone(),
            deps.clock.clone(),
            HealthMonitorConfig {
                interval: spec.health.interval,
                timeout: spec.health.timeout,
                failure_threshold: spec.health.failure_threshold,
            },
            shutdown_token.child_token(),
        ));

        let tasks = Arc::new(TaskRouter::new(
            registry.clone(),
            lifecycle.clone(),
            deps.events.clone(),
            deps.clock.clone(),
            TaskRouterConfig {
                reconcile_interval: spec.hub.reconcile_interval,
                backend: spec.sessions.default_backend,
                token_ttl: None,
            },
            shutdown_token.child_token(),
        ));

        let messages = Arc::new(MessageRouter::new(
            registry.clone(),
            deps.events.clone(),
            deps.clock.clone(),
            spec.hub.audit_capacity,
        ));

        let persistence = Arc::new(StatePersistence::new(
            deps.store,
            registry.clone(),
            tasks.clone(),
            messages.clone(),
            deps.events,
            deps.clock,
            spec.hub.flush_interval,
            shutdown_token.child_token(),
        ));

        Self {
            registry,
            lifecycle,
            health,
            tasks,
            messages,
            persistence,
            agents: spec.agents.clone(),
            default_backend: spec.sessions.default_backend,
            recycle_on_shutdown: spec.hub.recycle_on_shutdown,
            shutdown_token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Loads the configured agent catalog and restores persisted state.
    pub async fn init(&self) -> Result<RestoreReport, HubError> {
        self.registry.load_agents(self.agents.clone())?;
        Ok(self.persistence.restore().await)
    }

    /// Spawns the health monitor, task reconciler and state flusher loops.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Hub background loops already started");
            return;
        }
        handles.push(self.health.clone().start());
        handles.push(self.tasks.clone().start());
        handles.push(self.persistence.clone().start());
        info!("Hub background loops started");
    }

    /// Stops and awaits the background loops, then flushes state one last time.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        info!("Shutting down hub");
        self.shutdown_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background loop ended abnormally: {}", e);
            }
        }

        if self.recycle_on_shutdown {
            self.lifecycle.recycle_all().await;
        } else {
            self.lifecycle.wait_for_pipelines().await;
        }

        self.persistence.flush().await?;
        info!("Hub shut down");
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    // Agents

    pub fn reload_agents(&self, definitions: Vec<AgentDefinition>) -> Result<usize, HubError> {
        self.registry.load_agents(definitions)
    }

    pub fn list_agents(&self) -> Vec<AgentDefinition> {
        self.registry.list_agents()
    }

    pub fn list_tokens(&self) -> Vec<Token> {
        self.registry.list_tokens()
    }

    // Tasks

    pub async fn submit_task(&self, description: &str, agent_name: &str) -> Result<Task, HubError> {
        self.tasks.submit_task(description, agent_name).await
    }

    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        result: serde_json::Value,
    ) -> Result<Task, HubError> {
        self.tasks.complete_task(task_id, result).await
    }

    pub async fn fail_task(&self, task_id: &TaskId, error: &str) -> Result<Task, HubError> {
        self.tasks.fail_task(task_id, error).await
    }

    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<Task, HubError> {
        self.tasks.cancel_task(task_id).await
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task, HubError> {
        self.tasks.get_task(task_id)
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks.list_tasks(status)
    }

    pub async fn check_running_tasks(&self) -> Vec<TaskId> {
        self.tasks.check_running_tasks().await
    }

    // Sessions

    pub async fn run_pipeline(&self, request: SessionRequest) -> Result<SessionContext, HubError> {
        self.lifecycle.run_pipeline(request).await
    }

    /// Runs a session for `agent_name` that is not bound to any task.
    pub async fn create_session(
        &self,
        session_name: &str,
        agent_name: &str,
        backend: Option<BackendKind>,
        volumes: Vec<VolumeMount>,
    ) -> Result<SessionContext, HubError> {
        let agent = self.registry.get_agent(agent_name)?;
        let request = SessionRequest::new(
            session_name,
            agent_name,
            agent.image,
            backend.unwrap_or(self.default_backend),
        )
        .hardened(agent.hardened)
        .with_volumes(volumes);
        self.lifecycle.run_pipeline(request).await
    }

    pub async fn stop_session(&self, session_name: &str) -> Result<RecycleRequest, HubError> {
        match self.lifecycle.request_recycle(session_name).await? {
            RecycleRequest::NotTracked => Err(HubError::SessionNotFound(session_name.to_string())),
            outcome => Ok(outcome),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionContext> {
        self.lifecycle.list_sessions()
    }

    pub async fn get_sessions_info(&self, kind: BackendKind) -> Result<Vec<SessionInfo>, HubError> {
        self.lifecycle.get_sessions_info(kind).await
    }

    pub async fn exec_in_session(
        &self,
        session_name: &str,
        command: &[String],
    ) -> Result<ExecOutput, HubError> {
        self.lifecycle.exec_in_session(session_name, command).await
    }

    /// Runs one health monitoring cycle outside the background loop.
    pub async fn run_health_cycle(&self) -> HealthCycleReport {
        self.health.run_cycle().await
    }

    // Messages

    pub fn route(
        &self,
        sender_token_id: &TokenId,
        recipient: &str,
        message_type: &str,
        payload: serde_json::Value,
    ) -> RouteOutcome {
        self.messages
            .route(sender_token_id, recipient, message_type, payload)
    }

    pub fn drain(&self, token_id: &TokenId) -> Result<Vec<Message>, HubError> {
        self.messages.drain(token_id)
    }

    pub fn drain_hub(&self) -> Vec<Message> {
        self.messages.drain_hub()
    }

    // State

    pub async fn flush(&self) -> Result<HubSnapshot, HubError> {
        self.persistence.flush().await
    }

    pub fn get_hub_state(&self) -> HubState {
        HubState {
            agents: self.registry.list_agents(),
            tokens: self.registry.list_tokens(),
            tasks: self.tasks.list_tasks(None),
            sessions: self.lifecycle.list_sessions(),
            pending_messages: self.messages.pending_counts(),
            audit_log: self.messages.audit_log(),
        }
    }
}
