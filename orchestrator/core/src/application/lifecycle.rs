// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Lifecycle Controller
//!
//! Drives a session through provision → configure → start → monitor against
//! the backend selected by [`BackendKind`], and owns every
//! [`SessionContext`] while it exists.
//!
//! ## Pipelines
//!
//! A pipeline is split into [`reserve`](SessionLifecycleController::reserve),
//! which claims the session name synchronously, and
//! [`run_reserved`](SessionLifecycleController::run_reserved), which runs the
//! phases on their own tokio task. A second reservation for a name that is
//! in flight or still tracked fails with [`HubError::SessionBusy`].
//!
//! Any phase failure drives the session through `RECYCLING` to `RECYCLED`
//! and the original error is returned. A recycle requested while the
//! pipeline is in flight is recorded on the pipeline's cancellation flag and
//! honored as soon as the current phase finishes. Pipeline tasks are held in
//! a `TaskTracker`, so shutdown can wait for flagged pipelines to finish
//! recycling before the process exits.
//!
//! ## Tracking
//!
//! Sessions in `MONITORING` are the health monitor's tracked set. The table
//! is a `DashMap`, so the monitor can snapshot it while pipelines insert and
//! remove entries.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::application::volumes::VolumeResolver;
use crate::domain::clock::Clock;
use crate::domain::collaborators::{
    EventSink, ImageVerificationMode, ImageVerifier, SecretsContext, SecretsProvider,
};
use crate::domain::error::HubError;
use crate::domain::events::HubEvent;
use crate::domain::runtime::{
    BackendError, ExecOutput, SessionBackend, SessionIdentity, SessionInfo, VolumeMount,
};
use crate::domain::session::{
    validate_session_name, BackendKind, SessionContext, SessionPhase, SessionState,
};
use crate::domain::task::TaskId;
use crate::domain::token::TokenId;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub default_ttl: Duration,
    pub port_base: u16,
    pub stop_timeout: Duration,
    pub image_verification: ImageVerificationMode,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(2 * 3600),
            port_base: 18080,
            stop_timeout: Duration::from_secs(10),
            image_verification: ImageVerificationMode::Off,
        }
    }
}

/// Everything `run_pipeline` needs to bring one session up.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_name: String,
    pub role: String,
    pub image: String,
    pub backend_kind: BackendKind,
    pub hardened: bool,
    pub volumes: Vec<VolumeMount>,
    pub secrets: SecretsContext,
    /// `None` uses the configured default TTL.
    pub ttl: Option<Duration>,
    pub task_id: Option<TaskId>,
    pub token_id: Option<TokenId>,
}

impl SessionRequest {
    pub fn new(
        session_name: impl Into<String>,
        role: impl Into<String>,
        image: impl Into<String>,
        backend_kind: BackendKind,
    ) -> Self {
        let session_name = session_name.into();
        let role = role.into();
        Self {
            secrets: SecretsContext {
                session_name: session_name.clone(),
                role: role.clone(),
                task_id: None,
                requested: Vec::new(),
            },
            session_name,
            role,
            image: image.into(),
            backend_kind,
            hardened: false,
            volumes: Vec::new(),
            ttl: None,
            task_id: None,
            token_id: None,
        }
    }

    pub fn hardened(mut self, hardened: bool) -> Self {
        self.hardened = hardened;
        self
    }

    pub fn with_volumes(mut self, volumes: Vec<VolumeMount>) -> Self {
        self.volumes = volumes;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn for_task(mut self, task_id: TaskId, token_id: TokenId) -> Self {
        self.task_id = Some(task_id);
        self.token_id = Some(token_id);
        self.secrets.task_id = Some(task_id);
        self
    }
}

/// Claim on a session name, handed from `reserve` to `run_reserved`.
#[derive(Debug)]
pub struct PipelineTicket {
    session_name: String,
    cancel: Arc<AtomicBool>,
}

impl PipelineTicket {
    pub fn session_name(&self) -> &str {
        &self.session_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleRequest {
    /// The pipeline is still in flight and will recycle after its current phase.
    Deferred,
    Recycled,
    /// Nothing tracked under that name, or it is already winding down.
    NotTracked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy { failures: u32 },
    Recycle { reason: String },
    /// The session left `MONITORING` while the check was running.
    Untracked,
}

pub struct LifecycleDependencies {
    pub backends: Vec<Arc<dyn SessionBackend>>,
    pub secrets: Arc<dyn SecretsProvider>,
    pub image_verifier: Arc<dyn ImageVerifier>,
    pub volumes: VolumeResolver,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct SessionLifecycleController {
    backends: HashMap<BackendKind, Arc<dyn SessionBackend>>,
    sessions: DashMap<String, SessionContext>,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
    pipelines: TaskTracker,
    ports: Mutex<BTreeSet<u16>>,
    secrets: Arc<dyn SecretsProvider>,
    image_verifier: Arc<dyn ImageVerifier>,
    volumes: VolumeResolver,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl SessionLifecycleController {
    pub fn new(config: LifecycleConfig, deps: LifecycleDependencies) -> Self {
        let backends = deps
            .backends
            .into_iter()
            .map(|backend| (backend.kind(), backend))
            .collect();
        Self {
            backends,
            sessions: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            pipelines: TaskTracker::new(),
            ports: Mutex::new(BTreeSet::new()),
            secrets: deps.secrets,
            image_verifier: deps.image_verifier,
            volumes: deps.volumes,
            events: deps.events,
            clock: deps.clock,
            config,
        }
    }

    pub fn backend(&self, kind: BackendKind) -> Result<Arc<dyn SessionBackend>, HubError> {
        self.backends.get(&kind).cloned().ok_or_else(|| {
            HubError::Backend(BackendError::Unavailable(format!(
                "no {} backend is configured",
                kind
            )))
        })
    }

    /// Reserve and run in one step.
    pub async fn run_pipeline(
        self: &Arc<Self>,
        request: SessionRequest,
    ) -> Result<SessionContext, HubError> {
        let ticket = self.reserve(&request)?;
        self.run_reserved(ticket, request).await
    }

    /// Claims `request.session_name` and starts tracking it in `PROVISIONING`.
    pub fn reserve(&self, request: &SessionRequest) -> Result<PipelineTicket, HubError> {
        validate_session_name(&request.session_name)?;
        self.backend(request.backend_kind)?;
        if request.image.trim().is_empty() {
            return Err(HubError::Validation("session image is empty".to_string()));
        }

        let name = request.session_name.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&name) || self.sessions.contains_key(&name) {
                return Err(HubError::SessionBusy(name));
            }
            in_flight.insert(name.clone(), cancel.clone());

            let mut ctx = SessionContext::new(
                name.clone(),
                request.backend_kind,
                request.role.clone(),
                request.image.clone(),
                request.hardened,
                request.ttl.unwrap_or(self.config.default_ttl),
                self.clock.now(),
            );
            ctx.task_id = request.task_id;
            self.sessions.insert(name.clone(), ctx);
        }

        debug!(session = %name, backend = %request.backend_kind, "Session reserved");
        Ok(PipelineTicket {
            session_name: name,
            cancel,
        })
    }

    /// Runs the phases for a reserved session on an independent tokio task
    /// and waits for the outcome.
    pub async fn run_reserved(
        self: &Arc<Self>,
        ticket: PipelineTicket,
        request: SessionRequest,
    ) -> Result<SessionContext, HubError> {
        let name = ticket.session_name.clone();
        let this = Arc::clone(self);
        let handle = self
            .pipelines
            .spawn(async move { this.drive(ticket, request).await });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(session = %name, "Session pipeline task aborted: {}", join_error);
                self.in_flight.lock().remove(&name);
                if let Err(e) = self.recycle_session(&name).await {
                    warn!(session = %name, "Recycle after aborted pipeline failed: {}", e);
                }
                Err(HubError::Internal(format!(
                    "session pipeline for {} aborted: {}",
                    name, join_error
                )))
            }
        }
    }

    async fn drive(
        &self,
        ticket: PipelineTicket,
        request: SessionRequest,
    ) -> Result<SessionContext, HubError> {
        let name = ticket.session_name.clone();
        let outcome = self.run_phases(&ticket, &request).await;

        // Leaving the in-flight set and reading the flag happen under one
        // lock, so a concurrent request_recycle either sets the flag first or
        // finds the session no longer in flight and recycles it itself.
        let cancelled = {
            let mut in_flight = self.in_flight.lock();
            in_flight.remove(&name);
            ticket.cancel.load(Ordering::SeqCst)
        };

        match outcome {
            Ok(ctx) if !cancelled => {
                info!(
                    session = %name,
                    backend = %ctx.backend_kind,
                    endpoint = ?ctx.endpoint,
                    "Session is running and monitored"
                );
                Ok(ctx)
            }
            Ok(_) => {
                info!(session = %name, "Recycle requested during pipeline, recycling");
                self.recycle_quietly(&name).await;
                Err(HubError::SessionCancelled {
                    session: name,
                    phase: SessionPhase::Monitor,
                })
            }
            Err(err) => {
                warn!(session = %name, phase = ?err.phase(), "Session pipeline failed: {}", err);
                self.recycle_quietly(&name).await;
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        ticket: &PipelineTicket,
        request: &SessionRequest,
    ) -> Result<SessionContext, HubError> {
        let name = ticket.session_name.as_str();
        let backend = self.backend(request.backend_kind)?;

        // Provision
        let port = self.allocate_port()?;
        self.update(name, |ctx| ctx.port = Some(port))?;
        self.verify_image(name, &request.image).await?;
        let volumes = self
            .volumes
            .resolve(name, &request.role, &request.volumes)
            .await;
        let ctx = self.snapshot(name)?;
        let instance_id = backend
            .provision(&ctx, &request.image, &volumes, request.hardened)
            .await
            .map_err(|e| HubError::provision(SessionPhase::Provision, e))?;
        self.update(name, |ctx| ctx.instance_id = Some(instance_id))?;
        self.check_cancelled(ticket, SessionPhase::Provision)?;
        self.advance(name, SessionState::Configuring)?;

        // Configure
        let secrets = self
            .secrets
            .resolve(&request.secrets)
            .await
            .map_err(|e| {
                HubError::provision(SessionPhase::Configure, BackendError::Configure(e.to_string()))
            })?;
        let identity = SessionIdentity {
            session_name: name.to_string(),
            role: request.role.clone(),
            token_id: request.token_id.clone(),
            task_id: request.task_id,
        };
        let ctx = self.snapshot(name)?;
        backend
            .configure(&ctx, &secrets, &identity)
            .await
            .map_err(|e| HubError::provision(SessionPhase::Configure, e))?;
        self.check_cancelled(ticket, SessionPhase::Configure)?;
        self.advance(name, SessionState::Starting)?;

        // Start
        let ctx = self.snapshot(name)?;
        let endpoint = backend
            .start(&ctx)
            .await
            .map_err(|e| HubError::provision(SessionPhase::Start, e))?;
        self.update(name, |ctx| ctx.endpoint = Some(endpoint))?;
        self.check_cancelled(ticket, SessionPhase::Start)?;

        // Monitor: entering MONITORING is what registers it with the health monitor.
        self.advance(name, SessionState::Running)?;
        self.advance(name, SessionState::Monitoring)?;
        self.snapshot(name)
    }

    async fn verify_image(&self, session: &str, image: &str) -> Result<(), HubError> {
        let mode = self.config.image_verification;
        if mode == ImageVerificationMode::Off {
            return Ok(());
        }

        let result = self.image_verifier.verify(image, mode).await;
        if result.verified {
            debug!(session, image, "Image verified");
            return Ok(());
        }

        let reason = result
            .reason
            .unwrap_or_else(|| "no verification result".to_string());
        match mode {
            ImageVerificationMode::Enforce => Err(HubError::provision(
                SessionPhase::Provision,
                BackendError::ImageVerification(format!("{}: {}", image, reason)),
            )),
            _ => {
                warn!(session, image, reason = %reason, "Image verification failed, continuing");
                Ok(())
            }
        }
    }

    /// Requests a recycle. In-flight pipelines are flagged and recycle
    /// themselves after their current phase.
    pub async fn request_recycle(&self, name: &str) -> Result<RecycleRequest, HubError> {
        {
            let in_flight = self.in_flight.lock();
            if let Some(flag) = in_flight.get(name) {
                flag.store(true, Ordering::SeqCst);
                debug!(session = name, "Recycle deferred until the current phase completes");
                return Ok(RecycleRequest::Deferred);
            }
        }

        if self.recycle_session(name).await? {
            Ok(RecycleRequest::Recycled)
        } else {
            Ok(RecycleRequest::NotTracked)
        }
    }

    /// Stops and removes the backend instance and drops the session from
    /// tracking. Returns `false` if there was nothing to recycle.
    pub async fn recycle_session(&self, name: &str) -> Result<bool, HubError> {
        let (ctx, from) = {
            let Some(mut entry) = self.sessions.get_mut(name) else {
                return Ok(false);
            };
            if entry.state.is_winding_down() {
                return Ok(false);
            }
            let from = entry.state;
            entry.transition(SessionState::Recycling)?;
            (entry.clone(), from)
        };
        self.emit_state(&ctx, from, SessionState::Recycling);

        let backend = self.backend(ctx.backend_kind)?;
        if let Err(e) = backend.stop(&ctx, self.config.stop_timeout).await {
            warn!(session = name, "Stop failed during recycle: {}", e);
        }
        if let Err(e) = backend.remove(&ctx).await {
            warn!(session = name, "Remove failed during recycle: {}", e);
        }

        if let Some(port) = ctx.port {
            self.ports.lock().remove(&port);
        }
        self.sessions.remove(name);
        self.emit_state(&ctx, SessionState::Recycling, SessionState::Recycled);
        metrics::counter!("enclave_sessions_recycled_total", "backend" => ctx.backend_kind.as_str())
            .increment(1);
        info!(session = name, backend = %ctx.backend_kind, "Session recycled");
        Ok(true)
    }

    async fn recycle_quietly(&self, name: &str) {
        if let Err(e) = self.recycle_session(name).await {
            error!(session = name, "Failed to recycle session: {}", e);
        }
    }

    /// Applies one health check result. Resets or increments the failure
    /// counter and decides whether the session must be recycled.
    pub fn record_health_result(
        &self,
        name: &str,
        healthy: bool,
        threshold: u32,
    ) -> HealthVerdict {
        let now = self.clock.now();
        let Some(mut entry) = self.sessions.get_mut(name) else {
            return HealthVerdict::Untracked;
        };
        if entry.state != SessionState::Monitoring {
            return HealthVerdict::Untracked;
        }

        if healthy {
            entry.health_failures = 0;
        } else {
            entry.health_failures = entry.health_failures.saturating_add(1);
        }

        if !healthy && entry.health_failures >= threshold {
            HealthVerdict::Recycle {
                reason: format!("{} consecutive failed health checks", entry.health_failures),
            }
        } else if entry.ttl_elapsed(now) {
            HealthVerdict::Recycle {
                reason: format!("ttl of {:?} elapsed", entry.ttl),
            }
        } else if !healthy {
            HealthVerdict::Unhealthy {
                failures: entry.health_failures,
            }
        } else {
            HealthVerdict::Healthy
        }
    }

    pub async fn exec_in_session(
        &self,
        name: &str,
        command: &[String],
    ) -> Result<ExecOutput, HubError> {
        let ctx = self
            .get_session(name)
            .filter(|ctx| ctx.state == SessionState::Monitoring)
            .ok_or_else(|| HubError::SessionNotFound(name.to_string()))?;
        if command.is_empty() {
            return Err(HubError::Validation("command is empty".to_string()));
        }
        let backend = self.backend(ctx.backend_kind)?;
        Ok(backend.exec_command(&ctx, command).await?)
    }

    pub async fn get_sessions_info(&self, kind: BackendKind) -> Result<Vec<SessionInfo>, HubError> {
        let backend = self.backend(kind)?;
        Ok(backend.get_sessions_info().await?)
    }

    pub fn get_session(&self, name: &str) -> Option<SessionContext> {
        self.sessions.get(name).map(|entry| entry.value().clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionContext> {
        let mut sessions: Vec<SessionContext> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        sessions
    }

    /// The health monitor's tracked set.
    pub fn monitored_sessions(&self) -> Vec<SessionContext> {
        self.sessions
            .iter()
            .filter(|entry| entry.state == SessionState::Monitoring)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.in_flight.lock().contains_key(name)
    }

    /// Recycles every tracked session. Used on shutdown.
    ///
    /// In-flight pipelines are flagged and awaited, so no instance they
    /// created outlives this call.
    pub async fn recycle_all(&self) {
        let names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if self.is_in_flight(&name) {
                match self.request_recycle(&name).await {
                    Ok(outcome) => debug!(session = %name, ?outcome, "Recycle requested on shutdown"),
                    Err(e) => warn!(session = %name, "Recycle request on shutdown failed: {}", e),
                }
            } else {
                self.recycle_quietly(&name).await;
            }
        }

        self.wait_for_pipelines().await;

        // Pipelines reserved after the first pass.
        let leftover: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for name in leftover {
            self.recycle_quietly(&name).await;
        }
    }

    /// Waits until every spawned pipeline task has finished.
    pub async fn wait_for_pipelines(&self) {
        let pending = self.pipelines.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight session pipelines");
        }
        self.pipelines.close();
        self.pipelines.wait().await;
        self.pipelines.reopen();
    }

    fn allocate_port(&self) -> Result<u16, HubError> {
        let mut ports = self.ports.lock();
        let port = (self.config.port_base..=u16::MAX)
            .find(|p| !ports.contains(p))
            .ok_or_else(|| {
                HubError::provision(
                    SessionPhase::Provision,
                    BackendError::Provision("no free ports left".to_string()),
                )
            })?;
        ports.insert(port);
        Ok(port)
    }

    fn check_cancelled(&self, ticket: &PipelineTicket, phase: SessionPhase) -> Result<(), HubError> {
        if ticket.cancel.load(Ordering::SeqCst) {
            return Err(HubError::SessionCancelled {
                session: ticket.session_name.clone(),
                phase,
            });
        }
        Ok(())
    }

    fn snapshot(&self, name: &str) -> Result<SessionContext, HubError> {
        self.get_session(name)
            .ok_or_else(|| HubError::SessionNotFound(name.to_string()))
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut SessionContext)) -> Result<(), HubError> {
        let mut entry = self
            .sessions
            .get_mut(name)
            .ok_or_else(|| HubError::SessionNotFound(name.to_string()))?;
        apply(entry.value_mut());
        Ok(())
    }

    fn advance(&self, name: &str, next: SessionState) -> Result<(), HubError> {
        let (ctx, from) = {
            let mut entry = self
                .sessions
                .get_mut(name)
                .ok_or_else(|| HubError::SessionNotFound(name.to_string()))?;
            let from = entry.state;
            entry.transition(next)?;
            (entry.clone(), from)
        };
        self.emit_state(&ctx, from, next);
        Ok(())
    }

    fn emit_state(&self, ctx: &SessionContext, from: SessionState, to: SessionState) {
        debug!(session = %ctx.session_name, %from, %to, "Session state changed");
        self.events.emit(HubEvent::SessionStateChanged {
            session_name: ctx.session_name.clone(),
            backend_kind: ctx.backend_kind,
            from,
            to,
            changed_at: self.clock.now(),
        });
    }
}
