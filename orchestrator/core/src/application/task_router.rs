// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Router
//!
//! Owns every [`Task`] and ties it to a token and a session.
//!
//! `submit_task` marks the task `RUNNING` before the session pipeline starts,
//! so a crash mid-provision leaves it observably `RUNNING` and the
//! reconciler fails it, rather than it sitting in `PENDING` forever. Every
//! terminal transition revokes the task's token and recycles its session.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::lifecycle::{SessionLifecycleController, SessionRequest};
use crate::application::registry::AgentRegistry;
use crate::domain::clock::Clock;
use crate::domain::collaborators::EventSink;
use crate::domain::error::HubError;
use crate::domain::events::HubEvent;
use crate::domain::policy::PolicyEngine;
use crate::domain::session::BackendKind;
use crate::domain::task::{Task, TaskId, TaskStatus};

/// Error recorded on tasks whose session disappeared underneath them.
pub const SESSION_LOST_ERROR: &str = "session missing or recycled";

#[derive(Debug, Clone)]
pub struct TaskRouterConfig {
    pub reconcile_interval: Duration,
    pub backend: BackendKind,
    /// `None` uses the registry's default token TTL.
    pub token_ttl: Option<Duration>,
}

impl Default for TaskRouterConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            backend: BackendKind::Docker,
            token_ttl: None,
        }
    }
}

pub struct TaskRouter {
    tasks: Mutex<HashMap<TaskId, Task>>,
    registry: Arc<AgentRegistry>,
    policy: PolicyEngine,
    lifecycle: Arc<SessionLifecycleController>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: TaskRouterConfig,
    shutdown_token: CancellationToken,
}

impl TaskRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        lifecycle: Arc<SessionLifecycleController>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: TaskRouterConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            registry,
            policy: PolicyEngine::new(),
            lifecycle,
            events,
            clock,
            config,
            shutdown_token,
        }
    }

    /// Creates a task for `agent_name` and brings up its session.
    ///
    /// Fails without creating anything if the agent is unknown or policy
    /// denies the assignment. A pipeline failure leaves the task `FAILED`
    /// with its token revoked and is returned to the caller.
    pub async fn submit_task(&self, description: &str, agent_name: &str) -> Result<Task, HubError> {
        let agent = self.registry.get_agent(agent_name)?;
        let decision = self
            .policy
            .evaluate_task_assignment(Some(&agent), description);
        if !decision.allowed {
            return Err(HubError::policy_denied(decision.reason_or_default()));
        }

        let task = Task::new(description, agent_name, self.clock.now());
        let task_id = task.id;
        self.tasks.lock().insert(task_id, task);
        metrics::counter!("enclave_tasks_submitted_total").increment(1);
        self.events.emit(HubEvent::TaskSubmitted {
            task_id,
            agent_name: agent_name.to_string(),
            submitted_at: self.clock.now(),
        });
        info!(task_id = %task_id, agent = agent_name, "Task submitted");

        let token = match self
            .registry
            .issue_token(agent_name, task_id, self.config.token_ttl)
        {
            Ok(token) => token,
            Err(e) => {
                self.tasks.lock().remove(&task_id);
                return Err(e);
            }
        };

        let session_name = session_name_for(agent_name, &task_id);
        let request = SessionRequest::new(
            session_name.clone(),
            agent_name,
            agent.image.clone(),
            self.config.backend,
        )
        .hardened(agent.hardened)
        .for_task(task_id, token.token_id.clone());

        // Reservation and the RUNNING transition happen under the task lock,
        // so the reconciler never sees a RUNNING task without its session.
        let reservation = {
            let mut tasks = self.tasks.lock();
            let task = tasks
                .get_mut(&task_id)
                .ok_or(HubError::TaskNotFound(task_id))?;
            task.token_id = Some(token.token_id.clone());

            if task.status != TaskStatus::Pending {
                Err(HubError::InvalidTaskTransition {
                    task_id,
                    from: task.status,
                    to: TaskStatus::Running,
                })
            } else {
                let reservation = self.lifecycle.reserve(&request);
                task.session_name = Some(session_name.clone());
                let now = self.clock.now();
                task.start(now)?;
                if let Err(e) = &reservation {
                    task.fail(e.to_string(), now)?;
                }
                reservation
            }
        };

        let ticket = match reservation {
            Ok(ticket) => {
                self.emit_status(task_id, TaskStatus::Pending, TaskStatus::Running, None);
                ticket
            }
            Err(e) => {
                self.registry.revoke_token(&token.token_id);
                if !matches!(e, HubError::InvalidTaskTransition { .. }) {
                    self.emit_status(task_id, TaskStatus::Pending, TaskStatus::Running, None);
                    self.record_terminal(task_id, TaskStatus::Running, TaskStatus::Failed, Some(e.to_string()));
                }
                return Err(e);
            }
        };

        match self.lifecycle.run_reserved(ticket, request).await {
            Ok(ctx) => {
                info!(
                    task_id = %task_id,
                    session = %ctx.session_name,
                    endpoint = ?ctx.endpoint,
                    "Task session is up"
                );
                self.get_task(&task_id)
            }
            Err(e) => {
                let failed = {
                    let mut tasks = self.tasks.lock();
                    match tasks.get_mut(&task_id) {
                        Some(task) if task.status == TaskStatus::Running => {
                            task.fail(e.to_string(), self.clock.now())?;
                            true
                        }
                        _ => false,
                    }
                };
                self.registry.revoke_token(&token.token_id);

                if failed {
                    error!(task_id = %task_id, "Task failed while bringing up its session: {}", e);
                    self.record_terminal(task_id, TaskStatus::Running, TaskStatus::Failed, Some(e.to_string()));
                    Err(e)
                } else {
                    // Already terminal through cancel/complete/fail; the
                    // pipeline's own outcome is discarded.
                    debug!(task_id = %task_id, "Discarding pipeline outcome of terminal task: {}", e);
                    self.get_task(&task_id)
                }
            }
        }
    }

    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        result: serde_json::Value,
    ) -> Result<Task, HubError> {
        let task = self.transition(task_id, |task, now| task.complete(result, now))?;
        self.finish(&task, TaskStatus::Running).await;
        Ok(task)
    }

    pub async fn fail_task(&self, task_id: &TaskId, error: &str) -> Result<Task, HubError> {
        let task = self.transition(task_id, |task, now| task.fail(error, now))?;
        self.finish(&task, TaskStatus::Running).await;
        Ok(task)
    }

    /// Valid from `PENDING` (token revoke only) and `RUNNING` (revoke and recycle).
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<Task, HubError> {
        let mut from = TaskStatus::Pending;
        let task = self.transition(task_id, |task, now| {
            from = task.status;
            task.cancel(now)
        })?;
        self.finish(&task, from).await;
        Ok(task)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task, HubError> {
        self.tasks
            .lock()
            .get(task_id)
            .cloned()
            .ok_or(HubError::TaskNotFound(*task_id))
    }

    /// Oldest first. `None` lists every task.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Fails every `RUNNING` task whose session is neither in flight nor
    /// tracked. Returns the ids of the tasks it failed.
    pub async fn check_running_tasks(&self) -> Vec<TaskId> {
        let lost: Vec<TaskId> = {
            let tasks = self.tasks.lock();
            tasks
                .values()
                .filter(|task| task.status == TaskStatus::Running)
                .filter(|task| match &task.session_name {
                    Some(name) => !self.session_alive(name),
                    None => true,
                })
                .map(|task| task.id)
                .collect()
        };

        let mut failed = Vec::new();
        for task_id in lost {
            match self.fail_task(&task_id, SESSION_LOST_ERROR).await {
                Ok(_) => {
                    warn!(task_id = %task_id, "Task failed: {}", SESSION_LOST_ERROR);
                    failed.push(task_id);
                }
                // Reached a terminal state on its own since the scan.
                Err(HubError::InvalidTaskTransition { .. }) => {}
                Err(e) => warn!(task_id = %task_id, "Reconciliation failed: {}", e),
            }
        }
        failed
    }

    fn session_alive(&self, name: &str) -> bool {
        if self.lifecycle.is_in_flight(name) {
            return true;
        }
        self.lifecycle
            .get_session(name)
            .is_some_and(|ctx| !ctx.state.is_winding_down())
    }

    pub fn snapshot_tasks(&self) -> Vec<(TaskId, Task)> {
        self.tasks
            .lock()
            .iter()
            .map(|(id, task)| (*id, task.clone()))
            .collect()
    }

    /// Restores persisted tasks, dropping terminal ones. Returns the number restored.
    pub fn restore_tasks(&self, tasks: Vec<(TaskId, Task)>) -> usize {
        let mut table = self.tasks.lock();
        let mut restored = 0;
        for (id, task) in tasks {
            if task.status.is_terminal() {
                continue;
            }
            table.insert(id, task);
            restored += 1;
        }
        restored
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval = ?self.config.reconcile_interval, "Starting task reconciler");
        let mut tick = interval(self.config.reconcile_interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let failed = self.check_running_tasks().await;
                    if !failed.is_empty() {
                        info!(failed = failed.len(), "Reconciliation failed lost tasks");
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping task reconciler");
                    break;
                }
            }
        }
    }

    fn transition(
        &self,
        task_id: &TaskId,
        apply: impl FnOnce(&mut Task, DateTime<Utc>) -> Result<(), HubError>,
    ) -> Result<Task, HubError> {
        let now = self.clock.now();
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or(HubError::TaskNotFound(*task_id))?;
        apply(task, now)?;
        Ok(task.clone())
    }

    /// Terminal side effects: revoke the token, then recycle the session.
    async fn finish(&self, task: &Task, from: TaskStatus) {
        if let Some(token_id) = &task.token_id {
            self.registry.revoke_token(token_id);
        }
        if from == TaskStatus::Running {
            if let Some(session) = &task.session_name {
                match self.lifecycle.request_recycle(session).await {
                    Ok(outcome) => debug!(task_id = %task.id, session = %session, ?outcome, "Session recycle requested"),
                    Err(e) => warn!(task_id = %task.id, session = %session, "Session recycle failed: {}", e),
                }
            }
        }
        self.record_terminal(task.id, from, task.status, task.error.clone());
        info!(task_id = %task.id, status = %task.status, "Task finished");
    }

    fn record_terminal(
        &self,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    ) {
        let status = to.to_string();
        metrics::counter!("enclave_tasks_terminal_total", "status" => status).increment(1);
        self.emit_status(task_id, from, to, reason);
    }

    fn emit_status(&self, task_id: TaskId, from: TaskStatus, to: TaskStatus, reason: Option<String>) {
        self.events.emit(HubEvent::TaskStatusChanged {
            task_id,
            from,
            to,
            reason,
            changed_at: self.clock.now(),
        });
    }
}

/// `<agent>-<first 8 hex digits of the task id>`, with characters that are
/// not valid in session names replaced.
pub fn session_name_for(agent_name: &str, task_id: &TaskId) -> String {
    let mut base: String = agent_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(48)
        .collect();
    if !base.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        base.insert_str(0, "task");
    }
    format!("{}-{}", base, task_id.short())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::validate_session_name;

    #[test]
    fn test_session_name_for() {
        let task_id = TaskId::new();
        let name = session_name_for("researcher", &task_id);
        assert_eq!(name, format!("researcher-{}", task_id.short()));
        assert!(validate_session_name(&name).is_ok());

        let odd = session_name_for("../code reviewer", &task_id);
        assert!(validate_session_name(&odd).is_ok());
        assert!(odd.starts_with("task"));

        let long = session_name_for(&"a".repeat(200), &task_id);
        assert!(validate_session_name(&long).is_ok());
    }
}
