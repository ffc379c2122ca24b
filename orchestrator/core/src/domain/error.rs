// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Hub Error Taxonomy
//!
//! Every fallible operation exposed by the hub returns [`HubError`]. Backend
//! I/O failures are reported as [`BackendError`](crate::domain::runtime::BackendError)
//! and are wrapped into [`HubError::SessionProvision`] together with the
//! pipeline phase they occurred in.
//!
//! Expected policy rejections on the message path are *not* errors: the
//! message router returns a structured
//! [`RouteOutcome::Rejected`](crate::domain::message::RouteOutcome) instead.

use thiserror::Error;

use crate::domain::runtime::BackendError;
use crate::domain::session::{SessionPhase, SessionState};
use crate::domain::task::{TaskId, TaskStatus};
use crate::domain::token::TokenId;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid agent definition: {0}")]
    InvalidAgentDefinition(String),

    #[error("Policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("Token invalid: {0}")]
    TokenInvalid(TokenId),

    #[error("Token expired: {0}")]
    TokenExpired(TokenId),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Session provisioning failed during {phase} phase: {source}")]
    SessionProvision {
        phase: SessionPhase,
        #[source]
        source: BackendError,
    },

    #[error("Session {session} was cancelled during {phase} phase")]
    SessionCancelled { session: String, phase: SessionPhase },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} already has a pipeline in flight")]
    SessionBusy(String),

    #[error("Invalid session transition for {session}: {from} -> {to}")]
    InvalidSessionTransition {
        session: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid task transition for {task_id}: {from} -> {to}")]
    InvalidTaskTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Secrets unavailable: {0}")]
    SecretsUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn provision(phase: SessionPhase, source: BackendError) -> Self {
        Self::SessionProvision { phase, source }
    }

    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// The pipeline phase this error originated in, if it came from a session pipeline.
    pub fn phase(&self) -> Option<SessionPhase> {
        match self {
            Self::SessionProvision { phase, .. } | Self::SessionCancelled { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }
}
