// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Context
//!
//! A session is one provisioned container or VM bound to an agent role. Its
//! [`SessionContext`] is owned exclusively by the lifecycle controller; the
//! health monitor only reads it and reports check results back.
//!
//! ## State Machine
//!
//! ```text
//! PROVISIONING → CONFIGURING → STARTING → RUNNING → MONITORING → RECYCLING → RECYCLED
//!      │              │            │                               ▲
//!      └──────────────┴────────────┴───────── on failure ──────────┘
//! ```
//!
//! `RECYCLED` is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::error::HubError;
use crate::domain::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Provisioning,
    Configuring,
    Starting,
    Running,
    Monitoring,
    Recycling,
    Recycled,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Provisioning, Configuring)
                | (Configuring, Starting)
                | (Starting, Running)
                | (Running, Monitoring)
                | (Monitoring, Recycling)
                | (Provisioning, Recycling)
                | (Configuring, Recycling)
                | (Starting, Recycling)
                | (Recycling, Recycled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recycled)
    }

    /// Recycling or already recycled.
    pub fn is_winding_down(&self) -> bool {
        matches!(self, Self::Recycling | Self::Recycled)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::Configuring => "CONFIGURING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Monitoring => "MONITORING",
            Self::Recycling => "RECYCLING",
            Self::Recycled => "RECYCLED",
        };
        f.write_str(s)
    }
}

/// Pipeline phase a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Provision,
    Configure,
    Start,
    Monitor,
    Recycle,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Monitor => "monitor",
            Self::Recycle => "recycle",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Vm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Vm => "vm",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Ok(Self::Docker),
            "vm" | "lima" => Ok(Self::Vm),
            other => Err(HubError::Validation(format!(
                "Unknown backend '{}'. Supported: docker, vm",
                other
            ))),
        }
    }
}

/// Session names end up in container and VM instance names, so they are
/// restricted to `[A-Za-z0-9_.-]` and must start with an alphanumeric.
pub fn validate_session_name(name: &str) -> Result<(), HubError> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(HubError::Validation("session name is empty".to_string()));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(HubError::Validation(format!(
            "session name '{}' must start with a letter or digit",
            name
        )));
    }
    if name.len() > 63 {
        return Err(HubError::Validation(format!(
            "session name '{}' is longer than 63 characters",
            name
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(HubError::Validation(format!(
            "session name '{}' contains characters outside [A-Za-z0-9_.-]",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_name: String,
    pub backend_kind: BackendKind,
    pub role: String,
    pub image: String,
    pub state: SessionState,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub hardened: bool,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub health_failures: u32,
    pub created_at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    /// Backend instance identifier returned by `provision`.
    pub instance_id: Option<String>,
}

impl SessionContext {
    pub fn new(
        session_name: impl Into<String>,
        backend_kind: BackendKind,
        role: impl Into<String>,
        image: impl Into<String>,
        hardened: bool,
        ttl: Duration,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            backend_kind,
            role: role.into(),
            image: image.into(),
            state: SessionState::Provisioning,
            port: None,
            endpoint: None,
            hardened,
            ttl,
            health_failures: 0,
            created_at,
            task_id: None,
            instance_id: None,
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), HubError> {
        if !self.state.can_transition_to(next) {
            return Err(HubError::InvalidSessionTransition {
                session: self.session_name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Name of the backing container / VM instance.
    pub fn instance_name(&self) -> String {
        format!("enclave-{}", self.session_name)
    }

    pub fn ttl_elapsed(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now >= self.created_at + ttl,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new(
            "dev-1",
            BackendKind::Docker,
            "developer",
            "alpine:3.20",
            true,
            Duration::from_secs(60),
            Utc::now(),
        )
    }

    #[test]
    fn test_linear_pipeline_transitions() {
        let mut session = ctx();
        for next in [
            SessionState::Configuring,
            SessionState::Starting,
            SessionState::Running,
            SessionState::Monitoring,
            SessionState::Recycling,
            SessionState::Recycled,
        ] {
            session.transition(next).unwrap();
        }
        assert!(session.state.is_terminal());
    }

    #[test]
    fn test_failure_edges_to_recycling() {
        for from in [
            SessionState::Provisioning,
            SessionState::Configuring,
            SessionState::Starting,
            SessionState::Monitoring,
        ] {
            assert!(from.can_transition_to(SessionState::Recycling), "{from}");
        }
        assert!(!SessionState::Running.can_transition_to(SessionState::Recycling));
        assert!(!SessionState::Recycled.can_transition_to(SessionState::Recycling));
    }

    #[test]
    fn test_invalid_transition_does_not_mutate() {
        let mut session = ctx();
        let err = session.transition(SessionState::Monitoring).unwrap_err();
        assert!(matches!(err, HubError::InvalidSessionTransition { .. }));
        assert_eq!(session.state, SessionState::Provisioning);
    }

    #[test]
    fn test_ttl_elapsed() {
        let session = ctx();
        assert!(!session.ttl_elapsed(session.created_at + chrono::Duration::seconds(59)));
        assert!(session.ttl_elapsed(session.created_at + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_session_name_validation() {
        assert!(validate_session_name("researcher-1a2b3c4d").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("-leading-dash").is_err());
        assert!(validate_session_name("has space").is_err());
        assert!(validate_session_name("../escape").is_err());
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("Container".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!("vm".parse::<BackendKind>().unwrap(), BackendKind::Vm);
        assert!("firecracker".parse::<BackendKind>().is_err());
    }
}
