// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Backend Abstraction
//!
//! [`SessionBackend`] is the capability set every isolation technology must
//! offer to the lifecycle controller. Two variants exist: the Docker
//! container backend and the Lima VM backend
//! (see [`crate::infrastructure`]). The concrete backend for a session is
//! picked by [`BackendKind`], never by duck typing.
//!
//! ## Contract
//!
//! - `provision` with `hardened = true` drops elevated capabilities, mounts
//!   the root filesystem read-only, allows writes only to tmpfs, applies
//!   resource limits and exposes no long-lived terminal channel.
//! - `configure` writes secrets as owner-only files, created atomically at
//!   mode `0600`.
//! - `stop` and `remove` are best-effort graceful then forced, and succeed
//!   when the instance no longer exists.
//! - `health_check` enforces its own timeout and never blocks past it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::domain::session::{BackendKind, SessionContext};
use crate::domain::task::TaskId;
use crate::domain::token::TokenId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            host_path: host_path.into(),
            target: target.into(),
            read_only,
        }
    }
}

/// Identity material written next to the secrets during `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_name: String,
    pub role: String,
    pub token_id: Option<TokenId>,
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            metrics: BTreeMap::new(),
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            metrics: BTreeMap::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// One backend-reported instance carrying the hub's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub backend_kind: BackendKind,
    pub session_name: String,
    pub instance_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("provision failed: {0}")]
    Provision(String),
    #[error("configure failed: {0}")]
    Configure(String),
    #[error("start failed: {0}")]
    Start(String),
    #[error("stop failed: {0}")]
    Stop(String),
    #[error("remove failed: {0}")]
    Remove(String),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("image verification failed: {0}")]
    ImageVerification(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create the instance without starting it. Returns the backend instance id.
    async fn provision(
        &self,
        ctx: &SessionContext,
        image: &str,
        volumes: &[VolumeMount],
        hardened: bool,
    ) -> Result<String, BackendError>;

    async fn configure(
        &self,
        ctx: &SessionContext,
        secrets: &BTreeMap<String, String>,
        identity: &SessionIdentity,
    ) -> Result<(), BackendError>;

    /// Start the instance and return the endpoint it is reachable on.
    async fn start(&self, ctx: &SessionContext) -> Result<String, BackendError>;

    async fn stop(&self, ctx: &SessionContext, timeout: Duration) -> Result<(), BackendError>;

    async fn remove(&self, ctx: &SessionContext) -> Result<(), BackendError>;

    async fn health_check(
        &self,
        ctx: &SessionContext,
        timeout: Duration,
    ) -> Result<HealthStatus, BackendError>;

    async fn exec_command(
        &self,
        ctx: &SessionContext,
        command: &[String],
    ) -> Result<ExecOutput, BackendError>;

    async fn get_sessions_info(&self) -> Result<Vec<SessionInfo>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_builders() {
        let status = HealthStatus::healthy().with_metric("restarts", serde_json::json!(0));
        assert!(status.healthy);
        assert_eq!(status.metrics["restarts"], serde_json::json!(0));

        let down = HealthStatus::unhealthy("container exited");
        assert!(!down.healthy);
        assert_eq!(down.detail.as_deref(), Some("container exited"));
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Timeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "operation timed out after 5s");
    }
}
