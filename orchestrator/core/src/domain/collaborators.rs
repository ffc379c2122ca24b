// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # External Collaborators
//!
//! Narrow interfaces the hub consumes but does not implement itself in the
//! domain layer. Infrastructure adapters live in [`crate::infrastructure`].
//!
//! | Trait | Used by | Default adapter |
//! |-------|---------|-----------------|
//! | [`SecretsProvider`] | lifecycle, configure phase | `EnvSecretsProvider` |
//! | [`ImageVerifier`] | lifecycle, provision phase | `DigestImageVerifier` |
//! | [`ProfileEnvironmentSource`] | volume resolution | `DotenvProfileSource` |
//! | [`EventSink`] | every component | `EventBus` |
//! | [`PersistenceStore`] | state persistence | `FileStateStore` |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::error::HubError;
use crate::domain::events::HubEvent;
use crate::domain::task::TaskId;

/// What the secrets provider is asked to resolve for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsContext {
    pub session_name: String,
    pub role: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Logical secret names; empty means "everything configured for the role".
    #[serde(default)]
    pub requested: Vec<String>,
}

#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Fails with [`HubError::SecretsUnavailable`].
    async fn resolve(&self, context: &SecretsContext) -> Result<BTreeMap<String, String>, HubError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVerificationMode {
    /// Failed or absent verification aborts provisioning.
    Enforce,
    /// Failures are logged and provisioning continues.
    Warn,
    #[default]
    Off,
}

impl std::fmt::Display for ImageVerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enforce => "enforce",
            Self::Warn => "warn",
            Self::Off => "off",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub reason: Option<String>,
}

impl VerificationResult {
    pub fn verified() -> Self {
        Self {
            verified: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            verified: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait ImageVerifier: Send + Sync {
    async fn verify(&self, image: &str, mode: ImageVerificationMode) -> VerificationResult;
}

#[async_trait]
pub trait ProfileEnvironmentSource: Send + Sync {
    /// The cached environment-variable map of a profile. Unknown profiles
    /// yield an empty map.
    async fn read(&self, profile: &str) -> BTreeMap<String, String>;
}

/// Fire-and-forget event publication. Implementations must never block and
/// never fail the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: HubEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: HubEvent) {}
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// `Ok(None)` when no snapshot has been written yet.
    async fn read(&self) -> Result<Option<Vec<u8>>, HubError>;

    /// Must replace the previous snapshot atomically.
    async fn write(&self, bytes: &[u8]) -> Result<(), HubError>;
}
