// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Definitions
//!
//! An [`AgentDefinition`] describes a kind of agent the hub can run: which
//! image backs its sessions, which capabilities its tokens carry and whether
//! its sessions must be hardened. Definitions are immutable once loaded;
//! reloading replaces the whole catalog.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::error::HubError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique catalog key. Also used as the session role and profile name.
    pub name: String,

    /// Backend-specific image reference (container image or VM image location).
    pub image: String,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default)]
    pub hardened: bool,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            capabilities: BTreeSet::new(),
            hardened: false,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn hardened(mut self, hardened: bool) -> Self {
        self.hardened = hardened;
        self
    }

    /// Schema check applied by `load_agents` before the catalog is replaced.
    pub fn validate(&self) -> Result<(), HubError> {
        if self.name.trim().is_empty() {
            return Err(HubError::InvalidAgentDefinition(
                "agent name is missing".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(HubError::InvalidAgentDefinition(format!(
                "agent '{}' has no image",
                self.name
            )));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(HubError::InvalidAgentDefinition(format!(
                "agent '{}' declares an empty capability",
                self.name
            )));
        }
        Ok(())
    }
}
