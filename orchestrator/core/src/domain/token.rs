// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Tokens
//!
//! A [`Token`] is a time-scoped, capability-scoped credential binding one
//! agent to one task. Tokens expire purely by time: there is no active flag,
//! and `expiry` never changes after issuance. Revocation removes the token
//! from the registry outright.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::task::TaskId;

/// Opaque credential string handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new() -> Self {
        Self(format!("tok_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TokenId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: TokenId,
    pub agent_name: String,
    pub task_id: TaskId,
    pub capabilities: BTreeSet<String>,
    pub issued: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl Token {
    pub fn new(
        agent_name: impl Into<String>,
        task_id: TaskId,
        capabilities: BTreeSet<String>,
        issued: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            token_id: TokenId::new(),
            agent_name: agent_name.into(),
            task_id,
            capabilities,
            issued,
            expiry: issued + ttl,
        }
    }

    /// A token is valid strictly before its expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}
