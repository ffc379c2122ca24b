// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Engine
//!
//! Pure, stateless authorization checks. Callers fetch the agent, token and
//! recipient catalog themselves and pass them in; the engine never touches
//! the registry and always returns the same [`PolicyResult`] for the same
//! inputs.
//!
//! ## Decision Table
//! | Check | Denied when |
//! |-------|-------------|
//! | task assignment | agent missing, description empty or whitespace |
//! | message | token missing or expired, recipient neither a known agent nor `"hub"`, payload has no `type` |
//! | capability | capability not in the token's set |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::agent::AgentDefinition;
use crate::domain::message::HUB_RECIPIENT;
use crate::domain::token::Token;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }

    /// Denial reason, or a generic one if the result carries none.
    pub fn reason_or_default(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| "denied by policy".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate_task_assignment(
        &self,
        agent: Option<&AgentDefinition>,
        task_description: &str,
    ) -> PolicyResult {
        if agent.is_none() {
            return PolicyResult::deny("agent is missing");
        }
        if task_description.trim().is_empty() {
            return PolicyResult::deny("description is empty");
        }
        PolicyResult::allow()
    }

    /// `payload` is the full message envelope; it must carry a non-empty
    /// string `type` field.
    pub fn evaluate_message(
        &self,
        token: Option<&Token>,
        recipient: &str,
        payload: &serde_json::Value,
        known_agents: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> PolicyResult {
        let Some(token) = token else {
            return PolicyResult::deny("token is missing");
        };
        if token.is_expired_at(now) {
            return PolicyResult::deny("token has expired");
        }
        if recipient != HUB_RECIPIENT && !known_agents.contains(recipient) {
            return PolicyResult::deny("unknown recipient");
        }
        let has_type = payload
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| !t.trim().is_empty());
        if !has_type {
            return PolicyResult::deny("payload is missing a type field");
        }
        PolicyResult::allow()
    }

    /// Not wired into the routers by default; callers needing finer-grained
    /// authorization invoke it explicitly.
    pub fn evaluate_capability(
        &self,
        token: Option<&Token>,
        required_capability: &str,
    ) -> PolicyResult {
        match token {
            Some(token) if token.has_capability(required_capability) => PolicyResult::allow(),
            Some(_) => PolicyResult::deny(format!("missing capability: {}", required_capability)),
            None => PolicyResult::deny("token is missing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskId;
    use chrono::Duration;

    fn token(now: DateTime<Utc>) -> Token {
        Token::new(
            "developer",
            TaskId::new(),
            ["fs.read".to_string()].into_iter().collect(),
            now,
            Duration::seconds(300),
        )
    }

    fn agents() -> BTreeSet<String> {
        ["developer".to_string(), "reviewer".to_string()]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_task_assignment() {
        let engine = PolicyEngine::new();
        let agent = AgentDefinition::new("developer", "alpine");

        assert!(engine.evaluate_task_assignment(Some(&agent), "fix bug").allowed);

        let denied = engine.evaluate_task_assignment(Some(&agent), "   ");
        assert!(!denied.allowed);
        assert_eq!(denied.reason.as_deref(), Some("description is empty"));

        let missing = engine.evaluate_task_assignment(None, "fix bug");
        assert_eq!(missing.reason.as_deref(), Some("agent is missing"));
    }

    #[test]
    fn test_message_checks_in_order() {
        let engine = PolicyEngine::new();
        let now = Utc::now();
        let token = token(now);
        let envelope = serde_json::json!({"type": "ping", "payload": {}});

        assert!(engine
            .evaluate_message(Some(&token), "reviewer", &envelope, &agents(), now)
            .allowed);
        assert!(engine
            .evaluate_message(Some(&token), "hub", &envelope, &agents(), now)
            .allowed);

        let missing = engine.evaluate_message(None, "reviewer", &envelope, &agents(), now);
        assert_eq!(missing.reason.as_deref(), Some("token is missing"));

        let expired = engine.evaluate_message(
            Some(&token),
            "reviewer",
            &envelope,
            &agents(),
            now + Duration::seconds(300),
        );
        assert_eq!(expired.reason.as_deref(), Some("token has expired"));

        let unknown =
            engine.evaluate_message(Some(&token), "unknown-agent", &envelope, &agents(), now);
        assert_eq!(unknown.reason.as_deref(), Some("unknown recipient"));

        let untyped = engine.evaluate_message(
            Some(&token),
            "reviewer",
            &serde_json::json!({"type": ""}),
            &agents(),
            now,
        );
        assert_eq!(
            untyped.reason.as_deref(),
            Some("payload is missing a type field")
        );
    }

    #[test]
    fn test_capability() {
        let engine = PolicyEngine::new();
        let token = token(Utc::now());
        assert!(engine.evaluate_capability(Some(&token), "fs.read").allowed);
        let denied = engine.evaluate_capability(Some(&token), "fs.write");
        assert_eq!(denied.reason.as_deref(), Some("missing capability: fs.write"));
        assert!(!engine.evaluate_capability(None, "fs.read").allowed);
    }
}
