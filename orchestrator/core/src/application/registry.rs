// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent & Token Registry
//!
//! Holds the agent catalog and every live session token behind one mutex.
//! Both routers call in concurrently, so every mutation is serialized here.
//!
//! Expired tokens are pruned lazily on the read paths (`validate_token`,
//! `list_tokens`, `tokens_for_agent`). A bulk sweep also runs, gated so it
//! happens at most once per `sweep_interval` or every `sweep_every_issued`
//! issuances, whichever comes first.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::agent::AgentDefinition;
use crate::domain::clock::Clock;
use crate::domain::error::HubError;
use crate::domain::task::TaskId;
use crate::domain::token::{Token, TokenId};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    pub sweep_every_issued: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            sweep_every_issued: 256,
        }
    }
}

struct RegistryState {
    agents: BTreeMap<String, AgentDefinition>,
    tokens: HashMap<TokenId, Token>,
    last_sweep: DateTime<Utc>,
    issued_since_sweep: usize,
}

pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            state: Mutex::new(RegistryState {
                agents: BTreeMap::new(),
                tokens: HashMap::new(),
                last_sweep: now,
                issued_since_sweep: 0,
            }),
            clock,
            config,
        }
    }

    /// Replaces the whole catalog. Nothing changes if any definition is invalid.
    pub fn load_agents(&self, definitions: Vec<AgentDefinition>) -> Result<usize, HubError> {
        let mut catalog = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            if catalog.contains_key(&definition.name) {
                return Err(HubError::InvalidAgentDefinition(format!(
                    "duplicate agent '{}'",
                    definition.name
                )));
            }
            catalog.insert(definition.name.clone(), definition);
        }

        let count = catalog.len();
        self.state.lock().agents = catalog;
        info!(agents = count, "Agent catalog loaded");
        Ok(count)
    }

    pub fn get_agent(&self, name: &str) -> Result<AgentDefinition, HubError> {
        self.state
            .lock()
            .agents
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::AgentNotFound(name.to_string()))
    }

    pub fn agent_names(&self) -> BTreeSet<String> {
        self.state.lock().agents.keys().cloned().collect()
    }

    pub fn list_agents(&self) -> Vec<AgentDefinition> {
        self.state.lock().agents.values().cloned().collect()
    }

    /// Issues a token carrying all of the agent's capabilities.
    /// `ttl = None` uses the configured default.
    pub fn issue_token(
        &self,
        agent_name: &str,
        task_id: TaskId,
        ttl: Option<Duration>,
    ) -> Result<Token, HubError> {
        self.issue(agent_name, task_id, ttl, None)
    }

    /// Issues a token restricted to `requested`, which must be a subset of
    /// the agent's capabilities.
    pub fn issue_token_with_capabilities(
        &self,
        agent_name: &str,
        task_id: TaskId,
        ttl: Option<Duration>,
        requested: &BTreeSet<String>,
    ) -> Result<Token, HubError> {
        self.issue(agent_name, task_id, ttl, Some(requested))
    }

    fn issue(
        &self,
        agent_name: &str,
        task_id: TaskId,
        ttl: Option<Duration>,
        requested: Option<&BTreeSet<String>>,
    ) -> Result<Token, HubError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            return Err(HubError::Validation("token ttl must be positive".to_string()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| HubError::Validation(format!("token ttl {:?} is out of range", ttl)))?;

        let now = self.clock.now();
        let mut state = self.state.lock();
        let agent = state
            .agents
            .get(agent_name)
            .ok_or_else(|| HubError::AgentNotFound(agent_name.to_string()))?;

        let capabilities = match requested {
            Some(requested) => {
                if let Some(extra) = requested.difference(&agent.capabilities).next() {
                    return Err(HubError::Validation(format!(
                        "capability '{}' is not granted to agent '{}'",
                        extra, agent_name
                    )));
                }
                requested.clone()
            }
            None => agent.capabilities.clone(),
        };

        let token = Token::new(agent_name, task_id, capabilities, now, ttl);
        state.tokens.insert(token.token_id.clone(), token.clone());
        state.issued_since_sweep += 1;
        self.maybe_sweep(&mut state, now);

        debug!(token_id = %token.token_id, agent = agent_name, task_id = %task_id, "Token issued");
        Ok(token)
    }

    /// Succeeds iff the token exists and `now < expiry`. An expired token is
    /// deleted as a side effect.
    pub fn validate_token(&self, token_id: &TokenId) -> Result<Token, HubError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let result = match state.tokens.get(token_id).cloned() {
            None => Err(HubError::TokenInvalid(token_id.clone())),
            Some(token) if !token.is_expired_at(now) => Ok(token),
            Some(_) => {
                state.tokens.remove(token_id);
                debug!(token_id = %token_id, "Expired token pruned on validation");
                Err(HubError::TokenExpired(token_id.clone()))
            }
        };

        self.maybe_sweep(&mut state, now);
        result
    }

    /// Idempotent. Returns whether a token was actually removed.
    pub fn revoke_token(&self, token_id: &TokenId) -> bool {
        let removed = self.state.lock().tokens.remove(token_id).is_some();
        if removed {
            debug!(token_id = %token_id, "Token revoked");
        }
        removed
    }

    /// All unexpired tokens. Expired entries are pruned first.
    pub fn list_tokens(&self) -> Vec<Token> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::sweep(&mut state, now);
        let mut tokens: Vec<Token> = state.tokens.values().cloned().collect();
        tokens.sort_by(|a, b| a.issued.cmp(&b.issued));
        tokens
    }

    /// Currently valid tokens belonging to `agent_name`.
    pub fn tokens_for_agent(&self, agent_name: &str) -> Vec<TokenId> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state
            .tokens
            .retain(|_, t| t.agent_name != agent_name || !t.is_expired_at(now));
        state
            .tokens
            .values()
            .filter(|t| t.agent_name == agent_name)
            .map(|t| t.token_id.clone())
            .collect()
    }

    pub fn snapshot_tokens(&self) -> Vec<(TokenId, Token)> {
        self.state
            .lock()
            .tokens
            .iter()
            .map(|(id, token)| (id.clone(), token.clone()))
            .collect()
    }

    /// Restores persisted tokens, keeping only those still valid now.
    /// Returns the number restored.
    pub fn restore_tokens(&self, tokens: Vec<(TokenId, Token)>) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut restored = 0;
        for (id, token) in tokens {
            if token.is_expired_at(now) {
                continue;
            }
            state.tokens.insert(id, token);
            restored += 1;
        }
        restored
    }

    pub fn token_count(&self) -> usize {
        self.state.lock().tokens.len()
    }

    fn maybe_sweep(&self, state: &mut RegistryState, now: DateTime<Utc>) {
        let interval = chrono::Duration::from_std(self.config.sweep_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let due_by_time = now - state.last_sweep >= interval;
        let due_by_count = state.issued_since_sweep >= self.config.sweep_every_issued.max(1);
        if due_by_time || due_by_count {
            Self::sweep(state, now);
        }
    }

    fn sweep(state: &mut RegistryState, now: DateTime<Utc>) {
        let before = state.tokens.len();
        state.tokens.retain(|_, t| !t.is_expired_at(now));
        let pruned = before - state.tokens.len();
        if pruned > 0 {
            debug!(pruned, "Swept expired tokens");
        }
        state.last_sweep = now;
        state.issued_since_sweep = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;

    fn registry() -> (AgentRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = AgentRegistry::new(RegistryConfig::default(), clock.clone());
        registry
            .load_agents(vec![
                AgentDefinition::new("developer", "alpine").with_capabilities(["fs.read", "fs.write"]),
                AgentDefinition::new("reviewer", "alpine"),
            ])
            .unwrap();
        (registry, clock)
    }

    #[test]
    fn test_load_agents_rejects_invalid_without_replacing() {
        let (registry, _) = registry();
        let err = registry
            .load_agents(vec![AgentDefinition::new("broken", "")])
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidAgentDefinition(_)));
        assert!(registry.get_agent("developer").is_ok());

        let dup = registry.load_agents(vec![
            AgentDefinition::new("a", "img"),
            AgentDefinition::new("a", "img"),
        ]);
        assert!(dup.is_err());
    }

    #[test]
    fn test_issue_token_copies_capabilities() {
        let (registry, _) = registry();
        let token = registry.issue_token("developer", TaskId::new(), None).unwrap();
        assert!(token.has_capability("fs.write"));
        assert_eq!(token.expiry - token.issued, chrono::Duration::seconds(3600));

        let err = registry.issue_token("ghost", TaskId::new(), None).unwrap_err();
        assert!(matches!(err, HubError::AgentNotFound(_)));
        assert_eq!(registry.token_count(), 1);
    }

    #[test]
    fn test_issue_token_with_narrower_capabilities() {
        let (registry, _) = registry();
        let requested: BTreeSet<String> = ["fs.read".to_string()].into_iter().collect();
        let token = registry
            .issue_token_with_capabilities("developer", TaskId::new(), None, &requested)
            .unwrap();
        assert!(token.has_capability("fs.read"));
        assert!(!token.has_capability("fs.write"));

        let widened: BTreeSet<String> = ["net.admin".to_string()].into_iter().collect();
        let err = registry
            .issue_token_with_capabilities("developer", TaskId::new(), None, &widened)
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test]
    fn test_validate_token_expiry_boundary() {
        let (registry, clock) = registry();
        let token = registry
            .issue_token("developer", TaskId::new(), Some(Duration::from_secs(10)))
            .unwrap();

        clock.advance(chrono::Duration::seconds(9));
        assert!(registry.validate_token(&token.token_id).is_ok());

        clock.advance(chrono::Duration::seconds(1));
        let err = registry.validate_token(&token.token_id).unwrap_err();
        assert!(matches!(err, HubError::TokenExpired(_)));

        // Pruned by the failed validation.
        let err = registry.validate_token(&token.token_id).unwrap_err();
        assert!(matches!(err, HubError::TokenInvalid(_)));
        assert!(registry.list_tokens().is_empty());
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let (registry, _) = registry();
        let token = registry.issue_token("developer", TaskId::new(), None).unwrap();
        assert!(registry.revoke_token(&token.token_id));
        assert!(!registry.revoke_token(&token.token_id));
        assert!(!registry.revoke_token(&TokenId::from("tok_unknown")));
        assert_eq!(registry.token_count(), 0);
    }

    #[test]
    fn test_list_tokens_prunes_expired() {
        let (registry, clock) = registry();
        registry
            .issue_token("developer", TaskId::new(), Some(Duration::from_secs(5)))
            .unwrap();
        let long = registry
            .issue_token("reviewer", TaskId::new(), Some(Duration::from_secs(500)))
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let tokens = registry.list_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token_id, long.token_id);
        assert_eq!(registry.token_count(), 1);
    }

    #[test]
    fn test_bulk_sweep_is_count_gated() {
        let clock = Arc::new(ManualClock::default());
        let registry = AgentRegistry::new(
            RegistryConfig {
                default_ttl: Duration::from_secs(1),
                sweep_interval: Duration::from_secs(3600),
                sweep_every_issued: 3,
            },
            clock.clone(),
        );
        registry
            .load_agents(vec![AgentDefinition::new("developer", "alpine")])
            .unwrap();

        registry.issue_token("developer", TaskId::new(), None).unwrap();
        registry.issue_token("developer", TaskId::new(), None).unwrap();
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(registry.token_count(), 2);

        // Third issuance trips the counter and sweeps the two expired tokens.
        registry.issue_token("developer", TaskId::new(), None).unwrap();
        assert_eq!(registry.token_count(), 1);
    }

    #[test]
    fn test_restore_filters_expired() {
        let (registry, clock) = registry();
        let now = clock.now();
        let live = Token::new(
            "developer",
            TaskId::new(),
            BTreeSet::new(),
            now,
            chrono::Duration::seconds(60),
        );
        let dead = Token::new(
            "developer",
            TaskId::new(),
            BTreeSet::new(),
            now - chrono::Duration::seconds(120),
            chrono::Duration::seconds(60),
        );
        let restored = registry.restore_tokens(vec![
            (live.token_id.clone(), live.clone()),
            (dead.token_id.clone(), dead),
        ]);
        assert_eq!(restored, 1);
        assert_eq!(registry.tokens_for_agent("developer"), vec![live.token_id]);
    }
}
