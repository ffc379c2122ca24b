// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Router
//!
//! Policy-gated, at-most-once delivery between agents. Every `route` call
//! re-validates the sender's token and re-checks policy; rejections come
//! back as [`RouteOutcome::Rejected`] and are audited, never raised.
//!
//! A delivered message is copied onto the pending queue of every valid
//! token held by the recipient agent. Messages addressed to `"hub"` go to a
//! dedicated queue drained by the hub itself.
//!
//! Pending queues and the audit ring buffer share one mutex, and `drain`
//! removes a whole queue in a single step under it, so concurrent drains of
//! the same token never see the same message twice.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::application::registry::AgentRegistry;
use crate::domain::clock::Clock;
use crate::domain::collaborators::EventSink;
use crate::domain::error::HubError;
use crate::domain::events::HubEvent;
use crate::domain::message::{AuditEntry, AuditOutcome, Message, RouteOutcome, HUB_RECIPIENT};
use crate::domain::policy::PolicyEngine;
use crate::domain::token::TokenId;

/// Queue key for messages addressed to the hub.
pub fn hub_queue_id() -> TokenId {
    TokenId::from(HUB_RECIPIENT)
}

struct RouterState {
    pending: HashMap<TokenId, VecDeque<Message>>,
    audit: VecDeque<AuditEntry>,
}

pub struct MessageRouter {
    state: Mutex<RouterState>,
    registry: Arc<AgentRegistry>,
    policy: PolicyEngine,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    audit_capacity: usize,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        audit_capacity: usize,
    ) -> Self {
        Self {
            state: Mutex::new(RouterState {
                pending: HashMap::new(),
                audit: VecDeque::with_capacity(audit_capacity),
            }),
            registry,
            policy: PolicyEngine::new(),
            events,
            clock,
            audit_capacity: audit_capacity.max(1),
        }
    }

    pub fn route(
        &self,
        sender_token_id: &TokenId,
        recipient: &str,
        message_type: &str,
        payload: serde_json::Value,
    ) -> RouteOutcome {
        let now = self.clock.now();

        let token = match self.registry.validate_token(sender_token_id) {
            Ok(token) => token,
            Err(HubError::TokenExpired(_)) => {
                return self.reject(sender_token_id, recipient, message_type, "token expired")
            }
            Err(_) => {
                return self.reject(sender_token_id, recipient, message_type, "invalid token")
            }
        };

        let envelope = serde_json::json!({
            "type": message_type,
            "payload": payload.clone(),
        });
        let decision = self.policy.evaluate_message(
            Some(&token),
            recipient,
            &envelope,
            &self.registry.agent_names(),
            now,
        );
        if !decision.allowed {
            return self.reject(
                sender_token_id,
                recipient,
                message_type,
                &decision.reason_or_default(),
            );
        }

        let message = Message::new(
            sender_token_id.clone(),
            recipient,
            message_type,
            payload,
            now,
        );
        let targets = if recipient == HUB_RECIPIENT {
            vec![hub_queue_id()]
        } else {
            self.registry.tokens_for_agent(recipient)
        };
        let delivered_to = targets.len();

        {
            let mut state = self.state.lock();
            for target in targets {
                state
                    .pending
                    .entry(target)
                    .or_default()
                    .push_back(message.clone());
            }
            self.push_audit(
                &mut state,
                AuditEntry {
                    timestamp: now,
                    outcome: AuditOutcome::Delivered,
                    sender_token_id: sender_token_id.clone(),
                    recipient: recipient.to_string(),
                    message_type: message_type.to_string(),
                    message_id: Some(message.id),
                    reason: None,
                    delivered_to,
                },
            );
        }

        metrics::counter!("enclave_messages_routed_total", "outcome" => "delivered").increment(1);
        self.events.emit(HubEvent::MessageRouted {
            message_id: message.id,
            sender_token_id: sender_token_id.clone(),
            recipient: recipient.to_string(),
            delivered_to,
            routed_at: now,
        });
        debug!(
            message_id = %message.id,
            recipient,
            message_type,
            delivered_to,
            "Message delivered"
        );

        RouteOutcome::Delivered {
            message_id: message.id,
            delivered_to,
        }
    }

    fn reject(
        &self,
        sender_token_id: &TokenId,
        recipient: &str,
        message_type: &str,
        reason: &str,
    ) -> RouteOutcome {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            self.push_audit(
                &mut state,
                AuditEntry {
                    timestamp: now,
                    outcome: AuditOutcome::Rejected,
                    sender_token_id: sender_token_id.clone(),
                    recipient: recipient.to_string(),
                    message_type: message_type.to_string(),
                    message_id: None,
                    reason: Some(reason.to_string()),
                    delivered_to: 0,
                },
            );
        }

        metrics::counter!("enclave_messages_routed_total", "outcome" => "rejected").increment(1);
        self.events.emit(HubEvent::MessageRejected {
            sender_token_id: sender_token_id.clone(),
            recipient: recipient.to_string(),
            reason: reason.to_string(),
            rejected_at: now,
        });
        warn!(sender = %sender_token_id, recipient, reason, "Message rejected");

        RouteOutcome::Rejected {
            reason: reason.to_string(),
        }
    }

    fn push_audit(&self, state: &mut RouterState, entry: AuditEntry) {
        while state.audit.len() >= self.audit_capacity {
            state.audit.pop_front();
        }
        state.audit.push_back(entry);
    }

    /// Removes and returns every pending message for `token_id`.
    ///
    /// The token is re-validated first; if it is no longer valid its queue is
    /// discarded and the validation error returned. The hub queue is only
    /// reachable through [`drain_hub`](Self::drain_hub) and is left untouched.
    pub fn drain(&self, token_id: &TokenId) -> Result<Vec<Message>, HubError> {
        if *token_id == hub_queue_id() {
            warn!("Refusing to drain the hub queue through a token");
            return Err(HubError::TokenInvalid(token_id.clone()));
        }
        if let Err(e) = self.registry.validate_token(token_id) {
            if let Some(dropped) = self.state.lock().pending.remove(token_id) {
                debug!(token_id = %token_id, dropped = dropped.len(), "Discarded queue of invalid token");
            }
            return Err(e);
        }

        Ok(self
            .state
            .lock()
            .pending
            .remove(token_id)
            .map(Vec::from)
            .unwrap_or_default())
    }

    pub fn drain_hub(&self) -> Vec<Message> {
        self.state
            .lock()
            .pending
            .remove(&hub_queue_id())
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Drops queues whose token is no longer valid. Returns the number dropped.
    pub fn prune_queues(&self) -> usize {
        let valid: HashSet<TokenId> = self
            .registry
            .list_tokens()
            .into_iter()
            .map(|t| t.token_id)
            .collect();
        let hub = hub_queue_id();
        let mut state = self.state.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|id, _| *id == hub || valid.contains(id));
        before - state.pending.len()
    }

    /// Oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.lock().audit.iter().cloned().collect()
    }

    pub fn pending_counts(&self) -> BTreeMap<TokenId, usize> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(id, queue)| (id.clone(), queue.len()))
            .collect()
    }

    pub fn snapshot_pending(&self) -> Vec<(TokenId, Vec<Message>)> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|(id, queue)| (id.clone(), queue.iter().cloned().collect()))
            .collect()
    }

    /// Restores queues belonging to `valid_tokens` and the hub queue.
    /// Returns the number of messages restored.
    pub fn restore_pending(
        &self,
        pending: Vec<(TokenId, Vec<Message>)>,
        valid_tokens: &HashSet<TokenId>,
    ) -> usize {
        let hub = hub_queue_id();
        let mut state = self.state.lock();
        let mut restored = 0;
        for (id, messages) in pending {
            if id != hub && !valid_tokens.contains(&id) {
                continue;
            }
            restored += messages.len();
            state.pending.entry(id).or_default().extend(messages);
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::registry::RegistryConfig;
    use crate::domain::agent::AgentDefinition;
    use crate::domain::clock::ManualClock;
    use crate::domain::collaborators::NullEventSink;
    use crate::domain::task::TaskId;
    use std::time::Duration;

    fn setup(capacity: usize) -> (Arc<AgentRegistry>, MessageRouter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(AgentRegistry::new(RegistryConfig::default(), clock.clone()));
        registry
            .load_agents(vec![
                AgentDefinition::new("developer", "alpine"),
                AgentDefinition::new("reviewer", "alpine"),
            ])
            .unwrap();
        let router = MessageRouter::new(
            registry.clone(),
            Arc::new(NullEventSink),
            clock.clone(),
            capacity,
        );
        (registry, router, clock)
    }

    #[test]
    fn test_unknown_recipient_is_rejected_and_audited() {
        let (registry, router, _) = setup(100);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();

        let outcome = router.route(&sender.token_id, "unknown-agent", "ping", serde_json::json!({}));
        assert_eq!(outcome.rejection_reason(), Some("unknown recipient"));

        let log = router.audit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, AuditOutcome::Rejected);
        assert_eq!(log[0].reason.as_deref(), Some("unknown recipient"));
    }

    #[test]
    fn test_invalid_and_expired_senders_are_rejected() {
        let (registry, router, clock) = setup(100);
        let outcome = router.route(&TokenId::from("tok_forged"), "reviewer", "ping", serde_json::json!({}));
        assert_eq!(outcome.rejection_reason(), Some("invalid token"));

        let sender = registry
            .issue_token("developer", TaskId::new(), Some(Duration::from_secs(5)))
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));
        let outcome = router.route(&sender.token_id, "reviewer", "ping", serde_json::json!({}));
        assert_eq!(outcome.rejection_reason(), Some("token expired"));
        assert_eq!(router.audit_log().len(), 2);
    }

    #[test]
    fn test_empty_type_is_rejected() {
        let (registry, router, _) = setup(100);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();
        let outcome = router.route(&sender.token_id, "reviewer", " ", serde_json::json!({}));
        assert_eq!(outcome.rejection_reason(), Some("payload is missing a type field"));
    }

    #[test]
    fn test_delivery_fans_out_to_every_recipient_token() {
        let (registry, router, _) = setup(100);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();
        let first = registry.issue_token("reviewer", TaskId::new(), None).unwrap();
        let second = registry.issue_token("reviewer", TaskId::new(), None).unwrap();

        let outcome = router.route(
            &sender.token_id,
            "reviewer",
            "review.request",
            serde_json::json!({"pr": 42}),
        );
        assert!(matches!(outcome, RouteOutcome::Delivered { delivered_to: 2, .. }));

        let drained = router.drain(&first.token_id).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message_type, "review.request");
        assert_eq!(drained[0].payload["pr"], 42);
        assert!(router.drain(&first.token_id).unwrap().is_empty());
        assert_eq!(router.drain(&second.token_id).unwrap().len(), 1);
    }

    #[test]
    fn test_hub_queue() {
        let (registry, router, _) = setup(100);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();
        let outcome = router.route(&sender.token_id, "hub", "status", serde_json::json!({"ok": true}));
        assert!(outcome.is_delivered());
        assert_eq!(router.drain_hub().len(), 1);
        assert!(router.drain_hub().is_empty());
    }

    #[test]
    fn test_drain_of_expired_token_discards_queue() {
        let (registry, router, clock) = setup(100);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();
        let recipient = registry
            .issue_token("reviewer", TaskId::new(), Some(Duration::from_secs(10)))
            .unwrap();
        router.route(&sender.token_id, "reviewer", "ping", serde_json::json!({}));
        clock.advance(chrono::Duration::seconds(10));

        let err = router.drain(&recipient.token_id).unwrap_err();
        assert!(matches!(err, HubError::TokenExpired(_)));
        assert!(router.pending_counts().is_empty());
    }

    #[test]
    fn test_audit_ring_buffer_evicts_oldest() {
        let (registry, router, _) = setup(3);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();
        for recipient in ["a", "b", "c", "d", "e"] {
            router.route(&sender.token_id, recipient, "ping", serde_json::json!({}));
        }
        let log = router.audit_log();
        assert_eq!(log.len(), 3);
        let recipients: Vec<&str> = log.iter().map(|e| e.recipient.as_str()).collect();
        assert_eq!(recipients, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_restore_pending_keeps_valid_tokens_and_hub() {
        let (registry, router, _) = setup(100);
        let sender = registry.issue_token("developer", TaskId::new(), None).unwrap();
        let msg = Message::new(
            sender.token_id.clone(),
            "reviewer",
            "ping",
            serde_json::json!({}),
            chrono::Utc::now(),
        );
        let valid: HashSet<TokenId> = [TokenId::from("tok_live")].into_iter().collect();
        let restored = router.restore_pending(
            vec![
                (TokenId::from("tok_live"), vec![msg.clone()]),
                (TokenId::from("tok_gone"), vec![msg.clone()]),
                (hub_queue_id(), vec![msg]),
            ],
            &valid,
        );
        assert_eq!(restored, 2);
        assert_eq!(router.pending_counts().len(), 2);
    }
}
