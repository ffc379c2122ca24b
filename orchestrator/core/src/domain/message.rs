// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Inter-agent messages, audit records and routing outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::token::TokenId;

/// Literal recipient name addressing the hub itself.
pub const HUB_RECIPIENT: &str = "hub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable once created by the message router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub sender_token_id: TokenId,
    pub recipient: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(
        sender_token_id: TokenId,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            timestamp,
            sender_token_id,
            recipient: recipient.into(),
            message_type: message_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Delivered,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub sender_token_id: TokenId,
    pub recipient: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of recipient queues the message was placed on.
    #[serde(default)]
    pub delivered_to: usize,
}

/// Structured result of `route`. Rejections are expected outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RouteOutcome {
    Delivered {
        message_id: MessageId,
        delivered_to: usize,
    },
    Rejected {
        reason: String,
    },
}

impl RouteOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } => Some(reason),
            Self::Delivered { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serializes_type_field() {
        let msg = Message::new(
            TokenId::from("tok_a"),
            "reviewer",
            "ping",
            serde_json::json!({}),
            Utc::now(),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ping");
        assert_eq!(value["sender_token_id"], "tok_a");
    }

    #[test]
    fn test_route_outcome_shape() {
        let outcome = RouteOutcome::Rejected {
            reason: "unknown recipient".to_string(),
        };
        assert_eq!(outcome.rejection_reason(), Some("unknown recipient"));
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "rejected");
    }
}
