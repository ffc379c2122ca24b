// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::message::MessageId;
use crate::domain::session::{BackendKind, SessionState};
use crate::domain::task::{TaskId, TaskStatus};
use crate::domain::token::TokenId;

/// Observable hub activity, published on the event bus for CLI and log consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    TaskSubmitted {
        task_id: TaskId,
        agent_name: String,
        submitted_at: DateTime<Utc>,
    },
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        changed_at: DateTime<Utc>,
    },
    SessionStateChanged {
        session_name: String,
        backend_kind: BackendKind,
        from: SessionState,
        to: SessionState,
        changed_at: DateTime<Utc>,
    },
    SessionUnhealthy {
        session_name: String,
        consecutive_failures: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        observed_at: DateTime<Utc>,
    },
    MessageRouted {
        message_id: MessageId,
        sender_token_id: TokenId,
        recipient: String,
        delivered_to: usize,
        routed_at: DateTime<Utc>,
    },
    MessageRejected {
        sender_token_id: TokenId,
        recipient: String,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
    StateFlushed {
        tokens: usize,
        tasks: usize,
        pending_messages: usize,
        flushed_at: DateTime<Utc>,
    },
}

impl HubEvent {
    /// Short name used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskSubmitted { .. } => "task_submitted",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::SessionUnhealthy { .. } => "session_unhealthy",
            Self::MessageRouted { .. } => "message_routed",
            Self::MessageRejected { .. } => "message_rejected",
            Self::StateFlushed { .. } => "state_flushed",
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskSubmitted { task_id, .. } | Self::TaskStatusChanged { task_id, .. } => {
                Some(*task_id)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = HubEvent::TaskStatusChanged {
            task_id: TaskId::new(),
            from: TaskStatus::Pending,
            to: TaskStatus::Running,
            reason: None,
            changed_at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "task_status_changed");
        assert_eq!(value["to"], "RUNNING");
        assert!(value.get("reason").is_none());
        assert_eq!(event.kind(), "task_status_changed");
    }
}
