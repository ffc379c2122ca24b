// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! State Persistence - periodic snapshots of registry, task and message state
//!
//! The snapshot is one JSON document:
//!
//! ```json
//! {
//!   "flushed_at": 1760000000000,
//!   "registry": { "tokens": [["tok_…", { … }]] },
//!   "router":   { "tasks":  [["<uuid>", { … }]] },
//!   "messages": { "pending": [["tok_…", [ … ]]], "log": [ … ] }
//! }
//! ```
//!
//! `restore` keeps only unexpired tokens, non-terminal tasks and pending
//! queues of surviving tokens. The audit log is never restored. A missing
//! or unreadable snapshot means starting empty.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::message_router::MessageRouter;
use crate::application::registry::AgentRegistry;
use crate::application::task_router::TaskRouter;
use crate::domain::clock::Clock;
use crate::domain::collaborators::{EventSink, PersistenceStore};
use crate::domain::error::HubError;
use crate::domain::events::HubEvent;
use crate::domain::message::{AuditEntry, Message};
use crate::domain::task::{Task, TaskId};
use crate::domain::token::{Token, TokenId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubSnapshot {
    /// Epoch milliseconds.
    pub flushed_at: i64,
    #[serde(default)]
    pub registry: RegistrySnapshot,
    #[serde(default)]
    pub router: RouterSnapshot,
    #[serde(default)]
    pub messages: MessagesSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub tokens: Vec<(TokenId, Token)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    #[serde(default)]
    pub tasks: Vec<(TaskId, Task)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesSnapshot {
    #[serde(default)]
    pub pending: Vec<(TokenId, Vec<Message>)>,
    #[serde(default)]
    pub log: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub tokens: usize,
    pub tasks: usize,
    pub pending_messages: usize,
}

pub struct StatePersistence {
    store: Arc<dyn PersistenceStore>,
    registry: Arc<AgentRegistry>,
    tasks: Arc<TaskRouter>,
    messages: Arc<MessageRouter>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    flush_interval: Duration,
    shutdown_token: CancellationToken,
}

impl StatePersistence {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        registry: Arc<AgentRegistry>,
        tasks: Arc<TaskRouter>,
        messages: Arc<MessageRouter>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        flush_interval: Duration,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            tasks,
            messages,
            events,
            clock,
            flush_interval,
            shutdown_token,
        }
    }

    pub fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            flushed_at: self.clock.now().timestamp_millis(),
            registry: RegistrySnapshot {
                tokens: self.registry.snapshot_tokens(),
            },
            router: RouterSnapshot {
                tasks: self.tasks.snapshot_tasks(),
            },
            messages: MessagesSnapshot {
                pending: self.messages.snapshot_pending(),
                log: self.messages.audit_log(),
            },
        }
    }

    /// Serializes current state and replaces the stored snapshot atomically.
    pub async fn flush(&self) -> Result<HubSnapshot, HubError> {
        let pruned = self.messages.prune_queues();
        if pruned > 0 {
            debug!(pruned, "Dropped queues of invalid tokens before flush");
        }

        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| HubError::Persistence(format!("failed to serialize snapshot: {}", e)))?;
        self.store.write(&bytes).await?;

        let pending_messages = snapshot.messages.pending.iter().map(|(_, m)| m.len()).sum();
        self.events.emit(HubEvent::StateFlushed {
            tokens: snapshot.registry.tokens.len(),
            tasks: snapshot.router.tasks.len(),
            pending_messages,
            flushed_at: self.clock.now(),
        });
        debug!(
            tokens = snapshot.registry.tokens.len(),
            tasks = snapshot.router.tasks.len(),
            pending_messages,
            "State flushed"
        );
        Ok(snapshot)
    }

    /// Loads and filters the stored snapshot. Never fails: read or parse
    /// errors are logged and treated as an empty snapshot.
    pub async fn restore(&self) -> RestoreReport {
        let bytes = match self.store.read().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!("No persisted state found, starting empty");
                return RestoreReport::default();
            }
            Err(e) => {
                warn!("Failed to read persisted state, starting empty: {}", e);
                return RestoreReport::default();
            }
        };

        let snapshot: HubSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Persisted state is unreadable, starting empty: {}", e);
                return RestoreReport::default();
            }
        };

        let tokens = self.registry.restore_tokens(snapshot.registry.tokens);
        let valid: HashSet<TokenId> = self
            .registry
            .list_tokens()
            .into_iter()
            .map(|t| t.token_id)
            .collect();
        let tasks = self.tasks.restore_tasks(snapshot.router.tasks);
        let pending_messages = self
            .messages
            .restore_pending(snapshot.messages.pending, &valid);

        let report = RestoreReport {
            tokens,
            tasks,
            pending_messages,
        };
        info!(
            tokens = report.tokens,
            tasks = report.tasks,
            pending_messages = report.pending_messages,
            flushed_at = snapshot.flushed_at,
            "Persisted state restored"
        );
        report
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval = ?self.flush_interval, "Starting state flusher");
        let mut tick = interval(self.flush_interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!("Periodic flush failed: {}", e);
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping state flusher");
                    break;
                }
            }
        }
    }
}
