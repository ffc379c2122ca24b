// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use chrono::{Duration, Utc};
use enclave_core::application::persistence::{HubSnapshot, MessagesSnapshot, RegistrySnapshot};
use enclave_core::application::task_router::SESSION_LOST_ERROR;
use enclave_core::domain::collaborators::PersistenceStore;
use enclave_core::domain::message::Message;
use enclave_core::domain::task::{TaskId, TaskStatus};
use enclave_core::domain::token::Token;
use enclave_core::infrastructure::InMemoryStateStore;
use std::sync::Arc;

#[tokio::test]
async fn test_state_survives_restart() {
    let store = Arc::new(InMemoryStateStore::new());
    let first = common::hub_with(common::config(), store.clone()).await;

    let reviewer = first.hub.submit_task("review PR", "reviewer").await.unwrap();
    let developer = first.hub.submit_task("fix the build", "developer").await.unwrap();
    let finished = first.hub.submit_task("lint", "reviewer").await.unwrap();
    first
        .hub
        .complete_task(&finished.id, serde_json::json!("ok"))
        .await
        .unwrap();

    let sender = reviewer.token_id.clone().unwrap();
    let outcome = first
        .hub
        .route(&sender, "developer", "review", serde_json::json!({"line": 7}));
    assert!(outcome.is_delivered());

    let snapshot = first.hub.flush().await.unwrap();
    assert_eq!(snapshot.registry.tokens.len(), 2);
    assert_eq!(snapshot.router.tasks.len(), 3);
    assert_eq!(snapshot.messages.log.len(), 1);

    let second = common::hub_with(common::config(), store.clone()).await;

    assert_eq!(second.hub.list_tokens().len(), 2);
    let tasks = second.hub.list_tasks(None);
    assert_eq!(tasks.len(), 2);
    assert!(second.hub.get_task(&finished.id).is_err());
    assert!(second.hub.get_hub_state().audit_log.is_empty());

    let developer_token = developer.token_id.clone().unwrap();
    let pending = second.hub.drain(&developer_token).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_type, "review");
    assert_eq!(pending[0].payload["line"], 7);

    // Sessions do not survive a restart; the reconciler notices.
    let failed = second.hub.check_running_tasks().await;
    assert_eq!(failed.len(), 2);
    let task = second.hub.get_task(&developer.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(SESSION_LOST_ERROR));
    assert!(second.hub.list_tokens().is_empty());
}

#[tokio::test]
async fn test_expired_tokens_and_their_queues_are_dropped_on_restore() {
    let now = Utc::now();
    let expired = Token::new(
        "developer",
        TaskId::new(),
        Default::default(),
        now - Duration::hours(2),
        Duration::hours(1),
    );
    let live = Token::new(
        "reviewer",
        TaskId::new(),
        Default::default(),
        now,
        Duration::hours(1),
    );
    let note = |to: &str| {
        Message::new(
            live.token_id.clone(),
            to,
            "note",
            serde_json::json!({}),
            now,
        )
    };

    let snapshot = HubSnapshot {
        flushed_at: now.timestamp_millis(),
        registry: RegistrySnapshot {
            tokens: vec![
                (expired.token_id.clone(), expired.clone()),
                (live.token_id.clone(), live.clone()),
            ],
        },
        messages: MessagesSnapshot {
            pending: vec![
                (expired.token_id.clone(), vec![note("developer")]),
                (live.token_id.clone(), vec![note("reviewer")]),
            ],
            log: vec![],
        },
        ..Default::default()
    };

    let store = Arc::new(InMemoryStateStore::new());
    store
        .write(&serde_json::to_vec(&snapshot).unwrap())
        .await
        .unwrap();

    let t = common::hub_with(common::config(), store).await;

    let tokens = t.hub.list_tokens();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].token_id, live.token_id);
    assert_eq!(t.hub.drain(&live.token_id).unwrap().len(), 1);
    assert!(t.hub.get_hub_state().pending_messages.is_empty());
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let store = Arc::new(InMemoryStateStore::new());
    store.write(b"{not json").await.unwrap();

    let t = common::hub_with(common::config(), store).await;

    assert!(t.hub.list_tokens().is_empty());
    assert!(t.hub.list_tasks(None).is_empty());
}

#[tokio::test]
async fn test_shutdown_flushes_and_recycles() {
    let store = Arc::new(InMemoryStateStore::new());
    let t = common::hub_with(common::config(), store.clone()).await;
    t.hub.start();

    let task = t.hub.submit_task("fix the build", "developer").await.unwrap();
    assert_eq!(t.backend.instance_count(), 1);

    t.hub.shutdown().await.unwrap();

    assert_eq!(t.backend.instance_count(), 0);
    let bytes = store.contents().unwrap();
    let snapshot: HubSnapshot = serde_json::from_slice(&bytes).unwrap();
    assert!(snapshot
        .router
        .tasks
        .iter()
        .any(|(id, _)| *id == task.id));
}
