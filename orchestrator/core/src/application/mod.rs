// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod health_monitor;
pub mod hub;
pub mod lifecycle;
pub mod message_router;
pub mod persistence;
pub mod registry;
pub mod task_router;
pub mod volumes;

pub use hub::{Hub, HubDependencies, HubState};
pub use lifecycle::{RecycleRequest, SessionRequest};
