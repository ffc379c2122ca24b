// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Enclave Core
//!
//! Orchestration hub for isolated agent sessions: agent and token registry,
//! capability policy, container and VM session backends, the session
//! lifecycle pipeline, health monitoring, task and message routing, and
//! snapshot persistence.
//!
//! # Architecture
//!
//! - `domain` holds value types, state machines, errors and the traits the
//!   hub consumes.
//! - `application` holds the components and the [`application::Hub`]
//!   composition root.
//! - `infrastructure` holds the Docker, Lima, filesystem and environment
//!   adapters.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{Hub, HubDependencies, HubState, RecycleRequest, SessionRequest};
pub use domain::config::HubConfigManifest;
pub use domain::error::HubError;
