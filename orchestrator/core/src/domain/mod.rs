// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: value types, state machines, the error taxonomy and the
//! trait seams (session backends and external collaborators) the
//! application layer is written against.

pub mod agent;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod policy;
pub mod runtime;
pub mod session;
pub mod task;
pub mod token;
