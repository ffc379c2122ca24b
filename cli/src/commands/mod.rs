// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Enclave CLI

pub mod config;
pub mod run;
pub mod state;

pub use self::config::ConfigCommand;
pub use self::state::StateCommand;
