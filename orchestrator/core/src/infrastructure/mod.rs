// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Concrete adapters behind the domain traits, plus [`build_dependencies`]
//! which assembles the default set from a hub manifest.

pub mod docker;
pub mod event_bus;
pub mod image_verifier;
pub mod profile_env;
pub mod secret_files;
pub mod secrets;
pub mod state_store;
pub mod vm;

use std::sync::Arc;
use tracing::warn;

use crate::application::HubDependencies;
use crate::domain::clock::SystemClock;
use crate::domain::config::HubConfigManifest;
use crate::domain::runtime::SessionBackend;

pub use docker::DockerBackend;
pub use event_bus::EventBus;
pub use image_verifier::DigestImageVerifier;
pub use profile_env::DotenvProfileSource;
pub use secrets::EnvSecretsProvider;
pub use state_store::{FileStateStore, InMemoryStateStore};
pub use vm::LimaBackend;

/// Builds the production collaborators for `config`, publishing events on `events`.
///
/// A Docker daemon that cannot be reached is logged and its backend left
/// out; sessions requesting it then fail with a backend-unavailable error.
pub fn build_dependencies(config: &HubConfigManifest, events: EventBus) -> HubDependencies {
    let spec = &config.spec;
    let data_root = spec.sessions.data_root.clone();

    let mut backends: Vec<Arc<dyn SessionBackend>> = Vec::new();
    match DockerBackend::new(spec.backends.docker.clone(), data_root.clone()) {
        Ok(docker) => backends.push(Arc::new(docker)),
        Err(e) => warn!("Docker backend disabled: {}", e),
    }
    backends.push(Arc::new(LimaBackend::new(spec.backends.vm.clone(), data_root)));

    HubDependencies {
        backends,
        secrets: Arc::new(EnvSecretsProvider::new(spec.secrets.clone())),
        image_verifier: Arc::new(DigestImageVerifier::new(
            spec.image_verification.pinned_digests.clone(),
        )),
        profiles: Arc::new(DotenvProfileSource::new(spec.sessions.profiles_dir.clone())),
        events: Arc::new(events),
        store: Arc::new(FileStateStore::new(spec.hub.state_path.clone())),
        clock: Arc::new(SystemClock),
    }
}
