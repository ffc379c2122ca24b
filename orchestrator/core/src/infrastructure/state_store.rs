// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Snapshot stores for [`StatePersistence`](crate::application::persistence::StatePersistence).
//!
//! [`FileStateStore`] keeps one JSON document on disk and replaces it with
//! write-to-temp, fsync, rename. The snapshot holds live tokens, so it is
//! written owner-only like the session secrets.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::collaborators::PersistenceStore;
use crate::domain::error::HubError;
use crate::infrastructure::secret_files;

pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_blocking(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            secret_files::ensure_private_dir(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        secret_files::write_private_file(path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for FileStateStore {
    async fn read(&self) -> Result<Option<Vec<u8>>, HubError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HubError::Persistence(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), HubError> {
        let path = self.path.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || Self::write_blocking(&path, &bytes))
            .await
            .map_err(|e| HubError::Persistence(e.to_string()))?
            .map_err(|e| HubError::Persistence(format!("{:#}", e)))
    }
}

/// Keeps the snapshot in memory. Used by tests and ephemeral hubs.
#[derive(Default)]
pub struct InMemoryStateStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.bytes.lock().clone()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStateStore {
    async fn read(&self) -> Result<Option<Vec<u8>>, HubError> {
        Ok(self.bytes.lock().clone())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), HubError> {
        *self.bytes.lock() = Some(bytes.to_vec());
        Ok(())
    }
}
