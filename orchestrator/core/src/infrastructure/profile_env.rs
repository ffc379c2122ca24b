// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Profile environments read from `<profiles_dir>/<profile>.env`.
//!
//! Files are parsed with `dotenvy` on first use and cached for the life of
//! the hub. A missing or unreadable file yields an empty map.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain::collaborators::ProfileEnvironmentSource;

pub struct DotenvProfileSource {
    dir: PathBuf,
    cache: DashMap<String, BTreeMap<String, String>>,
}

fn is_safe_profile_name(profile: &str) -> bool {
    !profile.is_empty()
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

fn parse_env_file(path: &Path) -> BTreeMap<String, String> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => {
            debug!("No profile environment at {}", path.display());
            return BTreeMap::new();
        }
        Err(e) => {
            warn!("Failed to open profile environment {}: {}", path.display(), e);
            return BTreeMap::new();
        }
    };

    let mut vars = BTreeMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                vars.insert(key, value);
            }
            Err(e) => warn!("Skipping malformed line in {}: {}", path.display(), e),
        }
    }
    vars
}

impl DotenvProfileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Drops cached profiles so the next read goes back to disk.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

#[async_trait]
impl ProfileEnvironmentSource for DotenvProfileSource {
    async fn read(&self, profile: &str) -> BTreeMap<String, String> {
        if !is_safe_profile_name(profile) {
            warn!(profile, "Ignoring profile with unsafe name");
            return BTreeMap::new();
        }
        if let Some(cached) = self.cache.get(profile) {
            return cached.clone();
        }

        let vars = parse_env_file(&self.dir.join(format!("{}.env", profile)));
        self.cache.insert(profile.to_string(), vars.clone());
        vars
    }
}
