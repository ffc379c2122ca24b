// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Volume map resolution for a session.
//!
//! Three sources are merged in order: the fixed session-data bind mount,
//! caller-supplied mounts, then mounts derived from the role's profile
//! environment. The map is keyed by mount target and the first source to
//! claim a target keeps it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::collaborators::ProfileEnvironmentSource;
use crate::domain::config::ProfileMountConfig;
use crate::domain::runtime::VolumeMount;

/// Mount point of the per-session data directory.
pub const SESSION_DATA_TARGET: &str = "/session";

pub struct VolumeResolver {
    data_root: PathBuf,
    workspace_root: PathBuf,
    mounts: Vec<ProfileMountConfig>,
    profiles: Arc<dyn ProfileEnvironmentSource>,
}

impl VolumeResolver {
    pub fn new(
        data_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        mounts: Vec<ProfileMountConfig>,
        profiles: Arc<dyn ProfileEnvironmentSource>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            workspace_root: workspace_root.into(),
            mounts,
            profiles,
        }
    }

    pub fn session_data_dir(&self, session_name: &str) -> PathBuf {
        self.data_root.join(session_name)
    }

    pub async fn resolve(
        &self,
        session_name: &str,
        profile: &str,
        explicit: &[VolumeMount],
    ) -> Vec<VolumeMount> {
        let mut merged: BTreeMap<String, VolumeMount> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();

        let mut claim = |mount: VolumeMount, source: &str| {
            if merged.contains_key(&mount.target) {
                debug!(
                    target_path = %mount.target,
                    source,
                    "Mount target already claimed, skipping"
                );
                return;
            }
            order.push(mount.target.clone());
            merged.insert(mount.target.clone(), mount);
        };

        claim(
            VolumeMount::new(self.session_data_dir(session_name), SESSION_DATA_TARGET, false),
            "session",
        );

        for mount in explicit {
            claim(mount.clone(), "explicit");
        }

        if !self.mounts.is_empty() {
            let env = self.profiles.read(profile).await;
            for config in &self.mounts {
                if let Some(mount) = self.profile_mount(config, &env) {
                    claim(mount, "profile");
                }
            }
        }

        order
            .into_iter()
            .filter_map(|target| merged.remove(&target))
            .collect()
    }

    fn profile_mount(
        &self,
        config: &ProfileMountConfig,
        env: &BTreeMap<String, String>,
    ) -> Option<VolumeMount> {
        if !config.enabled {
            return None;
        }

        let host_path = match env.get(&config.variable).filter(|v| !v.trim().is_empty()) {
            Some(value) => PathBuf::from(value.trim()),
            None => self.workspace_root.join(config.default.as_deref()?),
        };

        if !host_path.exists() {
            warn!(
                mount = %config.name,
                path = %host_path.display(),
                "Profile mount path does not exist, skipping"
            );
            return None;
        }

        Some(VolumeMount::new(
            absolute(&host_path),
            config.target.clone(),
            config.read_only,
        ))
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
