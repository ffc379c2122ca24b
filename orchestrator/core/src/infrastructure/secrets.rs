// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Environment-backed secrets provider.
//!
//! The manifest maps logical secret names to references of the form
//! `env:VARIABLE`. Resolution reads the variable from the hub process
//! environment at configure time, so rotated values are picked up by the
//! next session without a restart.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::domain::collaborators::{SecretsContext, SecretsProvider};
use crate::domain::error::HubError;

pub const ENV_REFERENCE_PREFIX: &str = "env:";

pub struct EnvSecretsProvider {
    references: BTreeMap<String, String>,
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvSecretsProvider {
    pub fn new(references: BTreeMap<String, String>) -> Self {
        Self::with_lookup(references, |var| std::env::var(var).ok())
    }

    /// Uses `lookup` instead of the process environment.
    pub fn with_lookup(
        references: BTreeMap<String, String>,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            references,
            lookup: Box::new(lookup),
        }
    }

    fn resolve_one(&self, name: &str) -> Result<Option<String>, HubError> {
        let reference = self
            .references
            .get(name)
            .ok_or_else(|| HubError::SecretsUnavailable(format!("no secret named '{}'", name)))?;
        let var = reference.strip_prefix(ENV_REFERENCE_PREFIX).ok_or_else(|| {
            HubError::SecretsUnavailable(format!(
                "secret '{}' has unsupported reference '{}'",
                name, reference
            ))
        })?;
        Ok((self.lookup)(var))
    }
}

#[async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn resolve(&self, context: &SecretsContext) -> Result<BTreeMap<String, String>, HubError> {
        let mut resolved = BTreeMap::new();

        if context.requested.is_empty() {
            for name in self.references.keys() {
                match self.resolve_one(name)? {
                    Some(value) => {
                        resolved.insert(name.clone(), value);
                    }
                    None => warn!(
                        session = %context.session_name,
                        secret = %name,
                        "Configured secret is not set in the environment, skipping"
                    ),
                }
            }
        } else {
            for name in &context.requested {
                let value = self.resolve_one(name)?.ok_or_else(|| {
                    HubError::SecretsUnavailable(format!(
                        "secret '{}' is not set in the environment",
                        name
                    ))
                })?;
                resolved.insert(name.clone(), value);
            }
        }

        debug!(session = %context.session_name, count = resolved.len(), "Resolved secrets");
        Ok(resolved)
    }
}
