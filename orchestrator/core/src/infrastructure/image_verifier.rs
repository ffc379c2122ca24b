// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Digest-pinning image verifier.
//!
//! An image passes when its reference is pinned by `@sha256:<64 hex>` and,
//! if an allowlist of digests is configured, that digest is on it. Tags are
//! mutable and never pass.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::domain::collaborators::{ImageVerificationMode, ImageVerifier, VerificationResult};

const DIGEST_MARKER: &str = "@sha256:";

#[derive(Debug, Clone, Default)]
pub struct DigestImageVerifier {
    pinned: HashSet<String>,
}

/// Accepts `sha256:<hex>` or bare `<hex>`; returns lowercase hex.
fn normalize_digest(digest: &str) -> String {
    digest
        .trim()
        .trim_start_matches("sha256:")
        .to_ascii_lowercase()
}

impl DigestImageVerifier {
    pub fn new(pinned_digests: impl IntoIterator<Item = String>) -> Self {
        Self {
            pinned: pinned_digests
                .into_iter()
                .map(|d| normalize_digest(&d))
                .collect(),
        }
    }

    pub fn check(&self, image: &str) -> VerificationResult {
        let Some((_, digest)) = image.split_once(DIGEST_MARKER) else {
            return VerificationResult::rejected("image is not pinned by sha256 digest");
        };

        let digest = digest.to_ascii_lowercase();
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return VerificationResult::rejected("malformed sha256 digest");
        }

        if !self.pinned.is_empty() && !self.pinned.contains(&digest) {
            return VerificationResult::rejected("digest is not in the pinned allowlist");
        }

        VerificationResult::verified()
    }
}

#[async_trait]
impl ImageVerifier for DigestImageVerifier {
    async fn verify(&self, image: &str, mode: ImageVerificationMode) -> VerificationResult {
        match mode {
            ImageVerificationMode::Off => VerificationResult::verified(),
            ImageVerificationMode::Enforce | ImageVerificationMode::Warn => self.check(image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_tag_is_rejected() {
        let verifier = DigestImageVerifier::default();
        assert!(!verifier.check("ghcr.io/acme/agent:latest").verified);
    }

    #[test]
    fn test_pinned_digest_passes_without_allowlist() {
        let verifier = DigestImageVerifier::default();
        let image = format!("ghcr.io/acme/agent@sha256:{}", DIGEST);
        assert!(verifier.check(&image).verified);
    }

    #[test]
    fn test_malformed_digest() {
        let verifier = DigestImageVerifier::default();
        let result = verifier.check("ghcr.io/acme/agent@sha256:xyz");
        assert_eq!(result.reason.as_deref(), Some("malformed sha256 digest"));
    }

    #[test]
    fn test_allowlist() {
        let verifier = DigestImageVerifier::new(vec![format!("sha256:{}", DIGEST.to_uppercase())]);
        let allowed = format!("agent@sha256:{}", DIGEST);
        let other = format!("agent@sha256:{}", "f".repeat(64));

        assert!(verifier.check(&allowed).verified);
        assert!(!verifier.check(&other).verified);
    }

    #[test]
    fn test_off_mode_skips_checks() {
        let verifier = DigestImageVerifier::default();
        let result =
            tokio_test::block_on(verifier.verify("agent:latest", ImageVerificationMode::Off));
        assert!(result.verified);
    }
}
