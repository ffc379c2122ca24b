// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Owner-only secret files
//!
//! Every secret is written to a temporary file opened with mode `0600`,
//! synced, then renamed over its final name. The final path is therefore
//! never observable with wider permissions or partial contents. Directories
//! are created with mode `0700`.
//!
//! Layout under a session data directory:
//!
//! ```text
//! <data_root>/<session>/secrets/<NAME>
//! <data_root>/<session>/secrets/identity.json
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::domain::runtime::SessionIdentity;

pub const SECRETS_DIR: &str = "secrets";
pub const IDENTITY_FILE: &str = "identity.json";

/// Rejects names that could escape the secrets directory.
fn check_secret_name(name: &str) -> io::Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid secret name '{}'", name),
        ))
    }
}

/// Creates `path` and its parents, restricted to the owner.
#[cfg(unix)]
pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    // An existing directory keeps its old mode otherwise.
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    fs::File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Atomically replaces `path` with `contents`, readable by the owner only.
pub fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    let result = (|| {
        let mut file = open_private(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(dir)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Writes one file per secret plus the identity document.
///
/// Returns the secrets directory.
pub fn write_session_secrets(
    session_dir: &Path,
    secrets: &BTreeMap<String, String>,
    identity: &SessionIdentity,
) -> io::Result<PathBuf> {
    for name in secrets.keys() {
        check_secret_name(name)?;
    }

    ensure_private_dir(session_dir)?;
    let secrets_dir = session_dir.join(SECRETS_DIR);
    ensure_private_dir(&secrets_dir)?;

    for (name, value) in secrets {
        write_private_file(&secrets_dir.join(name), value.as_bytes())?;
    }

    let identity_json = serde_json::to_vec_pretty(identity)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_private_file(&secrets_dir.join(IDENTITY_FILE), &identity_json)?;

    Ok(secrets_dir)
}

/// Removes a session data directory. A missing directory is not an error.
pub fn remove_session_dir(session_dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(session_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            session_name: "dev-1".to_string(),
            role: "developer".to_string(),
            token_id: None,
            task_id: None,
        }
    }

    #[test]
    fn test_writes_secrets_and_identity() {
        let root = TempDir::new().unwrap();
        let session_dir = root.path().join("dev-1");
        let mut secrets = BTreeMap::new();
        secrets.insert("GITHUB_TOKEN".to_string(), "ghp_abc".to_string());

        let dir = write_session_secrets(&session_dir, &secrets, &identity()).unwrap();

        assert_eq!(fs::read_to_string(dir.join("GITHUB_TOKEN")).unwrap(), "ghp_abc");
        let parsed: SessionIdentity =
            serde_json::from_slice(&fs::read(dir.join(IDENTITY_FILE)).unwrap()).unwrap();
        assert_eq!(parsed, identity());

        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let session_dir = root.path().join("dev-1");
        let mut secrets = BTreeMap::new();
        secrets.insert("API_KEY".to_string(), "k".to_string());

        let dir = write_session_secrets(&session_dir, &secrets, &identity()).unwrap();

        let file_mode = fs::metadata(dir.join("API_KEY")).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_overwrite_replaces_contents() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("token");
        write_private_file(&path, b"first").unwrap();
        write_private_file(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_rejects_traversal_names() {
        let root = TempDir::new().unwrap();
        let mut secrets = BTreeMap::new();
        secrets.insert("../escape".to_string(), "x".to_string());

        let err = write_session_secrets(&root.path().join("s"), &secrets, &identity()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!root.path().join("escape").exists());
    }

    #[test]
    fn test_remove_missing_dir_is_ok() {
        let root = TempDir::new().unwrap();
        remove_session_dir(&root.path().join("never-created")).unwrap();
    }
}
