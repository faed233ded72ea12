//! SSH key material and borg environment.
//!
//! The runner is the only ssh client in its pod: the key from the mounted
//! secret is written 0600 and BORG_RSH pins ssh to exactly that identity
//! with host checking disabled (runner pods are ephemeral and have no
//! known_hosts to persist).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use borgkube_common::runner_config::RunnerConfig;
use borgkube_common::{Error, Result};

/// Where the private key is written inside the runner pod.
pub const SSH_KEY_PATH: &str = "/root/.ssh/borg-ssh.key";

/// Write the key with a 0700 parent directory and 0600 mode.
pub fn write_ssh_key(contents: &str, path: &Path) -> Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::config(format!("ssh key path {} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::execution("ssh", format!("create {}: {e}", dir.display())))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::execution("ssh", format!("chmod {}: {e}", dir.display())))?;

    std::fs::write(path, contents)
        .map_err(|e| Error::execution("ssh", format!("write {}: {e}", path.display())))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::execution("ssh", format!("chmod {}: {e}", path.display())))?;
    Ok(path.to_path_buf())
}

/// The BORG_RSH value: only this key, no agent identities, no host check.
pub fn borg_rsh(key_path: &Path) -> String {
    format!(
        "ssh -o IdentityFile={} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no",
        key_path.display()
    )
}

/// Environment for every borg invocation.
pub fn borg_env(cfg: &RunnerConfig, key_path: &Path, cache_dir: &Path) -> Vec<(String, String)> {
    vec![
        ("BORG_REPO".to_string(), cfg.repo.clone()),
        ("BORG_PASSPHRASE".to_string(), cfg.passphrase.clone()),
        ("BORG_RSH".to_string(), borg_rsh(key_path)),
        (
            "BORG_CACHE_DIR".to_string(),
            cache_dir.display().to_string(),
        ),
    ]
}
