//! Resource and archive naming.
//!
//! All timestamps embedded in names are UTC, zero-padded and
//! hyphen-separated (`YYYY-MM-DD-HH-MM-SS`). The archive timestamp format is
//! byte-exact: the repository retention glob depends on it.

use chrono::{DateTime, Utc};

/// Maximum length of a Kubernetes label value.
pub const MAX_LABEL_LEN: usize = 63;

/// Format a timestamp the way every name in this system embeds it.
pub fn utc_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d-%H-%M-%S").to_string()
}

/// VolumeSnapshot name: `{pvc}-{ts}`.
pub fn snapshot_name(pvc: &str, t: DateTime<Utc>) -> String {
    format!("{}-{}", pvc, utc_timestamp(t))
}

/// Clone PVC name: `{releaseName}-clone-{backupName}-{epochMs}`.
pub fn clone_pvc_name(release_name: &str, backup_name: &str, t: DateTime<Utc>) -> String {
    format!("{}-clone-{}-{}", release_name, backup_name, t.timestamp_millis())
}

/// Runner pod name: `{releaseName}-backup-runner-{backupName}-{ts}`.
pub fn runner_pod_name(release_name: &str, backup_name: &str, t: DateTime<Utc>) -> String {
    format!(
        "{}-backup-runner-{}-{}",
        release_name,
        backup_name,
        utc_timestamp(t)
    )
}

/// Config secret name for a runner pod: same stem plus `-config`.
pub fn config_secret_name(pod_name: &str) -> String {
    format!("{pod_name}-config")
}

/// Archive name: `{prefix}-{ts}`.
pub fn archive_name(prefix: &str, t: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, utc_timestamp(t))
}

/// Clamp a string to a legal label value length. Kubernetes rejects label
/// values over 63 characters with a 422.
pub fn label_value(s: &str) -> String {
    if s.len() <= MAX_LABEL_LEN {
        s.to_string()
    } else {
        s[..MAX_LABEL_LEN].trim_end_matches('-').to_string()
    }
}
