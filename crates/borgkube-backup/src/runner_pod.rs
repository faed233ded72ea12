//! Runner pod and ephemeral secret manifests.
//!
//! The runner pod mounts three things at fixed paths: the config secret at
//! /config, the clone PVC read-only at /data and the borg cache PVC at
//! /cache. It runs privileged by default so it can read volumes regardless
//! of file ownership, and its activeDeadlineSeconds is the per-volume
//! timeout.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Secret, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use borgkube_common::runner_config::{RunnerConfig, CONFIG_KEY};
use borgkube_common::{
    names, Result, LABEL_APP, LABEL_MANAGED_BY, MANAGED_BY_VALUE, RUNNER_CACHE_MOUNT,
    RUNNER_CONFIG_MOUNT, RUNNER_DATA_MOUNT,
};

/// Container name inside the runner pod.
pub const RUNNER_CONTAINER: &str = "runner";

/// Label carrying the backup spec name on runner pods.
pub const LABEL_BACKUP: &str = "backup";

fn common_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Build the ephemeral config secret for one runner pod.
pub fn build_runner_secret(
    name: &str,
    namespace: &str,
    config: &RunnerConfig,
) -> Result<Secret> {
    let mut labels = common_labels();
    labels.insert("ephemeral".to_string(), "true".to_string());

    let mut string_data = BTreeMap::new();
    string_data.insert(CONFIG_KEY.to_string(), config.to_yaml()?);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    })
}

/// Everything needed to build a runner pod manifest.
pub struct RunnerPodParams<'a> {
    pub pod_name: &'a str,
    pub namespace: &'a str,
    pub backup_name: &'a str,
    pub image: &'a str,
    pub clone_pvc: &'a str,
    pub cache_pvc: &'a str,
    pub config_secret: &'a str,
    pub privileged: bool,
    pub timeout_seconds: u64,
}

/// Build the runner pod manifest.
pub fn build_runner_pod(params: &RunnerPodParams<'_>) -> Pod {
    let mut labels = common_labels();
    labels.insert(
        LABEL_BACKUP.to_string(),
        names::label_value(params.backup_name),
    );

    let volume_mounts = vec![
        VolumeMount {
            name: "config".to_string(),
            mount_path: RUNNER_CONFIG_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "data".to_string(),
            mount_path: RUNNER_DATA_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "cache".to_string(),
            mount_path: RUNNER_CACHE_MOUNT.to_string(),
            ..Default::default()
        },
    ];

    let volumes = vec![
        Volume {
            name: "config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(params.config_secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: params.clone_pvc.to_string(),
                read_only: Some(true),
            }),
            ..Default::default()
        },
        Volume {
            name: "cache".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: params.cache_pvc.to_string(),
                read_only: None,
            }),
            ..Default::default()
        },
    ];

    Pod {
        metadata: ObjectMeta {
            name: Some(params.pod_name.to_string()),
            namespace: Some(params.namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            active_deadline_seconds: Some(params.timeout_seconds as i64),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: RUNNER_CONTAINER.to_string(),
                image: Some(params.image.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                args: Some(vec!["backup".to_string()]),
                security_context: Some(SecurityContext {
                    privileged: Some(params.privileged),
                    ..Default::default()
                }),
                volume_mounts: Some(volume_mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use borgkube_common::config::Retention;

    fn config() -> RunnerConfig {
        RunnerConfig {
            repo: "ssh://borg@host/./repo".into(),
            passphrase: "p".into(),
            ssh_key: "key".into(),
            archive_prefix: "myapp-data".into(),
            timeout_seconds: 3600,
            borg_flags: vec![],
            retention: Retention::default(),
            cache_the_cache: false,
        }
    }

    fn params<'a>() -> RunnerPodParams<'a> {
        RunnerPodParams {
            pod_name: "myapp-backup-backup-runner-data-2026-02-03-04-05-06",
            namespace: "prod",
            backup_name: "data",
            image: "ghcr.io/borgkube/runner:0.6.0",
            clone_pvc: "myapp-backup-clone-data-1770091506000",
            cache_pvc: "borg-cache",
            config_secret: "myapp-backup-backup-runner-data-2026-02-03-04-05-06-config",
            privileged: true,
            timeout_seconds: 3600,
        }
    }

    #[test]
    fn secret_carries_config_yaml_and_labels() {
        let secret = build_runner_secret("runner-config", "prod", &config()).unwrap();
        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels.get("ephemeral").map(String::as_str), Some("true"));
        assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGED_BY_VALUE));

        let data = secret.string_data.unwrap();
        let yaml = data.get(CONFIG_KEY).unwrap();
        assert!(yaml.contains("archivePrefix: myapp-data"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
    }

    #[test]
    fn pod_mounts_config_data_cache_at_fixed_paths() {
        let pod = build_runner_pod(&params());
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert_eq!(container.name, RUNNER_CONTAINER);

        let mounts = container.volume_mounts.as_ref().unwrap();
        let by_name: BTreeMap<&str, &VolumeMount> =
            mounts.iter().map(|m| (m.name.as_str(), m)).collect();
        assert_eq!(by_name["config"].mount_path, "/config");
        assert_eq!(by_name["config"].read_only, Some(true));
        assert_eq!(by_name["data"].mount_path, "/data");
        assert_eq!(by_name["data"].read_only, Some(true));
        assert_eq!(by_name["cache"].mount_path, "/cache");
        assert_eq!(by_name["cache"].read_only, None);
    }

    #[test]
    fn pod_enforces_deadline_and_no_restart() {
        let pod = build_runner_pod(&params());
        let spec = pod.spec.unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(3600));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn pod_privilege_follows_config() {
        let mut p = params();
        let pod = build_runner_pod(&p);
        let privileged = pod.spec.unwrap().containers[0]
            .security_context
            .as_ref()
            .unwrap()
            .privileged;
        assert_eq!(privileged, Some(true));

        p.privileged = false;
        let pod = build_runner_pod(&p);
        let privileged = pod.spec.unwrap().containers[0]
            .security_context
            .as_ref()
            .unwrap()
            .privileged;
        assert_eq!(privileged, Some(false));
    }

    #[test]
    fn pod_volumes_reference_the_right_claims() {
        let pod = build_runner_pod(&params());
        let volumes = pod.spec.unwrap().volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == "data").unwrap();
        assert_eq!(
            data.persistent_volume_claim.as_ref().unwrap().claim_name,
            "myapp-backup-clone-data-1770091506000"
        );
        assert_eq!(data.persistent_volume_claim.as_ref().unwrap().read_only, Some(true));

        let config = volumes.iter().find(|v| v.name == "config").unwrap();
        assert_eq!(
            config.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("myapp-backup-backup-runner-data-2026-02-03-04-05-06-config")
        );
    }

    #[test]
    fn long_backup_names_stay_legal_label_values() {
        let long_name = "x".repeat(90);
        let p = RunnerPodParams {
            backup_name: &long_name,
            ..params()
        };
        let pod = build_runner_pod(&p);
        let labels = pod.metadata.labels.unwrap();
        assert!(labels[LABEL_BACKUP].len() <= 63);
    }
}
