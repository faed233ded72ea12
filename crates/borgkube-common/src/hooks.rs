//! Hook executor: pre/post command lists exec'd inside existing pods.
//!
//! Hooks run sequentially in list order; consecutive hooks marked `parallel`
//! form a group that runs concurrently. A missing target pod is a hard
//! error, and the first non-zero exit aborts the remaining sequence.

use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use crate::config::Hook;
use crate::error::{is_not_found, Error, Result};

/// Captured result of one hook command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Derive the process exit code from the exec status object.
///
/// The API reports `Success` for exit 0; non-zero exits come back as a
/// `Failure` whose details carry an `ExitCode` cause. A missing status after
/// a clean stream end means success.
pub fn exit_code_from_status(status: Option<&Status>) -> i32 {
    let Some(status) = status else { return 0 };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

/// Group hooks into sequential execution units: each unit is either a single
/// sequential hook or a run of consecutive `parallel` hooks.
pub fn group_hooks(hooks: &[Hook]) -> Vec<Vec<&Hook>> {
    let mut groups: Vec<Vec<&Hook>> = Vec::new();
    for hook in hooks {
        if hook.parallel {
            if let Some(last) = groups.last_mut() {
                if last[0].parallel {
                    last.push(hook);
                    continue;
                }
            }
        }
        groups.push(vec![hook]);
    }
    groups
}

/// Executes hooks against pods in one namespace.
#[derive(Clone)]
pub struct HookExecutor {
    pods: Api<Pod>,
}

impl HookExecutor {
    pub fn new(client: &Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
        }
    }

    /// Run all hooks, honoring parallel grouping. The first failure aborts
    /// the remaining sequence and is returned.
    pub async fn run_all(&self, hooks: &[Hook]) -> Result<()> {
        for group in group_hooks(hooks) {
            if group.len() == 1 {
                self.run_checked(group[0]).await?;
            } else {
                let results = join_all(group.iter().map(|h| self.run_checked(h))).await;
                for result in results {
                    result?;
                }
            }
        }
        Ok(())
    }

    async fn run_checked(&self, hook: &Hook) -> Result<()> {
        let output = self.run_one(hook).await?;
        if output.exit_code != 0 {
            return Err(Error::Hook {
                pod: hook.pod.clone(),
                message: format!(
                    "command {:?} exited {}: {}",
                    hook.command,
                    output.exit_code,
                    output.stderr.trim()
                ),
                exit_code: Some(output.exit_code),
            });
        }
        info!(pod = %hook.pod, command = ?hook.command, "hook succeeded");
        Ok(())
    }

    /// Execute one hook and capture its output without judging the exit code.
    pub async fn run_one(&self, hook: &Hook) -> Result<HookOutput> {
        let pod = match self.pods.get(&hook.pod).await {
            Ok(pod) => pod,
            Err(e) if is_not_found(&e) => {
                return Err(Error::Hook {
                    pod: hook.pod.clone(),
                    message: "target pod not found".to_string(),
                    exit_code: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let container = match &hook.container {
            Some(c) => c.clone(),
            None => first_container(&pod).ok_or_else(|| Error::Hook {
                pod: hook.pod.clone(),
                message: "pod has no containers".to_string(),
                exit_code: None,
            })?,
        };
        debug!(pod = %hook.pod, container = %container, command = ?hook.command, "executing hook");

        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self.pods.exec(&hook.pod, hook.command.clone(), &params).await?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_all(stdout_reader), read_all(stderr_reader));

        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        let exit_code = exit_code_from_status(status.as_ref());

        Ok(HookOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

fn first_container(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    fn hook(pod: &str, parallel: bool) -> Hook {
        Hook {
            pod: pod.to_string(),
            container: None,
            command: vec!["true".to_string()],
            parallel,
        }
    }

    #[test]
    fn missing_status_is_success() {
        assert_eq!(exit_code_from_status(None), 0);
    }

    #[test]
    fn success_status_is_zero() {
        let status = Status {
            status: Some("Success".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 0);
    }

    #[test]
    fn failure_status_parses_exit_code_cause() {
        let status = Status {
            status: Some("Failure".into()),
            reason: Some("NonZeroExitCode".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("2".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 2);
    }

    #[test]
    fn failure_without_cause_defaults_to_one() {
        let status = Status {
            status: Some("Failure".into()),
            message: Some("error executing command".into()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 1);
    }

    #[test]
    fn sequential_hooks_stay_single() {
        let hooks = vec![hook("a", false), hook("b", false)];
        let groups = group_hooks(&hooks);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn consecutive_parallel_hooks_group() {
        let hooks = vec![
            hook("a", false),
            hook("b", true),
            hook("c", true),
            hook("d", false),
            hook("e", true),
        ];
        let groups = group_hooks(&hooks);
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![1, 2, 1, 1]);
        assert_eq!(groups[1][0].pod, "b");
        assert_eq!(groups[1][1].pod, "c");
    }

    #[test]
    fn empty_hook_list_groups_to_nothing() {
        assert!(group_hooks(&[]).is_empty());
    }
}
