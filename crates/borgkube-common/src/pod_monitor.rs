//! Pod monitor: concurrent log and event streaming for a single pod.
//!
//! Two cooperative streams run until the pod reaches a terminal phase or the
//! caller cancels:
//!
//! - the log stream waits for the container to report a started-at timestamp,
//!   then opens one follow-mode read for the pod's lifetime and prefixes each
//!   line with `[{podName}]`. A 400 before the container has started is
//!   swallowed (the API rejects follow reads on unstarted containers).
//! - the event stream is a field-selected watch, reconnected on the watch's
//!   natural ~60s timeout and on 410 Gone by re-listing; the resume point is
//!   the list envelope's `resourceVersion`, never an individual event's.
//!   Reconnects re-deliver the server's event buffer, so emissions are
//!   deduplicated by event UID (capped per pod).

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ListParams, LogParams, WatchEvent, WatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{is_gone, Error, Result};

/// Upper bound on remembered event UIDs per pod.
const EVENT_UID_CAP: usize = 200;

/// Poll interval for the terminal-phase check and the container-start gate.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Server-side watch timeout; the stream ends and is reopened after this.
const WATCH_TIMEOUT_SECS: u32 = 60;

/// How a monitored pod ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        reason: Option<String>,
    },
}

impl PodOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PodOutcome::Succeeded)
    }
}

/// Terminal outcome of a pod, if it has one yet.
pub fn terminal_outcome(pod: &Pod, container: &str) -> Option<PodOutcome> {
    let status = pod.status.as_ref()?;
    match status.phase.as_deref() {
        Some("Succeeded") => Some(PodOutcome::Succeeded),
        Some("Failed") => {
            let exit_code = status
                .container_statuses
                .as_ref()
                .and_then(|cs| cs.iter().find(|c| c.name == container))
                .and_then(|c| c.state.as_ref())
                .and_then(|s| s.terminated.as_ref())
                .map(|t| t.exit_code);
            Some(PodOutcome::Failed {
                exit_code,
                reason: status.reason.clone(),
            })
        }
        _ => None,
    }
}

/// Whether the named container has started (or already terminated).
pub fn container_started(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|c| {
                c.name == container
                    && c.state.as_ref().is_some_and(|s| {
                        s.running.as_ref().is_some_and(|r| r.started_at.is_some())
                            || s.terminated.is_some()
                    })
            })
        })
        .unwrap_or(false)
}

/// Render one event for emission; `None` when it has no UID to dedup by.
pub fn format_event(event: &Event) -> Option<(String, String)> {
    let uid = event.metadata.uid.clone()?;
    let line = format!(
        "[EVENT] {} {}: {}",
        event.type_.as_deref().unwrap_or("Unknown"),
        event.reason.as_deref().unwrap_or(""),
        event.message.as_deref().unwrap_or(""),
    );
    Some((uid, line))
}

/// Bounded set of already-emitted event UIDs.
#[derive(Default)]
pub struct EventDeduper {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl EventDeduper {
    pub fn new() -> Self {
        Self::with_cap(EVENT_UID_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Record a UID. Returns true when it was not seen before.
    pub fn insert(&mut self, uid: &str) -> bool {
        if self.seen.contains(uid) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(uid.to_string());
        self.order.push_back(uid.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Monitor one pod until it terminates.
pub struct PodMonitor {
    client: Client,
    namespace: String,
    pod_name: String,
    container: String,
    cancel: CancellationToken,
}

impl PodMonitor {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        pod_name: impl Into<String>,
        container: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            pod_name: pod_name.into(),
            container: container.into(),
            cancel,
        }
    }

    /// Block until the pod reaches `Succeeded` or `Failed`, streaming logs
    /// and events along the way. Cancellation yields `Error::Cancelled`.
    pub async fn watch_until_terminal(&self) -> Result<PodOutcome> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);

        // Child token so the streams stop as soon as the pod is terminal,
        // without cancelling the caller's run.
        let streams_cancel = self.cancel.child_token();
        let log_task = tokio::spawn(stream_logs(
            pods.clone(),
            self.pod_name.clone(),
            self.container.clone(),
            streams_cancel.clone(),
        ));
        let event_task = tokio::spawn(stream_events(
            events,
            self.pod_name.clone(),
            streams_cancel.clone(),
        ));

        let outcome = self.poll_terminal(&pods).await;

        streams_cancel.cancel();
        let _ = log_task.await;
        let _ = event_task.await;

        outcome
    }

    async fn poll_terminal(&self, pods: &Api<Pod>) -> Result<PodOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let pod = pods.get(&self.pod_name).await?;
            if let Some(outcome) = terminal_outcome(&pod, &self.container) {
                return Ok(outcome);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

/// Log stream half: gate on container start, then follow.
async fn stream_logs(pods: Api<Pod>, pod_name: String, container: String, cancel: CancellationToken) {
    // Wait until the container's state reports a started-at timestamp.
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match pods.get(&pod_name).await {
            Ok(pod) if container_started(&pod, &container) => break,
            Ok(_) => {}
            Err(e) => debug!(pod = %pod_name, error = %e, "log gate read failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    let lp = LogParams {
        follow: true,
        container: Some(container),
        ..Default::default()
    };

    // One follow for the pod's lifetime.
    let stream = match pods.log_stream(&pod_name, &lp).await {
        Ok(s) => s,
        Err(kube::Error::Api(ae)) if ae.code == 400 => {
            // The container raced us back to a not-yet-started state
            // (restart); a final non-follow read happens via pod logs on
            // the next run. Swallowed per the API's contract.
            debug!(pod = %pod_name, "log follow rejected before container start");
            return;
        }
        Err(e) => {
            warn!(pod = %pod_name, error = %e, "failed to open log stream");
            return;
        }
    };

    let mut lines = stream.lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.try_next() => match line {
                Ok(Some(line)) => {
                    if !line.is_empty() {
                        info!("[{pod_name}] {line}");
                    }
                }
                Ok(None) => return, // stream closed: pod finished
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "log stream read failed");
                    return;
                }
            }
        }
    }
}

/// Event stream half: list for the envelope resourceVersion, watch with a
/// server-side timeout, reconnect forever until cancelled.
async fn stream_events(events: Api<Event>, pod_name: String, cancel: CancellationToken) {
    let selector = format!("involvedObject.kind=Pod,involvedObject.name={pod_name}");
    let mut deduper = EventDeduper::new();

    loop {
        if cancel.is_cancelled() {
            return;
        }

        // List: catches up on anything missed and yields the resume point.
        let list = match events.list(&ListParams::default().fields(&selector)).await {
            Ok(list) => list,
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "event list failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
        };
        for event in &list.items {
            emit_event(event, &mut deduper);
        }
        let resource_version = list.metadata.resource_version.unwrap_or_default();

        let wp = WatchParams::default()
            .fields(&selector)
            .timeout(WATCH_TIMEOUT_SECS);
        let mut stream = match events.watch(&wp, &resource_version).await {
            Ok(s) => s.boxed(),
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "event watch failed to start");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                item = stream.try_next() => match item {
                    Ok(Some(WatchEvent::Added(event)))
                    | Ok(Some(WatchEvent::Modified(event))) => {
                        emit_event(&event, &mut deduper);
                    }
                    Ok(Some(WatchEvent::Deleted(_))) | Ok(Some(WatchEvent::Bookmark(_))) => {}
                    Ok(Some(WatchEvent::Error(status))) => {
                        if status.code == 410 {
                            // Stale resourceVersion: resume from a fresh list.
                            debug!(pod = %pod_name, "event watch expired, re-listing");
                        } else {
                            warn!(pod = %pod_name, code = status.code, message = %status.message, "event watch error");
                        }
                        break;
                    }
                    Ok(None) => break, // natural ~60s timeout, reconnect
                    Err(e) => {
                        if is_gone(&e) {
                            debug!(pod = %pod_name, "event watch gone, re-listing");
                        } else {
                            warn!(pod = %pod_name, error = %e, "event watch stream failed");
                        }
                        break;
                    }
                }
            }
        }
    }
}

fn emit_event(event: &Event, deduper: &mut EventDeduper) {
    if let Some((uid, line)) = format_event(event) {
        if deduper.insert(&uid) {
            info!("{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    fn container_status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn outcome_none_while_running() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Running".into()),
            ..Default::default()
        });
        assert_eq!(terminal_outcome(&pod, "runner"), None);
    }

    #[test]
    fn outcome_succeeded() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Succeeded".into()),
            ..Default::default()
        });
        assert_eq!(terminal_outcome(&pod, "runner"), Some(PodOutcome::Succeeded));
    }

    #[test]
    fn outcome_failed_carries_exit_code() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Failed".into()),
            container_statuses: Some(vec![container_status(
                "runner",
                ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 143,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        });
        assert_eq!(
            terminal_outcome(&pod, "runner"),
            Some(PodOutcome::Failed {
                exit_code: Some(143),
                reason: None
            })
        );
    }

    #[test]
    fn outcome_failed_deadline_has_reason_but_no_code() {
        let pod = pod_with_status(PodStatus {
            phase: Some("Failed".into()),
            reason: Some("DeadlineExceeded".into()),
            ..Default::default()
        });
        match terminal_outcome(&pod, "runner") {
            Some(PodOutcome::Failed { exit_code, reason }) => {
                assert_eq!(exit_code, None);
                assert_eq!(reason.as_deref(), Some("DeadlineExceeded"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn started_gate_requires_started_at() {
        let not_started = pod_with_status(PodStatus {
            container_statuses: Some(vec![container_status(
                "runner",
                ContainerState {
                    running: Some(ContainerStateRunning { started_at: None }),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        });
        assert!(!container_started(&not_started, "runner"));

        let started = pod_with_status(PodStatus {
            container_statuses: Some(vec![container_status(
                "runner",
                ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(Time(chrono::Utc::now())),
                    }),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        });
        assert!(container_started(&started, "runner"));
    }

    #[test]
    fn terminated_container_counts_as_started() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![container_status(
                "runner",
                ContainerState {
                    terminated: Some(ContainerStateTerminated::default()),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        });
        assert!(container_started(&pod, "runner"));
    }

    #[test]
    fn event_formatting() {
        let event = Event {
            metadata: ObjectMeta {
                uid: Some("uid-1".into()),
                ..Default::default()
            },
            type_: Some("Warning".into()),
            reason: Some("FailedMount".into()),
            message: Some("volume not attached".into()),
            ..Default::default()
        };
        let (uid, line) = format_event(&event).unwrap();
        assert_eq!(uid, "uid-1");
        assert_eq!(line, "[EVENT] Warning FailedMount: volume not attached");
    }

    #[test]
    fn event_without_uid_is_skipped() {
        let event = Event::default();
        assert!(format_event(&event).is_none());
    }

    #[test]
    fn deduper_filters_repeats() {
        let mut d = EventDeduper::new();
        assert!(d.insert("a"));
        assert!(!d.insert("a"));
        assert!(d.insert("b"));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn deduper_evicts_oldest_at_cap() {
        let mut d = EventDeduper::with_cap(2);
        assert!(d.insert("a"));
        assert!(d.insert("b"));
        assert!(d.insert("c")); // evicts "a"
        assert_eq!(d.len(), 2);
        // "a" was evicted, so it can be emitted again; "b" is still known.
        assert!(d.insert("a"));
        assert!(!d.insert("c"));
    }
}
