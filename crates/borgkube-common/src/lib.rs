//! Shared library for the borgkube controllers and runner.
//!
//! The two controllers (snapshot and backup) and the in-pod runner share the
//! configuration model, the cluster client façade, the pod monitor, the hook
//! executor, the retention engine and the tracked-resources registry defined
//! here.

pub mod config;
pub mod error;
pub mod hooks;
pub mod kube_client;
pub mod names;
pub mod pod_monitor;
pub mod report;
pub mod retention;
pub mod runner_config;
pub mod signals;
pub mod snapshots;
pub mod tracked;

pub use error::{Error, Result};

/// Label applied to every resource this system creates.
pub const LABEL_APP: &str = "app";
/// Label recording which PVC a snapshot or clone belongs to.
pub const LABEL_PVC: &str = "pvc";
/// Label marking resources as managed by borgkube.
pub const LABEL_MANAGED_BY: &str = "managed-by";
/// Value for both the `app` and `managed-by` labels.
pub const MANAGED_BY_VALUE: &str = "borgkube";

/// Mount path of the runner config secret inside the runner pod.
pub const RUNNER_CONFIG_MOUNT: &str = "/config";
/// Mount path of the clone PVC inside the runner pod.
pub const RUNNER_DATA_MOUNT: &str = "/data";
/// Mount path of the borg cache PVC inside the runner pod.
pub const RUNNER_CACHE_MOUNT: &str = "/cache";

/// Exit code reported after signal-driven termination.
pub const EXIT_TERMINATED: i32 = 143;
