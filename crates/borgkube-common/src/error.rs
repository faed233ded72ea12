//! Error types for the borgkube controllers and runner.
//!
//! Errors carry enough context to produce the per-spec status table at the
//! end of a run: which resource failed, in which stage, and whether the run
//! as a whole can still make progress.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for borgkube operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration, detected at startup
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "backup.volumes[0].timeout")
        field: Option<String>,
    },

    /// A snapshot, clone PVC or volume failed to provision or become ready
    #[error("provisioning error for {resource}: {message}")]
    Provisioning {
        /// Name of the resource that failed
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// A runner pod, hook or repository operation failed at execution time
    #[error("execution error [{context}]: {message}")]
    Execution {
        /// Where the failure happened (e.g., "runner-pod", "prune")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A hook command exited non-zero or its pod was missing
    #[error("hook failed in pod {pod}: {message}")]
    Hook {
        /// Pod the hook targeted
        pod: String,
        /// Description, including captured stderr when available
        message: String,
        /// Exit code when the command ran at all
        exit_code: Option<i32>,
    },

    /// A bounded wait expired
    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// The configured bound
        seconds: u64,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The run was cancelled by a termination signal
    #[error("run cancelled by termination signal")]
    Cancelled,
}

impl Error {
    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a config error with the offending field path
    pub fn config_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provisioning error for a named resource
    pub fn provisioning(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an execution error with context
    pub fn execution(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Execution {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            seconds,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error is fatal for the whole run.
    ///
    /// Config errors and cancellation abort the run; provisioning, execution,
    /// hook and timeout errors are recorded against their spec and the loop
    /// continues. Kubernetes errors are fatal only when the API server is
    /// rejecting us outright (auth failures), not on per-object 4xx.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config { .. } => true,
            Error::Cancelled => true,
            Error::Kube { source } => matches!(
                source,
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403
            ),
            _ => false,
        }
    }

    /// The field path when this is a config error with one
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Config { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

/// True when the kube error is a 404 for the object itself.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the kube error is a 409 conflict (already exists).
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True when the kube error is a 410 Gone (stale watch resource version).
pub fn is_gone(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 410)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_fatal() {
        assert!(Error::config("missing namespace").is_fatal());
        assert!(Error::config_field("backup.cache.pvcName", "must be set").is_fatal());
        assert!(Error::Cancelled.is_fatal());
    }

    #[test]
    fn per_spec_errors_are_not_fatal() {
        assert!(!Error::provisioning("clone-pvc", "ProvisioningFailed").is_fatal());
        assert!(!Error::execution("runner-pod", "exit code 2").is_fatal());
        assert!(!Error::timeout("clone bind", 300).is_fatal());
        let hook = Error::Hook {
            pod: "db-0".into(),
            message: "pg_stop_backup failed".into(),
            exit_code: Some(1),
        };
        assert!(!hook.is_fatal());
    }

    #[test]
    fn config_field_is_reported() {
        let err = Error::config_field("backup.volumes[1].pvc", "duplicate PVC");
        assert_eq!(err.field(), Some("backup.volumes[1].pvc"));
        assert!(err.to_string().contains("duplicate PVC"));
    }

    #[test]
    fn timeout_message_includes_bound() {
        let err = Error::timeout("snapshot data-pvc readiness", 120);
        assert!(err.to_string().contains("120s"));
        assert!(err.to_string().contains("snapshot data-pvc readiness"));
    }
}
