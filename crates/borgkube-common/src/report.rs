//! End-of-run reporting.
//!
//! The final lines of controller output are a per-spec status table and one
//! summary line with succeeded/failed counts. The process exit code is the
//! failed count capped at 1, or 143 after a signal.

use std::fmt::Write as _;

use crate::EXIT_TERMINATED;

/// Outcome of one spec in a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpecOutcome {
    Succeeded,
    Failed(String),
    NotStarted(String),
}

impl SpecOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SpecOutcome::Failed(_))
    }
}

/// Collected per-spec outcomes for one controller run.
#[derive(Debug, Default)]
pub struct RunReport {
    entries: Vec<(String, SpecOutcome)>,
    cancelled: bool,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded(&mut self, name: &str) {
        self.entries.push((name.to_string(), SpecOutcome::Succeeded));
    }

    pub fn failed(&mut self, name: &str, reason: impl Into<String>) {
        self.entries
            .push((name.to_string(), SpecOutcome::Failed(reason.into())));
    }

    pub fn not_started(&mut self, name: &str, reason: impl Into<String>) {
        self.entries
            .push((name.to_string(), SpecOutcome::NotStarted(reason.into())));
    }

    /// Mark the run as terminated by signal; forces exit code 143.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn failure_count(&self) -> usize {
        self.entries.iter().filter(|(_, o)| o.is_failure()).count()
    }

    pub fn success_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, o)| *o == SpecOutcome::Succeeded)
            .count()
    }

    /// Exit code: 0 all good, 1 when at least one spec failed, 143 after a
    /// signal.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_TERMINATED
        } else if self.failure_count() > 0 {
            1
        } else {
            0
        }
    }

    /// Render the status table plus summary line.
    pub fn render(&self) -> String {
        let width = self
            .entries
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(4)
            .max(4);

        let mut out = String::new();
        let _ = writeln!(out, "{:-<1$}", "", width + 16);
        for (name, outcome) in &self.entries {
            let status = match outcome {
                SpecOutcome::Succeeded => "ok".to_string(),
                SpecOutcome::Failed(reason) => format!("FAILED  {reason}"),
                SpecOutcome::NotStarted(reason) => format!("not started  {reason}"),
            };
            let _ = writeln!(out, "{name:width$}  {status}");
        }
        let _ = writeln!(out, "{:-<1$}", "", width + 16);
        let _ = write!(
            out,
            "{} succeeded, {} failed",
            self.success_count(),
            self.failure_count()
        );
        if self.cancelled {
            let _ = write!(out, " (terminated by signal)");
        }
        out
    }
}
