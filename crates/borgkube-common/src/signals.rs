//! Signal-driven cancellation.
//!
//! Both controllers install handlers for SIGTERM, SIGINT and SIGHUP. A
//! signal cancels the shared token; the run observes it at the next
//! suspension point, drains tracked resources, runs outstanding post-hooks
//! and exits 143.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

/// Install the termination handlers and return the token they cancel.
pub fn install_termination_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::execution("signals", format!("SIGTERM handler: {e}")))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::execution("signals", format!("SIGINT handler: {e}")))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| Error::execution("signals", format!("SIGHUP handler: {e}")))?;

    let cancel = token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
        };
        warn!(signal = name, "termination signal received, cancelling run");
        cancel.cancel();
    });

    Ok(token)
}
