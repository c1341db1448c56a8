//! # Error Policy
//!
//! What a runner does after a failed reconciliation, and how watch stream errors
//! are reported.

use std::time::Duration;

use kube::runtime::watcher;
use tracing::{error, info, warn};

use crate::controller::backoff::ExponentialBackoff;
use crate::controller::ControllerError;
use crate::observability::metrics;

/// Next step for a runner whose reconciliation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry after the delay
    Backoff(Duration),
    /// Stop until a watched object changes
    Halt,
}

/// Handle a reconciliation error with exponential backoff.
///
/// Fatal errors are never retried automatically: retrying cannot fix a key object
/// that does not match what minting would have produced.
pub fn handle_reconciliation_error(
    controller: &str,
    error: &ControllerError,
    backoff: &mut ExponentialBackoff,
) -> ErrorAction {
    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.reconciliation_error",
        controller = controller,
        reason = error.reason(),
    );
    let _error_guard = error_span.enter();

    metrics::increment_reconciliation_errors(controller);

    if error.is_fatal() {
        error!(
            error = %error,
            "Reconciliation failed fatally, halting until a watched object changes"
        );
        return ErrorAction::Halt;
    }

    let delay = backoff.next_backoff();
    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    warn!(error = %error, "Reconciliation failed");
    info!(
        delay_ms = delay.as_millis() as u64,
        next_retry = %next_trigger_time.to_rfc3339(),
        "Retrying with exponential backoff"
    );

    metrics::increment_requeues_total(controller, "error-backoff");
    ErrorAction::Backoff(delay)
}

/// Log a watch stream error. The watcher's own backoff restarts the stream.
pub fn handle_watch_stream_error(watch: &str, error: &watcher::Error) {
    let error_span = tracing::span!(tracing::Level::WARN, "controller.watch.error", watch = watch);
    let _error_guard = error_span.enter();

    match error {
        watcher::Error::InitialListFailed(e) | watcher::Error::WatchStartFailed(e) => {
            warn!(error = %e, "Watch could not be (re)started, retrying");
        }
        watcher::Error::WatchError(status) if status.code == 410 => {
            warn!("Watch resource version expired (410), relisting");
        }
        other => {
            error!(error = %other, "Watch stream error");
        }
    }
}
