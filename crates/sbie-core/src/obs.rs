//! Structured observability hooks for orchestrator operations.
//!
//! - `OperationSpan` RAII guard scoping all events of one operation
//! - `emit_*` functions for step boundaries, helper invocations, swallowed
//!   retries and best-effort cleanup
//!
//! These are an auxiliary channel; the returned `Outcome` stays the
//! authoritative diagnostic.

use tracing::{info, warn};

use crate::outcome::StatusCode;

/// RAII guard that enters an operation-scoped span.
///
/// ```ignore
/// let _span = OperationSpan::enter("install");
/// ```
pub struct OperationSpan {
    _span: tracing::span::EnteredSpan,
}

impl OperationSpan {
    pub fn enter(operation: &str) -> Self {
        let span = tracing::info_span!("sbie.operation", operation = %operation);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a step of a composite operation finished.
pub fn emit_step_finished(step: &str, status: StatusCode) {
    if status.is_ok() {
        info!(event = "step.finished", step = %step, status = %status);
    } else {
        warn!(event = "step.finished", step = %step, status = %status);
    }
}

/// Emit event: the privileged helper or installer exited.
pub fn emit_helper_exited(command: &str, exit_code: i32) {
    info!(event = "helper.exited", command = %command, exit_code = exit_code);
}

/// Emit event: a non-final attempt failed and will be retried.
pub fn emit_attempt_failed(step: &str, attempt: u32, attempts: u32, reason: &str) {
    warn!(
        event = "attempt.failed",
        step = %step,
        attempt = attempt,
        attempts = attempts,
        reason = %reason,
    );
}

/// Emit event: best-effort cleanup could not be completed.
pub fn emit_cleanup_failed(path: &str, error: &dyn std::fmt::Display) {
    warn!(event = "cleanup.failed", path = %path, error = %error);
}
