use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Signal raised at every scheduling point once the scheduler has detached.
///
/// This is used as a panic payload to unwind the stack of a controlled
/// operation. It propagates through user frames and is caught only by the
/// per-operation frame, which acknowledges it silently. It never surfaces as
/// a bug.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExecutionCanceled;

impl fmt::Display for ExecutionCanceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the execution of this operation was canceled")
    }
}

impl std::error::Error for ExecutionCanceled {}

/// Signal used to interrupt an operation's thread during teardown.
///
/// Like [`ExecutionCanceled`], this payload implements the scheduler's
/// detach protocol and must not be swallowed by user recovery code.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThreadInterrupted;

impl fmt::Display for ThreadInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "this operation's thread was interrupted")
    }
}

impl std::error::Error for ThreadInterrupted {}

/// A scheduling point was reached by code that was not registered with the
/// runtime.
///
/// This is fatal: the iteration is declared invalid and the whole run aborts
/// with an internal error rather than a bug report.
#[derive(Clone, Debug)]
pub struct UncontrolledTaskError {
    pub thread: String,
}

impl fmt::Display for UncontrolledTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread '{}' reached a scheduling point without being registered with the runtime; \
             uncontrolled concurrency cannot be explored",
            self.thread
        )
    }
}

impl std::error::Error for UncontrolledTaskError {}

/// Classification of a found bug.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BugKind {
    /// A user or monitor assertion failed.
    Assertion,
    /// All live operations are blocked and none can be enabled.
    Deadlock,
    /// A monitor exceeded its liveness temperature threshold.
    Liveness,
    /// An operation panicked and nothing caught it.
    UnhandledPanic,
    /// The step bound was hit and the configuration treats that as a bug.
    DepthBoundHit,
}

impl fmt::Display for BugKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BugKind::Assertion => "assertion failure",
            BugKind::Deadlock => "deadlock detected",
            BugKind::Liveness => "liveness violation",
            BugKind::UnhandledPanic => "unhandled panic",
            BugKind::DepthBoundHit => "depth bound reached",
        };

        f.write_str(text)
    }
}

/// Everything needed to report and replay a found bug.
///
/// Only the first bug per iteration is recorded; later failures during
/// teardown are suppressed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BugReport {
    pub kind: BugKind,
    pub message: String,
    /// The serialized schedule trace, sufficient to replay this iteration.
    pub trace: String,
    /// Description of the strategy that produced this schedule.
    pub strategy: String,
    pub seed: u64,
    /// Which iteration (0-based) produced the bug.
    pub iteration: u32,
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Unwind the current operation with the execution-canceled signal. Caught
/// only by the per-operation frame.
pub(crate) fn raise_execution_canceled() -> ! {
    std::panic::panic_any(ExecutionCanceled)
}

/// Whether this panic payload is part of the scheduler's detach/terminate
/// protocol and must keep propagating.
pub fn is_controlled_payload(payload: &(dyn Any + Send)) -> bool {
    payload.is::<ExecutionCanceled>() || payload.is::<ThreadInterrupted>()
}

/// Extract a human-readable message from a panic payload.
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Run `f`, catching panics the way `std::panic::catch_unwind` does, except
/// that payloads belonging to the runtime's terminate protocol are re-raised
/// instead of being handed to the caller.
///
/// User code that wants `catch_unwind`-style recovery inside a controlled
/// operation must use this instead, otherwise it would swallow the signal
/// the scheduler uses to unwind operations on detach.
pub fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            if is_controlled_payload(payload.as_ref()) {
                std::panic::resume_unwind(payload);
            }

            Err(payload_message(payload.as_ref()))
        }
    }
}
