use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::operation::OperationId;

/// Completion state of something an operation can block on.
///
/// The scheduler inspects this when deciding whether a blocked operation can
/// be re-enabled. Controlled implementations are driven by the runtime
/// itself; uncontrolled ones (native work the runtime merely observes) feed
/// the relaxed-mode retry logic instead.
pub trait CompletionState: Send + Sync {
    fn is_finished(&self) -> bool;

    /// Whether the runtime drives this dependency to completion itself.
    fn is_controlled(&self) -> bool;
}

/// A type-erased dependency handle an operation can block on.
#[derive(Clone)]
pub struct TaskDep(Arc<dyn CompletionState>);

impl TaskDep {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    pub fn is_controlled(&self) -> bool {
        self.0.is_controlled()
    }
}

impl fmt::Debug for TaskDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDep")
            .field("finished", &self.is_finished())
            .field("controlled", &self.is_controlled())
            .finish()
    }
}

enum TaskOutcome<T> {
    Pending,
    Completed(T),
    Failed(String),
    Canceled,
    Taken,
}

struct TaskShared<T> {
    op: OperationId,
    finished: AtomicBool,
    outcome: Mutex<TaskOutcome<T>>,
}

impl<T: Send> CompletionState for TaskShared<T> {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn is_controlled(&self) -> bool {
        true
    }
}

/// Handle to a controlled task spawned through the runtime.
///
/// Joining goes through [`Runtime::join`](crate::Runtime::join) (or
/// `wait_all`/`wait_any` with [`dep`](TaskHandle::dep)) so that the wait is
/// a scheduling point the strategy can explore.
pub struct TaskHandle<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(op: OperationId) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                op,
                finished: AtomicBool::new(false),
                outcome: Mutex::new(TaskOutcome::Pending),
            }),
        }
    }

    /// The id of the operation wrapping this task.
    pub fn operation_id(&self) -> OperationId {
        self.shared.op
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// A type-erased view of this task for `wait_all`/`wait_any`.
    pub fn dep(&self) -> TaskDep {
        TaskDep(self.shared.clone())
    }

    pub(crate) fn complete(&self, value: T) {
        *self.shared.outcome.lock() = TaskOutcome::Completed(value);
        self.shared.finished.store(true, Ordering::Release);
    }

    pub(crate) fn fail(&self, message: String) {
        *self.shared.outcome.lock() = TaskOutcome::Failed(message);
        self.shared.finished.store(true, Ordering::Release);
    }

    pub(crate) fn cancel(&self) {
        let mut outcome = self.shared.outcome.lock();
        if matches!(*outcome, TaskOutcome::Pending) {
            *outcome = TaskOutcome::Canceled;
            self.shared.finished.store(true, Ordering::Release);
        }
    }

    /// Take the task's result. Errors if the task is still pending, was
    /// canceled, failed, or was already consumed.
    pub(crate) fn take_result(&self) -> anyhow::Result<T> {
        let mut outcome = self.shared.outcome.lock();
        match std::mem::replace(&mut *outcome, TaskOutcome::Taken) {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(message) => {
                *outcome = TaskOutcome::Failed(message.clone());
                anyhow::bail!("task failed: {message}")
            }
            TaskOutcome::Canceled => {
                *outcome = TaskOutcome::Canceled;
                anyhow::bail!("task was canceled before completing")
            }
            TaskOutcome::Pending => {
                *outcome = TaskOutcome::Pending;
                anyhow::bail!("task has not completed yet")
            }
            TaskOutcome::Taken => anyhow::bail!("task result was already taken"),
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("op", &self.shared.op)
            .field("finished", &self.shared.finished.load(Ordering::Acquire))
            .finish()
    }
}

struct ExternalInner {
    finished: AtomicBool,
}

impl CompletionState for ExternalInner {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn is_controlled(&self) -> bool {
        false
    }
}

/// Completion source for work the runtime does not control.
///
/// Blocking on its [`dep`](ExternalSource::dep) marks the operation as
/// blocked on an uncontrolled dependency, which only relaxed mode will wait
/// out.
pub struct ExternalSource {
    inner: Arc<ExternalInner>,
}

impl ExternalSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExternalInner {
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn complete(&self) {
        self.inner.finished.store(true, Ordering::Release);
    }

    pub fn dep(&self) -> TaskDep {
        TaskDep(self.inner.clone())
    }
}

impl Default for ExternalSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_reports_completion() {
        let handle = TaskHandle::new(OperationId::new(1));
        assert!(!handle.is_finished());
        assert!(handle.take_result().is_err());

        handle.complete(5);
        assert!(handle.is_finished());
        assert_eq!(handle.take_result().unwrap(), 5);

        // A second take observes that the result is gone.
        assert!(handle.take_result().is_err());
    }

    #[test]
    fn cancel_does_not_overwrite_a_result() {
        let handle = TaskHandle::new(OperationId::new(0));
        handle.complete("done");
        handle.cancel();
        assert_eq!(handle.take_result().unwrap(), "done");
    }

    #[test]
    fn external_source_is_uncontrolled() {
        let source = ExternalSource::new();
        let dep = source.dep();

        assert!(!dep.is_controlled());
        assert!(!dep.is_finished());

        source.complete();
        assert!(dep.is_finished());
    }
}
