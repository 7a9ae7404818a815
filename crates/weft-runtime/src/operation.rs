use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;

use crate::task::TaskDep;

/// Identifier of a controlled operation.
///
/// Ids are dense, start at 0, and strictly increase in registration order.
/// They are the primary ordering key during selection and the tiebreak rule
/// presented to strategies.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OperationId(u64);

impl OperationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op({})", self.0)
    }
}

/// Why a blocked operation is blocked.
///
/// The original statuses `BlockedOnWaitAll`, `BlockedOnWaitAny`,
/// `BlockedOnReceive`, and `BlockedOnResource` collapse into one blocked
/// status with this cause tag; re-enabling keys off the tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockReason {
    /// Waiting for every dependency to finish.
    WaitAll,
    /// Waiting for at least one dependency to finish.
    WaitAny,
    /// An actor waiting to receive an event of an awaited type.
    Receive,
    /// Waiting on a user-visible synchronization primitive.
    Resource,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BlockReason::WaitAll => "wait-all",
            BlockReason::WaitAny => "wait-any",
            BlockReason::Receive => "receive",
            BlockReason::Resource => "resource",
        };

        f.write_str(text)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperationStatus {
    /// Registered but not yet started.
    Registered,
    /// Eligible to be selected by the strategy.
    Enabled,
    /// A delay operation whose virtual time has not yet expired.
    Delayed,
    /// Waiting on dependencies; see [`BlockReason`].
    Blocked(BlockReason),
    /// Finished normally. Terminal.
    Completed,
    /// Terminated by detach. Terminal.
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Canceled)
    }

    pub fn is_blocked(self) -> bool {
        matches!(self, OperationStatus::Blocked(_))
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Registered => f.write_str("registered"),
            OperationStatus::Enabled => f.write_str("enabled"),
            OperationStatus::Delayed => f.write_str("delayed"),
            OperationStatus::Blocked(reason) => write!(f, "blocked-on-{reason}"),
            OperationStatus::Completed => f.write_str("completed"),
            OperationStatus::Canceled => f.write_str("canceled"),
        }
    }
}

/// One schedulable unit of work: a task, or one actor handler turn.
///
/// Owned exclusively by the scheduler's operation map; everything else
/// refers to an operation by id.
pub struct Operation {
    pub id: OperationId,
    pub name: String,

    status: OperationStatus,
    dependencies: Vec<TaskDep>,
    awaited_events: HashSet<TypeId>,
    remaining_delay: u64,
    resource_signaled: bool,

    /// Fingerprint of the program state the last time this operation was
    /// scheduled, when state hashing is enabled.
    pub state_hash: Option<u64>,

    /// Set when a pending receive completed; the next receive entry skips
    /// its scheduling point because the wake-up already was one.
    pub suppress_next_receive_point: bool,

    /// Failure message captured when this operation's body panicked.
    pub failure: Option<String>,
}

impl Operation {
    pub fn new(id: OperationId, name: String) -> Self {
        Self {
            id,
            name,
            status: OperationStatus::Registered,
            dependencies: Vec::new(),
            awaited_events: HashSet::new(),
            remaining_delay: 0,
            resource_signaled: false,
            state_hash: None,
            suppress_next_receive_point: false,
            failure: None,
        }
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Mark the operation as eligible to run. No-op on terminal statuses.
    pub fn enable(&mut self) {
        if !self.status.is_terminal() {
            self.transition(OperationStatus::Enabled);
        }
    }

    /// Block until `task` completes.
    pub fn block_until_task_completes(&mut self, task: TaskDep) {
        self.block_until_tasks_complete(vec![task], true);
    }

    /// Block until all (or, with `wait_all == false`, any) of `tasks`
    /// complete.
    pub fn block_until_tasks_complete(&mut self, tasks: Vec<TaskDep>, wait_all: bool) {
        debug_assert!(!self.status.is_terminal());
        self.dependencies = tasks;

        let reason = if wait_all {
            BlockReason::WaitAll
        } else {
            BlockReason::WaitAny
        };
        self.transition(OperationStatus::Blocked(reason));
    }

    /// Block until the owning actor's queue supplies an event whose type is
    /// in `event_types`.
    pub fn wait_event(&mut self, event_types: impl IntoIterator<Item = TypeId>) {
        debug_assert!(!self.status.is_terminal());
        self.awaited_events = event_types.into_iter().collect();
        self.transition(OperationStatus::Blocked(BlockReason::Receive));
    }

    /// Block on a user-visible synchronization primitive until
    /// [`signal_resource`](Self::signal_resource) is called.
    pub fn block_on_resource(&mut self) {
        debug_assert!(!self.status.is_terminal());
        self.resource_signaled = false;
        self.transition(OperationStatus::Blocked(BlockReason::Resource));
    }

    pub fn signal_resource(&mut self) {
        self.resource_signaled = true;
    }

    /// Become a delay operation for `units` of virtual time.
    pub fn delay(&mut self, units: u64) {
        debug_assert!(!self.status.is_terminal());
        if units == 0 {
            self.transition(OperationStatus::Enabled);
            return;
        }

        self.remaining_delay = units;
        self.transition(OperationStatus::Delayed);
    }

    pub fn remaining_delay(&self) -> u64 {
        self.remaining_delay
    }

    /// Advance this delay operation's virtual clock, enabling it when the
    /// timeout expires.
    pub fn advance_delay(&mut self, units: u64) {
        if self.status != OperationStatus::Delayed {
            return;
        }

        self.remaining_delay = self.remaining_delay.saturating_sub(units);
        if self.remaining_delay == 0 {
            self.transition(OperationStatus::Enabled);
        }
    }

    /// The awaited event types of a receive-blocked operation.
    pub fn awaited_events(&self) -> &HashSet<TypeId> {
        &self.awaited_events
    }

    /// The queue delivered a matching event: clear the wait set and become
    /// runnable again.
    pub fn on_received_event(&mut self) {
        self.awaited_events.clear();
        self.suppress_next_receive_point = true;
        if !self.status.is_terminal() {
            self.transition(OperationStatus::Enabled);
        }
    }

    pub fn on_completed(&mut self) {
        self.dependencies.clear();
        self.awaited_events.clear();
        if !self.status.is_terminal() {
            self.transition(OperationStatus::Completed);
        }
    }

    /// Cancel on detach. Completed operations stay completed.
    pub fn on_canceled(&mut self) {
        if !self.status.is_terminal() {
            self.transition(OperationStatus::Canceled);
        }
    }

    /// Re-check a blocked operation's dependencies and enable it when they
    /// are satisfied. Returns whether the operation is now enabled.
    ///
    /// Receive-blocked operations are enabled by the queue through
    /// [`on_received_event`](Self::on_received_event) instead, and delayed
    /// operations by [`advance_delay`](Self::advance_delay).
    pub fn try_enable(&mut self) -> bool {
        match self.status {
            OperationStatus::Enabled => true,
            OperationStatus::Blocked(BlockReason::WaitAll) => {
                if self.dependencies.iter().all(|dep| dep.is_finished()) {
                    self.dependencies.clear();
                    self.transition(OperationStatus::Enabled);
                    true
                } else {
                    false
                }
            }
            OperationStatus::Blocked(BlockReason::WaitAny) => {
                if self.dependencies.iter().any(|dep| dep.is_finished()) {
                    self.dependencies.clear();
                    self.transition(OperationStatus::Enabled);
                    true
                } else {
                    false
                }
            }
            OperationStatus::Blocked(BlockReason::Resource) => {
                if self.resource_signaled {
                    self.resource_signaled = false;
                    self.transition(OperationStatus::Enabled);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Whether this operation is blocked on at least one dependency the
    /// runtime cannot observe to completion. Such operations feed the
    /// relaxed-mode retry logic instead of the deadlock detector.
    pub fn is_blocked_on_uncontrolled_dependency(&self) -> bool {
        self.status.is_blocked() && self.dependencies.iter().any(|dep| !dep.is_controlled())
    }

    fn transition(&mut self, status: OperationStatus) {
        if self.status != status {
            tracing::trace!(
                target: "weft_runtime::operation",
                "{} '{}': {} -> {}",
                self.id,
                self.name,
                self.status,
                status
            );
            self.status = status;
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("state_hash", &self.state_hash)
            .field("failure", &self.failure)
            .finish()
    }
}
