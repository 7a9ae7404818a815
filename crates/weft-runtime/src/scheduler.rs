//! The operation scheduler: serializes all controlled operations onto a
//! single virtual CPU and, at every scheduling point, picks which operation
//! runs next according to the configured strategy.
//!
//! Operations execute on OS threads, but at any moment at most one of those
//! threads is outside a wait on the scheduler's single sync object (one
//! mutex plus one condition variable). That is the cooperative
//! serialization invariant everything else relies on.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use sha2::{Digest, Sha256};
use slab::Slab;

use crate::config::Config;
use crate::error::{self, BugKind, BugReport};
use crate::operation::{Operation, OperationId, OperationStatus};
use crate::strategy::SchedulingStrategy;
use crate::task::TaskDep;
use crate::trace::ScheduleTrace;

pub type FailureCallback = Box<dyn Fn(&BugReport) + Send + Sync>;

struct SchedulerState {
    /// The operation map. Slots are never freed mid-run, so iterating in
    /// key order is registration order and ids stay dense.
    ops: Slab<Operation>,

    /// The one operation currently holding the virtual CPU.
    scheduled: Option<OperationId>,

    strategy: Option<SchedulingStrategy>,
    trace: ScheduleTrace,

    /// False once the scheduler has detached. Every scheduling-point call
    /// from a still-running operation observes this and unwinds.
    attached: bool,

    /// Set when the iteration has fully finished (bug, bound, or normal
    /// completion); wakes `wait_iteration_complete`.
    done: bool,

    bug: Option<BugReport>,

    /// A fatal protocol violation (for example an uncontrolled task); the
    /// iteration is invalid rather than buggy.
    invalid: Option<String>,
}

pub struct OperationScheduler {
    state: Mutex<SchedulerState>,
    cond: Condvar,
    config: Arc<Config>,
    iteration: u32,
    on_failure: Mutex<Option<FailureCallback>>,
}

impl OperationScheduler {
    pub fn new(config: Arc<Config>, strategy: SchedulingStrategy, iteration: u32) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                ops: Slab::new(),
                scheduled: None,
                strategy: Some(strategy),
                trace: ScheduleTrace::new(),
                attached: true,
                done: false,
                bug: None,
                invalid: None,
            }),
            cond: Condvar::new(),
            config,
            iteration,
            on_failure: Mutex::new(None),
        }
    }

    pub fn set_on_failure(&self, callback: FailureCallback) {
        *self.on_failure.lock() = Some(callback);
    }

    /// Add a fresh operation to the map. The first registered operation
    /// becomes the scheduled one.
    pub fn register(&self, name: impl Into<String>) -> OperationId {
        let mut state = self.state.lock();
        let entry = state.ops.vacant_entry();
        let id = OperationId::new(entry.key() as u64);
        let name = name.into();

        tracing::debug!(
            target: "weft_runtime::scheduler",
            "registered {id} '{name}'"
        );
        entry.insert(Operation::new(id, name));

        if state.scheduled.is_none() {
            state.scheduled = Some(id);
        }

        id
    }

    /// Called on the operation's own thread: mark it enabled and wait for
    /// its first turn. The spawner observes the enable through
    /// [`wait_operation_start`](Self::wait_operation_start).
    pub fn start(&self, op: OperationId) {
        let mut state = self.state.lock();
        if !state.attached {
            drop(state);
            error::raise_execution_canceled();
        }

        state.ops[op.index()].enable();

        if self.pause_locked(&mut state, op) {
            drop(state);
            error::raise_execution_canceled();
        }
    }

    /// Block the spawning context until `op` has started, forming the
    /// handshake that guarantees the spawn is observed before the spawner
    /// proceeds.
    pub fn wait_operation_start(&self, op: OperationId) {
        let mut state = self.state.lock();
        while state.ops[op.index()].status() == OperationStatus::Registered && state.attached {
            self.cond.wait(&mut state);
        }
    }

    /// The main scheduling point. Picks the next enabled operation, hands
    /// it the virtual CPU, and pauses the caller until its next turn.
    pub fn schedule_next(&self, current: OperationId, is_yielding: bool) {
        let mut state = self.state.lock();

        if !state.attached {
            let live = !state.ops[current.index()].status().is_terminal();
            drop(state);
            if live {
                error::raise_execution_canceled();
            }
            return;
        }

        // Step bound enforcement.
        let (bound_hit, steps, live) = {
            let inner = &mut *state;
            let strategy = inner.strategy.as_mut().expect("strategy is installed");
            (
                strategy.has_reached_max_steps(),
                strategy.scheduled_steps(),
                !inner.ops[current.index()].status().is_terminal(),
            )
        };

        if bound_hit {
            if self.config.depth_bound_hit_as_bug {
                drop(state);
                self.notify_assertion_failure(
                    BugKind::DepthBoundHit,
                    format!("exploration reached the configured bound of {steps} steps"),
                );
            } else {
                tracing::debug!(
                    target: "weft_runtime::scheduler",
                    "step bound of {steps} reached, stopping this iteration"
                );
                self.detach_locked(&mut state);
                drop(state);
            }

            if live {
                error::raise_execution_canceled();
            }
            return;
        }

        if self.config.program_state_hashing {
            let hash = hash_program_state(&state.ops);
            state.ops[current.index()].state_hash = Some(hash);
        }

        let next = self.try_get_next_enabled(&mut state, current, is_yielding);

        // The liveness wrapper parks violations during the decision; drain
        // them into the failure pipeline.
        let violation = state
            .strategy
            .as_mut()
            .and_then(|strategy| strategy.take_pending_violation());
        if let Some(violation) = violation {
            let live = !state.ops[current.index()].status().is_terminal();
            drop(state);
            self.notify_assertion_failure(BugKind::Liveness, violation);
            if live {
                error::raise_execution_canceled();
            }
            return;
        }

        let next = match next {
            Some(next) => next,
            None => {
                self.finish_exhausted(state, current);
                return;
            }
        };

        state.trace.push_schedule(next);
        tracing::trace!(
            target: "weft_runtime::scheduler",
            "scheduling {next} (from {current}{})",
            if is_yielding { ", yielding" } else { "" }
        );

        if next != current {
            state.scheduled = Some(next);

            // A completing operation hands the token over and lets its
            // thread exit; everything else pauses for its next turn.
            if state.ops[current.index()].status().is_terminal() {
                self.cond.notify_all();
                return;
            }

            if self.pause_locked(&mut state, current) {
                drop(state);
                error::raise_execution_canceled();
            }
        }
    }

    /// Iterate operations in ascending id order, re-enabling any whose
    /// dependencies are now satisfied, then ask the strategy to pick one.
    ///
    /// When nothing is enabled but delay operations exist, virtual time
    /// fast-forwards to the earliest expiry. When nothing is enabled and
    /// relaxed mode is on, sleep on the sync object and retry a bounded
    /// number of times in case an uncontrolled dependency completes.
    fn try_get_next_enabled(
        &self,
        state: &mut MutexGuard<'_, SchedulerState>,
        current: OperationId,
        is_yielding: bool,
    ) -> Option<OperationId> {
        let mut retries = 0;

        loop {
            let inner = &mut **state;
            for (_, op) in inner.ops.iter_mut() {
                op.try_enable();
            }

            let enabled: Vec<OperationId> = inner
                .ops
                .iter()
                .filter(|(_, op)| op.status() == OperationStatus::Enabled)
                .map(|(_, op)| op.id)
                .collect();

            if enabled.is_empty() {
                // Nothing runnable: advance virtual time if some operation
                // is merely delayed.
                let min_delay = inner
                    .ops
                    .iter()
                    .filter(|(_, op)| op.status() == OperationStatus::Delayed)
                    .map(|(_, op)| op.remaining_delay())
                    .min();

                if let Some(units) = min_delay {
                    for (_, op) in inner.ops.iter_mut() {
                        op.advance_delay(units);
                    }
                    continue;
                }
            } else {
                let strategy = inner.strategy.as_mut().expect("strategy is installed");
                if let Some(next) = strategy.next_operation(&enabled, current, is_yielding) {
                    return Some(next);
                }
            }

            let has_uncontrolled = inner
                .ops
                .iter()
                .any(|(_, op)| op.is_blocked_on_uncontrolled_dependency());

            if self.config.relaxed_controlled_testing
                && has_uncontrolled
                && retries < self.config.relaxed_retry_limit
            {
                retries += 1;
                tracing::debug!(
                    target: "weft_runtime::scheduler",
                    "waiting out an uncontrolled dependency (retry {retries})"
                );
                let _ = self
                    .cond
                    .wait_for(state, self.config.relaxed_retry_delay);
                continue;
            }

            return None;
        }
    }

    /// The strategy has nothing left to schedule: either every operation
    /// completed (the schedule is fully explored) or the live ones are all
    /// blocked, which is a deadlock.
    fn finish_exhausted(&self, mut state: MutexGuard<'_, SchedulerState>, current: OperationId) {
        // A leftover enabled operation means the strategy stopped on its own
        // (an exhausted replay trace); that is completion, not deadlock.
        let has_enabled = state
            .ops
            .iter()
            .any(|(_, op)| op.status() == OperationStatus::Enabled);

        let blocked: Vec<String> = state
            .ops
            .iter()
            .filter(|(_, op)| op.status().is_blocked())
            .filter(|(_, op)| {
                !(self.config.relaxed_controlled_testing
                    && op.is_blocked_on_uncontrolled_dependency())
            })
            .map(|(_, op)| {
                let awaited = op.awaited_events().len();
                if awaited > 0 {
                    format!(
                        "{} '{}' is {} (awaiting {awaited} event type(s))",
                        op.id,
                        op.name,
                        op.status()
                    )
                } else {
                    format!("{} '{}' is {}", op.id, op.name, op.status())
                }
            })
            .collect();

        if !has_enabled && !blocked.is_empty() {
            let live = !state.ops[current.index()].status().is_terminal();
            drop(state);
            self.notify_assertion_failure(
                BugKind::Deadlock,
                format!("deadlock detected: {}", blocked.join(", ")),
            );
            if live {
                error::raise_execution_canceled();
            }
            return;
        }

        tracing::debug!(
            target: "weft_runtime::scheduler",
            "schedule fully explored after {} decisions",
            state.trace.len()
        );

        self.detach_locked(&mut state);
        let live = !state.ops[current.index()].status().is_terminal();
        drop(state);
        if live {
            error::raise_execution_canceled();
        }
    }

    /// Wait until `op` holds the virtual CPU again. Returns true when the
    /// scheduler detached instead, in which case the caller must raise the
    /// execution-canceled signal to force-terminate the operation.
    fn pause_locked(&self, state: &mut MutexGuard<'_, SchedulerState>, op: OperationId) -> bool {
        self.cond.notify_all();
        while state.scheduled != Some(op) && state.attached {
            self.cond.wait(state);
        }

        !state.attached
    }

    /// A nondeterministic boolean, true with probability `1/max`.
    pub fn next_boolean(&self, current: OperationId, max: u64) -> bool {
        let mut state = self.state.lock();
        self.check_attached(&mut state, current);

        let strategy = state.strategy.as_mut().expect("strategy is installed");
        let Some(value) = strategy.next_boolean_choice(max) else {
            self.stop_without_choice(state, current);
        };

        state.trace.push_boolean(value);
        tracing::debug!(
            target: "weft_runtime::scheduler",
            "random-choice: {current} drew boolean {value}"
        );
        value
    }

    /// A nondeterministic integer in `[0, max)`.
    pub fn next_integer(&self, current: OperationId, max: u64) -> u64 {
        let mut state = self.state.lock();
        self.check_attached(&mut state, current);

        let strategy = state.strategy.as_mut().expect("strategy is installed");
        let Some(value) = strategy.next_integer_choice(max) else {
            self.stop_without_choice(state, current);
        };

        state.trace.push_integer(value);
        tracing::debug!(
            target: "weft_runtime::scheduler",
            "random-choice: {current} drew integer {value}"
        );
        value
    }

    /// Turn the current operation into a delay operation for a
    /// strategy-chosen number of virtual units, then yield. In fuzzing mode
    /// the delay also sleeps for real.
    pub fn delay_operation(&self, current: OperationId) {
        let units = {
            let mut state = self.state.lock();
            self.check_attached(&mut state, current);

            let strategy = state.strategy.as_mut().expect("strategy is installed");
            let Some(units) = strategy.next_delay(self.config.max_delay_units) else {
                self.stop_without_choice(state, current);
            };

            state.trace.push_integer(units);
            state.ops[current.index()].delay(units);
            units
        };

        if self.config.fuzzing && units > 0 {
            std::thread::sleep(std::time::Duration::from_millis(units));
        }

        self.schedule_next(current, false);
    }

    /// The strategy could not produce a choice (a replay ran out of trace,
    /// or diverged). End the iteration without a bug.
    fn stop_without_choice(
        &self,
        mut state: MutexGuard<'_, SchedulerState>,
        _current: OperationId,
    ) -> ! {
        tracing::debug!(
            target: "weft_runtime::scheduler",
            "strategy produced no choice, stopping this iteration"
        );
        self.detach_locked(&mut state);
        drop(state);
        error::raise_execution_canceled();
    }

    fn check_attached(&self, state: &mut MutexGuard<'_, SchedulerState>, current: OperationId) {
        if !state.attached {
            let live = !state.ops[current.index()].status().is_terminal();
            if live {
                error::raise_execution_canceled();
            }
        }

        debug_assert_eq!(state.scheduled, Some(current));
    }

    // Operation-level blocking primitives, routed through the sync object.

    pub fn block_until_task_completes(&self, current: OperationId, dep: TaskDep) {
        let mut state = self.state.lock();
        state.ops[current.index()].block_until_task_completes(dep);
    }

    pub fn block_until_tasks_complete(
        &self,
        current: OperationId,
        deps: Vec<TaskDep>,
        wait_all: bool,
    ) {
        let mut state = self.state.lock();
        state.ops[current.index()].block_until_tasks_complete(deps, wait_all);
    }

    pub fn wait_event(
        &self,
        current: OperationId,
        event_types: impl IntoIterator<Item = std::any::TypeId>,
    ) {
        let mut state = self.state.lock();
        state.ops[current.index()].wait_event(event_types);
    }

    /// The queue delivered an awaited event: make the receiver runnable
    /// again.
    pub fn on_received_event(&self, op: OperationId) {
        let mut state = self.state.lock();
        state.ops[op.index()].on_received_event();
    }

    /// Consume the flag suppressing the next receive scheduling point.
    pub fn take_suppress_receive_point(&self, op: OperationId) -> bool {
        let mut state = self.state.lock();
        let operation = &mut state.ops[op.index()];
        std::mem::take(&mut operation.suppress_next_receive_point)
    }

    /// Mark an operation completed. The caller must follow up with
    /// [`schedule_next`](Self::schedule_next) to hand the token over.
    pub fn on_completed(&self, op: OperationId, failure: Option<String>) {
        let mut state = self.state.lock();
        let operation = &mut state.ops[op.index()];
        operation.failure = failure;
        if let Some(failure) = &operation.failure {
            tracing::debug!(
                target: "weft_runtime::scheduler",
                "{} '{}' completed with a captured failure: {failure}",
                operation.id,
                operation.name
            );
        }
        operation.on_completed();
    }

    /// Block `current` on a user-visible synchronization primitive.
    pub fn block_on_resource(&self, current: OperationId) {
        let mut state = self.state.lock();
        state.ops[current.index()].block_on_resource();
    }

    /// A user-visible synchronization primitive became available for `op`.
    pub fn signal_resource(&self, op: OperationId) {
        let mut state = self.state.lock();
        state.ops[op.index()].signal_resource();
    }

    /// Record a bug (first one wins), invoke the failure callback, and
    /// detach. Returns whether this call recorded the bug.
    pub fn notify_assertion_failure(&self, kind: BugKind, message: String) -> bool {
        let mut state = self.state.lock();
        if state.bug.is_some() || state.invalid.is_some() || !state.attached {
            // Only the first failure per iteration is reported; anything
            // later happens during teardown and is suppressed.
            return false;
        }

        let strategy = state
            .strategy
            .as_ref()
            .map(|s| s.description())
            .unwrap_or_default();
        let report = BugReport {
            kind,
            message,
            trace: state.trace.serialize(),
            strategy,
            seed: self.config.seed,
            iteration: self.iteration,
        };

        tracing::error!(
            target: "weft_runtime::scheduler",
            "assert-failure: {report}"
        );
        state.bug = Some(report.clone());
        drop(state);

        if let Some(callback) = &*self.on_failure.lock() {
            callback(&report);
        }

        let mut state = self.state.lock();
        self.detach_locked(&mut state);
        true
    }

    /// Record a bug and unwind the calling operation.
    pub fn fail(&self, kind: BugKind, message: String) -> ! {
        self.notify_assertion_failure(kind, message);
        error::raise_execution_canceled()
    }

    /// An operation reached a scheduling point without being registered.
    /// The iteration is invalid; this is loud and immediate.
    pub fn handle_uncontrolled_task(&self, thread: String) -> ! {
        let violation = crate::error::UncontrolledTaskError { thread };
        let message = violation.to_string();

        let mut state = self.state.lock();
        if state.invalid.is_none() {
            tracing::error!(target: "weft_runtime::scheduler", "{message}");
            state.invalid = Some(message.clone());
        }
        self.detach_locked(&mut state);
        drop(state);

        panic!("{message}");
    }

    /// One-way transition from running to terminated, used for bugs and
    /// completion alike.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        self.detach_locked(&mut state);
    }

    fn detach_locked(&self, state: &mut MutexGuard<'_, SchedulerState>) {
        if !state.attached && state.done {
            return;
        }

        state.attached = false;
        state.done = true;
        for (_, op) in state.ops.iter_mut() {
            op.on_canceled();
        }

        self.cond.notify_all();
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// Block until the iteration has fully finished.
    pub fn wait_iteration_complete(&self) {
        let mut state = self.state.lock();
        while !state.done && !state.ops.is_empty() {
            self.cond.wait(&mut state);
        }
    }

    pub fn scheduled_steps(&self) -> u64 {
        let state = self.state.lock();
        state
            .strategy
            .as_ref()
            .map(|s| s.scheduled_steps())
            .unwrap_or(0)
    }

    pub fn bug(&self) -> Option<BugReport> {
        self.state.lock().bug.clone()
    }

    pub fn invalid_reason(&self) -> Option<String> {
        self.state.lock().invalid.clone()
    }

    /// Take the strategy back at iteration end so it can carry its state
    /// into the next iteration.
    pub fn reclaim_strategy(&self) -> SchedulingStrategy {
        let mut state = self.state.lock();
        state.strategy.take().expect("strategy is installed")
    }

    /// Snapshot of each operation's id, name, and status, for logs and
    /// assertions.
    pub fn operation_statuses(&self) -> Vec<(OperationId, String, OperationStatus)> {
        let state = self.state.lock();
        state
            .ops
            .iter()
            .map(|(_, op)| (op.id, op.name.clone(), op.status()))
            .collect()
    }
}

fn hash_program_state(ops: &Slab<Operation>) -> u64 {
    let mut hasher = Sha256::new();
    for (_, op) in ops.iter() {
        hasher.update(op.id.get().to_le_bytes());
        hasher.update([status_code(op.status())]);
        hasher.update(op.remaining_delay().to_le_bytes());
    }

    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn status_code(status: OperationStatus) -> u8 {
    use crate::operation::BlockReason;

    match status {
        OperationStatus::Registered => 0,
        OperationStatus::Enabled => 1,
        OperationStatus::Delayed => 2,
        OperationStatus::Blocked(BlockReason::WaitAll) => 3,
        OperationStatus::Blocked(BlockReason::WaitAny) => 4,
        OperationStatus::Blocked(BlockReason::Receive) => 5,
        OperationStatus::Blocked(BlockReason::Resource) => 6,
        OperationStatus::Completed => 7,
        OperationStatus::Canceled => 8,
    }
}
