//! The per-iteration runtime: wraps user tasks and actor handler turns in
//! controlled operations and routes every scheduling point into the
//! scheduler.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::actor::{
    self, ActorBehavior, ActorCell, ActorId, EventEnvelope, EventInfo, ReceivePredicate,
    SimpleActor, StateMachine,
};
use crate::actor::{Actor, Event};
use crate::config::Config;
use crate::error::{self, BugKind};
use crate::monitor::{Monitor, SpecificationEngine};
use crate::operation::OperationId;
use crate::scheduler::OperationScheduler;
use crate::task::{TaskDep, TaskHandle};

thread_local! {
    static CURRENT_OP: Cell<Option<OperationId>> = const { Cell::new(None) };
    static CURRENT_RUNTIME: RefCell<Option<Arc<Runtime>>> = const { RefCell::new(None) };
    static IS_ROOT: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as the root (non-controlled) context for the
/// duration of an iteration; scheduling points called from it are no-ops
/// instead of uncontrolled-task errors.
pub(crate) struct RootGuard;

impl RootGuard {
    pub fn enter() -> Self {
        IS_ROOT.set(true);
        Self
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        IS_ROOT.set(false);
    }
}

pub struct Runtime {
    self_ref: Weak<Runtime>,
    scheduler: Arc<OperationScheduler>,
    specs: Arc<SpecificationEngine>,
    config: Arc<Config>,
    actors: Mutex<HashMap<ActorId, Arc<ActorCell>>>,
    next_actor: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub(crate) fn new(
        scheduler: Arc<OperationScheduler>,
        specs: Arc<SpecificationEngine>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            scheduler,
            specs,
            config,
            actors: Mutex::new(HashMap::new()),
            next_actor: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// The runtime of the current thread, when it is running controlled
    /// code.
    pub fn current() -> Option<Arc<Runtime>> {
        CURRENT_RUNTIME.with(|current| current.borrow().clone())
    }

    fn arc(&self) -> Arc<Runtime> {
        self.self_ref.upgrade().expect("runtime is alive")
    }

    pub(crate) fn scheduler(&self) -> &OperationScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The operation executing on this thread, if any.
    pub(crate) fn current_operation(&self) -> Option<OperationId> {
        CURRENT_OP.get()
    }

    /// The operation executing on this thread. Reaching a scheduling point
    /// from an unregistered, non-root thread is fatal.
    fn current_operation_checked(&self) -> OperationId {
        match CURRENT_OP.get() {
            Some(op) => op,
            None => {
                let thread = std::thread::current()
                    .name()
                    .unwrap_or("<unnamed>")
                    .to_string();
                self.scheduler.handle_uncontrolled_task(thread)
            }
        }
    }

    /// Expose a scheduling point: the strategy may switch to another
    /// operation here. A no-op in the root context.
    pub(crate) fn schedule_point(&self) {
        match CURRENT_OP.get() {
            Some(current) => self.scheduler.schedule_next(current, false),
            None if IS_ROOT.get() => {}
            None => {
                let _ = self.current_operation_checked();
            }
        }
    }

    /// Spawn a controlled task. The spawn handshake guarantees the task's
    /// operation is registered and started before this returns, and the
    /// spawn itself is a scheduling point.
    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&Runtime) -> T + Send + 'static,
    {
        self.spawn_named("task", f)
    }

    pub fn spawn_named<T, F>(&self, name: impl Into<String>, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&Runtime) -> T + Send + 'static,
    {
        let name = name.into();
        let op = self.scheduler.register(name.clone());
        let handle = TaskHandle::new(op);

        let runtime = self.arc();
        let frame_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name(format!("weft-{op}"))
            .spawn(move || operation_frame(runtime, op, frame_handle, f))
            .expect("failed to spawn an operation thread");

        self.threads.lock().push(thread);
        self.scheduler.wait_operation_start(op);
        self.schedule_point();

        handle
    }

    /// Controlled join: block until `handle`'s task completes, then take
    /// its result.
    pub fn join<T: Send + 'static>(&self, handle: &TaskHandle<T>) -> anyhow::Result<T> {
        let current = self.current_operation_checked();

        if handle.is_finished() {
            self.scheduler.schedule_next(current, false);
        } else {
            self.scheduler
                .block_until_task_completes(current, handle.dep());
            self.scheduler.schedule_next(current, false);
        }

        handle.take_result()
    }

    /// Block until every dependency finishes.
    pub fn wait_all(&self, deps: &[TaskDep]) {
        let current = self.current_operation_checked();

        if deps.iter().all(TaskDep::is_finished) {
            self.scheduler.schedule_next(current, false);
            return;
        }

        self.scheduler
            .block_until_tasks_complete(current, deps.to_vec(), true);
        self.scheduler.schedule_next(current, false);
    }

    /// Block until at least one dependency finishes; returns the index of a
    /// finished one.
    pub fn wait_any(&self, deps: &[TaskDep]) -> usize {
        let current = self.current_operation_checked();

        if !deps.iter().any(TaskDep::is_finished) {
            self.scheduler
                .block_until_tasks_complete(current, deps.to_vec(), false);
        }
        self.scheduler.schedule_next(current, false);

        deps.iter()
            .position(TaskDep::is_finished)
            .expect("a dependency finished before the wait resumed")
    }

    /// Yield the virtual CPU, hinting the strategy that the caller is
    /// giving way.
    pub fn yield_now(&self) {
        let current = self.current_operation_checked();
        self.scheduler.schedule_next(current, true);
    }

    /// An explicit scheduling point with no other effect.
    pub fn explore_context_switch(&self) {
        self.schedule_point();
    }

    /// Become a delay operation for a strategy-chosen stretch of virtual
    /// time.
    pub fn delay(&self) {
        let current = self.current_operation_checked();
        self.scheduler.delay_operation(current);
    }

    /// A controlled coin flip: true with probability 1/2.
    pub fn random_bool(&self) -> bool {
        self.random_bool_weighted(2)
    }

    /// A controlled boolean, true with probability `1/max`.
    pub fn random_bool_weighted(&self, max: u64) -> bool {
        let current = self.current_operation_checked();
        let value = self.scheduler.next_boolean(current, max);
        self.scheduler.schedule_next(current, false);
        value
    }

    /// A controlled integer in `[0, max)`.
    pub fn random_integer(&self, max: u64) -> u64 {
        let current = self.current_operation_checked();
        let value = self.scheduler.next_integer(current, max);
        self.scheduler.schedule_next(current, false);
        value
    }

    /// Assert a safety property; failure records a bug and tears the
    /// iteration down.
    pub fn assert(&self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.scheduler.fail(BugKind::Assertion, message.into());
        }
    }

    // Actors.

    /// Create a plain actor and run its start handler.
    pub fn create_actor<A: Actor>(&self, name: impl Into<String>, actor: A) -> ActorId {
        self.create_from_behavior(name.into(), Box::new(SimpleActor::new(actor)))
    }

    /// Create a state-machine actor; its initial state is entered on the
    /// creation turn.
    pub fn create_state_machine<B: Send + 'static>(
        &self,
        name: impl Into<String>,
        machine: StateMachine<B>,
    ) -> ActorId {
        self.create_from_behavior(name.into(), Box::new(machine))
    }

    fn create_from_behavior(&self, name: String, behavior: Box<dyn ActorBehavior>) -> ActorId {
        let id = ActorId::new(self.next_actor.fetch_add(1, Ordering::SeqCst));
        let cell = Arc::new(ActorCell::new(id, name, behavior));
        self.actors.lock().insert(id, cell.clone());

        tracing::info!(
            target: "weft_runtime::runtime",
            "created {} '{}'",
            cell.id,
            cell.name
        );

        self.start_handler_turn(&cell, true);
        self.schedule_point();
        id
    }

    /// Send an event to an actor's queue. This is a scheduling point, and
    /// it always happens before the target's dequeue of the event.
    pub fn send_event(&self, target: ActorId, event: impl Event) {
        self.send_event_with_info(target, event, EventInfo::default());
    }

    pub fn send_event_with_info(&self, target: ActorId, event: impl Event, info: EventInfo) {
        let envelope = EventEnvelope {
            event: Arc::new(event),
            group: self.current_operation().map(OperationId::get),
            info,
        };
        self.send_envelope(target, envelope);
    }

    pub(crate) fn send_envelope(&self, target: ActorId, envelope: EventEnvelope) {
        let event_name = envelope.type_name();
        let info = envelope.info;

        let cell = self.actors.lock().get(&target).cloned();
        let Some(cell) = cell else {
            self.scheduler.fail(
                BugKind::Assertion,
                format!("cannot send {event_name} to unknown {target}"),
            );
        };

        tracing::debug!(
            target: "weft_runtime::runtime",
            "sending {event_name} to {target}"
        );

        let result = {
            let caps = cell.caps.lock();
            cell.queue.enqueue(envelope, &caps)
        };

        match result {
            Err(message) => self.scheduler.fail(BugKind::Assertion, message),
            Ok((verdict, receive_completed)) => {
                if receive_completed {
                    let receiver = cell
                        .current_op
                        .lock()
                        .expect("a pending receive belongs to a running handler");
                    self.scheduler.on_received_event(receiver);
                }

                match verdict {
                    actor::EnqueueVerdict::Dropped => {
                        tracing::debug!(
                            target: "weft_runtime::runtime",
                            "halted {target} dropped {event_name}"
                        );
                        if info.must_handle {
                            self.scheduler.fail(
                                BugKind::Assertion,
                                format!(
                                    "halted {target} dropped must-handle event {event_name}"
                                ),
                            );
                        }
                    }
                    actor::EnqueueVerdict::EventHandlerNotRunning => {
                        self.start_handler_turn(&cell, false);
                    }
                    actor::EnqueueVerdict::EventHandlerRunning
                    | actor::EnqueueVerdict::NextEventUnavailable => {}
                }
            }
        }

        self.schedule_point();
    }

    /// Halt an actor from outside by sending the halt event.
    pub fn halt_actor(&self, target: ActorId) {
        self.send_event(target, actor::HaltEvent);
    }

    /// Block the current operation on a user-visible resource. `register`
    /// runs after the operation is known but before any scheduling point,
    /// so the registration cannot race with the matching signal.
    pub(crate) fn block_current_on_resource(&self, register: impl FnOnce(OperationId)) {
        let current = self.current_operation_checked();
        register(current);
        self.scheduler.block_on_resource(current);
        self.scheduler.schedule_next(current, false);
    }

    /// A resource a blocked operation was waiting on became available.
    pub(crate) fn signal_resource_waiter(&self, op: OperationId) {
        self.scheduler.signal_resource(op);
    }

    /// Number of events buffered in an actor's queue, for assertions in
    /// tests. `None` for unknown ids.
    pub fn actor_queue_len(&self, id: ActorId) -> Option<usize> {
        self.actors.lock().get(&id).map(|cell| cell.queue.len())
    }

    /// Whether an actor has halted. `None` for unknown ids.
    pub fn is_actor_halted(&self, id: ActorId) -> Option<bool> {
        self.actors.lock().get(&id).map(|cell| cell.is_halted())
    }

    /// Start one handler turn for `cell` as a fresh controlled operation.
    fn start_handler_turn(&self, cell: &Arc<ActorCell>, initial: bool) {
        let op = self.scheduler.register(cell.id.to_string());
        *cell.current_op.lock() = Some(op);

        let runtime = self.arc();
        let handle = TaskHandle::<()>::new(op);
        let turn_cell = cell.clone();
        let thread = std::thread::Builder::new()
            .name(format!("weft-{op}"))
            .spawn(move || {
                operation_frame(runtime, op, handle, move |rt: &Runtime| {
                    actor::run_handler_turn(rt, &turn_cell, initial);
                })
            })
            .expect("failed to spawn an operation thread");

        self.threads.lock().push(thread);
        self.scheduler.wait_operation_start(op);
    }

    /// Blocking receive used by actor handlers; see the event-queue
    /// contract for the matching rules.
    pub(crate) fn receive_on(
        &self,
        cell: &Arc<ActorCell>,
        wait: HashMap<TypeId, Option<ReceivePredicate>>,
    ) -> anyhow::Result<Arc<dyn Event>> {
        let current = self.current_operation_checked();

        // The wake-up from a completed receive already was a scheduling
        // point; do not schedule twice in a row.
        if self.scheduler.take_suppress_receive_point(current) {
            tracing::trace!(
                target: "weft_runtime::runtime",
                "{current} skipping the receive scheduling point"
            );
        } else {
            self.scheduler.schedule_next(current, false);
        }

        let awaited: Vec<TypeId> = wait.keys().copied().collect();
        if let Some(envelope) = cell.queue.try_receive(wait) {
            tracing::debug!(
                target: "weft_runtime::runtime",
                "{} received {} from its queue",
                cell.id,
                envelope.type_name()
            );
            return Ok(envelope.event);
        }

        tracing::debug!(
            target: "weft_runtime::runtime",
            "{} is waiting to receive",
            cell.id
        );
        self.scheduler.wait_event(current, awaited);
        self.scheduler.schedule_next(current, false);

        let envelope = cell
            .queue
            .take_receive_slot()
            .ok_or_else(|| anyhow::anyhow!("receive resumed without a completed event"))?;

        tracing::debug!(
            target: "weft_runtime::runtime",
            "{} received {}",
            cell.id,
            envelope.type_name()
        );
        Ok(envelope.event)
    }

    // Monitors.

    /// Register a specification monitor for this iteration. Duplicate
    /// registrations are no-ops.
    pub fn register_monitor<M: Monitor>(&self, monitor: M) -> bool {
        self.specs.register(monitor)
    }

    /// Deliver an event to the monitor of type `M`, synchronously inside
    /// the caller's scheduling step.
    pub fn monitor<M: Monitor>(&self, event: &dyn Event) {
        if let Err(message) = self.specs.invoke::<M>(event) {
            self.scheduler.fail(BugKind::Assertion, message);
        }
    }

    /// Join every operation thread spawned during this iteration. Called by
    /// the engine after the scheduler has finished.
    pub(crate) fn join_threads(&self) {
        loop {
            let handles: Vec<_> = {
                let mut threads = self.threads.lock();
                threads.drain(..).collect()
            };

            if handles.is_empty() {
                return;
            }

            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

/// The per-operation frame: sets the thread-local context, runs the body,
/// and classifies how it ended.
///
/// A controlled payload (the detach protocol) is acknowledged silently.
/// Anything else is an unhandled panic and surfaces as an assertion
/// failure.
fn operation_frame<T, F>(runtime: Arc<Runtime>, op: OperationId, handle: TaskHandle<T>, f: F)
where
    T: Send + 'static,
    F: FnOnce(&Runtime) -> T + Send + 'static,
{
    CURRENT_OP.set(Some(op));
    CURRENT_RUNTIME.with(|current| *current.borrow_mut() = Some(runtime.clone()));

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.scheduler.start(op);
        f(&runtime)
    }));

    match result {
        Ok(value) => {
            handle.complete(value);
            runtime.scheduler.on_completed(op, None);
            runtime.scheduler.schedule_next(op, false);
        }
        Err(payload) if error::is_controlled_payload(payload.as_ref()) => {
            handle.cancel();
        }
        Err(payload) => {
            let message = error::payload_message(payload.as_ref());
            handle.fail(message.clone());
            runtime.scheduler.on_completed(op, Some(message.clone()));
            runtime.scheduler.notify_assertion_failure(
                BugKind::UnhandledPanic,
                format!("unhandled panic in operation {op}: {message}"),
            );
        }
    }

    CURRENT_RUNTIME.with(|current| *current.borrow_mut() = None);
    CURRENT_OP.set(None);
}
