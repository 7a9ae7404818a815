//! Actors: event-driven units of work whose handler turns run as controlled
//! operations, communicating only through per-actor event queues.

mod event;
mod event_queue;
mod state_machine;

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub use self::event::{DefaultEvent, Event, EventEnvelope, EventInfo, HaltEvent};
pub use self::event_queue::{
    ActorCaps, DequeueVerdict, EnqueueVerdict, EventQueue, ReceivePredicate,
};
pub use self::state_machine::{
    EntryAction, EventAction, EventHandlerDecl, ExitAction, StateDecl, StateMachine,
};
use crate::error::BugKind;
use crate::monitor::Monitor;
use crate::operation::OperationId;
use crate::runtime::Runtime;

/// Identifier of an actor, unique within one iteration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActorId(u64);

impl ActorId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor({})", self.0)
    }
}

/// A plain actor: one handler for every event, no states.
///
/// For defer/ignore/default-handler semantics and state transitions, use
/// [`StateMachine`] instead.
pub trait Actor: Send + 'static {
    /// Called once when the actor is created, before any event is handled.
    fn on_start(&mut self, _ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_event(
        &mut self,
        ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()>;

    /// Called when the actor halts, before its queue closes.
    fn on_halt(&mut self, _ctx: &mut ActorContext<'_>) {}
}

/// Driver-facing behavior contract: what the handler loop needs from an
/// actor, whether it is a plain actor or a state machine.
pub(crate) trait ActorBehavior: Send {
    fn on_start(&mut self, ctx: &mut ActorContext<'_>) -> anyhow::Result<()>;

    fn on_event(
        &mut self,
        ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()>;

    fn on_halt(&mut self, ctx: &mut ActorContext<'_>);

    /// The current state's capability snapshot, mirrored into the cell for
    /// senders to consult.
    fn capabilities(&self) -> ActorCaps;
}

pub(crate) struct SimpleActor<A: Actor> {
    actor: A,
}

impl<A: Actor> SimpleActor<A> {
    pub fn new(actor: A) -> Self {
        Self { actor }
    }
}

impl<A: Actor> ActorBehavior for SimpleActor<A> {
    fn on_start(&mut self, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        self.actor.on_start(ctx)?;
        ensure_no_transition(ctx)
    }

    fn on_event(
        &mut self,
        ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        self.actor.on_event(ctx, event)?;
        ensure_no_transition(ctx)
    }

    fn on_halt(&mut self, ctx: &mut ActorContext<'_>) {
        self.actor.on_halt(ctx);
    }

    fn capabilities(&self) -> ActorCaps {
        ActorCaps {
            state: "default".to_string(),
            ..ActorCaps::default()
        }
    }
}

fn ensure_no_transition(ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
    if ctx.take_transition().is_some() {
        anyhow::bail!("state transitions require a state-machine actor");
    }

    Ok(())
}

/// Per-actor runtime state: the queue, the capability mirror, the behavior,
/// and the operation of the currently-running handler turn (if any).
pub(crate) struct ActorCell {
    pub id: ActorId,
    pub name: String,
    pub queue: EventQueue,
    pub caps: Mutex<ActorCaps>,
    pub behavior: Mutex<Box<dyn ActorBehavior>>,
    pub current_op: Mutex<Option<OperationId>>,
    pub halted: AtomicBool,
}

impl ActorCell {
    pub fn new(id: ActorId, name: String, behavior: Box<dyn ActorBehavior>) -> Self {
        let caps = behavior.capabilities();
        Self {
            id,
            name,
            queue: EventQueue::new(),
            caps: Mutex::new(caps),
            behavior: Mutex::new(behavior),
            current_op: Mutex::new(None),
            halted: AtomicBool::new(false),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

/// Context handed to actor code while it handles an event.
pub struct ActorContext<'a> {
    runtime: &'a Runtime,
    cell: &'a Arc<ActorCell>,
    pub(crate) transition: Option<Transition>,
    pub(crate) halt_requested: bool,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Transition {
    Goto(&'static str),
    Push(&'static str),
    Pop,
}

impl<'a> ActorContext<'a> {
    pub(crate) fn new(runtime: &'a Runtime, cell: &'a Arc<ActorCell>) -> Self {
        Self {
            runtime,
            cell,
            transition: None,
            halt_requested: false,
        }
    }

    /// This actor's id.
    pub fn id(&self) -> ActorId {
        self.cell.id
    }

    /// The runtime, for spawning tasks, random choices, or creating actors
    /// from inside a handler.
    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    pub fn send(&self, target: ActorId, event: impl Event) {
        self.runtime.send_event(target, event);
    }

    pub fn send_with_info(&self, target: ActorId, event: impl Event, info: EventInfo) {
        self.runtime.send_event_with_info(target, event, info);
    }

    /// Put `event` in this actor's one-slot raised position. It supersedes
    /// everything in the FIFO at the next dequeue.
    pub fn raise(&self, event: impl Event) {
        let envelope = EventEnvelope {
            event: Arc::new(event),
            group: self.runtime.current_operation().map(OperationId::get),
            info: EventInfo::default(),
        };

        tracing::debug!(
            target: "weft_runtime::actor",
            "{} raised {}",
            self.cell.id,
            envelope.type_name()
        );
        self.cell.queue.raise(envelope);
    }

    /// Wait until this actor receives an event of type `T`, blocking the
    /// current handler turn. Events of other types keep queueing behind it.
    pub fn receive<T: Event>(&mut self) -> anyhow::Result<Arc<dyn Event>> {
        let mut wait: HashMap<TypeId, Option<ReceivePredicate>> = HashMap::new();
        wait.insert(TypeId::of::<T>(), None);
        self.runtime.receive_on(self.cell, wait)
    }

    /// Like [`receive`](Self::receive), but the event must also satisfy the
    /// predicate.
    pub fn receive_where<T: Event>(
        &mut self,
        predicate: impl Fn(&T) -> bool + Send + 'static,
    ) -> anyhow::Result<Arc<dyn Event>> {
        let mut wait: HashMap<TypeId, Option<ReceivePredicate>> = HashMap::new();
        wait.insert(
            TypeId::of::<T>(),
            Some(Box::new(move |event: &dyn Event| {
                event.downcast_ref::<T>().is_some_and(&predicate)
            })),
        );
        self.runtime.receive_on(self.cell, wait)
    }

    /// Wait for the first event whose type is any of `types`.
    pub fn receive_any(&mut self, types: &[TypeId]) -> anyhow::Result<Arc<dyn Event>> {
        let wait: HashMap<TypeId, Option<ReceivePredicate>> =
            types.iter().map(|&t| (t, None)).collect();
        self.runtime.receive_on(self.cell, wait)
    }

    /// Transition to `target`: pops the state stack to the bottom, runs the
    /// exit handler of the source and the entry handler of the target.
    pub fn goto_state(&mut self, target: &'static str) {
        self.set_transition(Transition::Goto(target));
    }

    /// Push `target` on the state stack and enter it.
    pub fn push_state(&mut self, target: &'static str) {
        self.set_transition(Transition::Push(target));
    }

    /// Pop the current state and re-enter the exposed one.
    pub fn pop_state(&mut self) {
        self.set_transition(Transition::Pop);
    }

    fn set_transition(&mut self, transition: Transition) {
        if let Some(previous) = self.transition.replace(transition) {
            tracing::warn!(
                target: "weft_runtime::actor",
                "{}: transition {previous:?} overridden by {transition:?} in the same action",
                self.cell.id
            );
        }
    }

    pub(crate) fn take_transition(&mut self) -> Option<Transition> {
        self.transition.take()
    }

    /// Halt this actor once the current action returns.
    pub fn halt(&mut self) {
        self.halt_requested = true;
    }

    pub fn assert(&self, condition: bool, message: impl Into<String>) {
        self.runtime.assert(condition, message);
    }

    pub fn random_bool(&self) -> bool {
        self.runtime.random_bool()
    }

    pub fn random_integer(&self, max: u64) -> u64 {
        self.runtime.random_integer(max)
    }

    /// Deliver an event to the monitor of type `M`.
    pub fn monitor<M: Monitor>(&self, event: &dyn Event) {
        self.runtime.monitor::<M>(event);
    }
}

enum Flow {
    Continue,
    Halt,
}

/// Run one handler turn: dequeue deliverable events and dispatch them until
/// the queue has nothing left, exposing a scheduling point between actions.
pub(crate) fn run_handler_turn(runtime: &Runtime, cell: &Arc<ActorCell>, initial: bool) {
    if initial {
        match dispatch(runtime, cell, None) {
            Flow::Halt => {
                halt_actor(runtime, cell);
                *cell.current_op.lock() = None;
                return;
            }
            Flow::Continue => {}
        }

        runtime.schedule_point();
    }

    loop {
        let verdict = {
            let caps = cell.caps.lock();
            cell.queue.dequeue(&caps)
        };

        let (kind, envelope) = match verdict {
            DequeueVerdict::NotAvailable => break,
            DequeueVerdict::Raised(envelope) => ("raised", envelope),
            DequeueVerdict::Success(envelope) => ("queued", envelope),
            DequeueVerdict::Default(envelope) => ("default", envelope),
        };

        tracing::debug!(
            target: "weft_runtime::actor",
            "{} dequeued {} {}",
            cell.id,
            kind,
            envelope.type_name()
        );

        match dispatch(runtime, cell, Some(&envelope)) {
            Flow::Halt => {
                halt_actor(runtime, cell);
                break;
            }
            Flow::Continue => {}
        }

        runtime.schedule_point();
    }

    *cell.current_op.lock() = None;
}

/// Dispatch one dequeued event (or the start-of-life call when `envelope`
/// is `None`) into the actor's behavior and mirror the resulting
/// capabilities.
fn dispatch(runtime: &Runtime, cell: &Arc<ActorCell>, envelope: Option<&EventEnvelope>) -> Flow {
    if let Some(envelope) = envelope {
        if envelope.event.is::<HaltEvent>() {
            return Flow::Halt;
        }
    }

    let mut ctx = ActorContext::new(runtime, cell);
    let mut behavior = cell.behavior.lock();
    let result = match envelope {
        None => behavior.on_start(&mut ctx),
        Some(envelope) => behavior.on_event(&mut ctx, &envelope.event),
    };
    *cell.caps.lock() = behavior.capabilities();
    drop(behavior);

    match result {
        Ok(()) => {
            if ctx.halt_requested {
                Flow::Halt
            } else {
                Flow::Continue
            }
        }
        Err(error) => runtime.scheduler().fail(
            BugKind::UnhandledPanic,
            format!(
                "unhandled error in {} '{}': {error:#}",
                cell.id, cell.name
            ),
        ),
    }
}

/// Run the halt hook, close the queue, and report anything still buffered.
fn halt_actor(runtime: &Runtime, cell: &Arc<ActorCell>) {
    {
        let mut ctx = ActorContext::new(runtime, cell);
        let mut behavior = cell.behavior.lock();
        behavior.on_halt(&mut ctx);
    }

    cell.halted.store(true, Ordering::Release);
    let dropped = cell.queue.close();
    for envelope in &dropped {
        tracing::debug!(
            target: "weft_runtime::actor",
            "dropping {} still buffered when {} halted",
            envelope.type_name(),
            cell.id
        );
    }

    if let Some(envelope) = dropped.iter().find(|envelope| envelope.info.must_handle) {
        runtime.scheduler().fail(
            BugKind::Assertion,
            format!(
                "{} halted while holding must-handle event {}",
                cell.id,
                envelope.type_name()
            ),
        );
    }

    tracing::info!(
        target: "weft_runtime::actor",
        "{} '{}' halted",
        cell.id,
        cell.name
    );
}
