use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::actor::event::DefaultEvent;
use crate::actor::{
    ActorBehavior, ActorCaps, ActorContext, Event, HaltEvent, Transition,
};

pub type EntryAction<B> = fn(&mut B, &mut ActorContext<'_>) -> anyhow::Result<()>;
pub type ExitAction<B> = fn(&mut B, &mut ActorContext<'_>) -> anyhow::Result<()>;
pub type EventAction<B> =
    fn(&mut B, &mut ActorContext<'_>, &Arc<dyn Event>) -> anyhow::Result<()>;

/// How a state reacts to one event type.
pub enum EventHandlerDecl<B> {
    /// Run an action and stay in the current state (unless the action
    /// itself transitions).
    Action(EventAction<B>),
    /// Transition to another state.
    Goto(&'static str),
    /// Run an action, then transition.
    GotoWith(&'static str, EventAction<B>),
}

/// Declaration of one state: entry/exit handlers, per-event reactions, and
/// the deferred/ignored capability sets.
pub struct StateDecl<B> {
    name: &'static str,
    entry: Option<EntryAction<B>>,
    exit: Option<ExitAction<B>>,
    handlers: HashMap<TypeId, EventHandlerDecl<B>>,
    deferred: HashSet<TypeId>,
    ignored: HashSet<TypeId>,
    default: Option<EventAction<B>>,
}

impl<B> StateDecl<B> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entry: None,
            exit: None,
            handlers: HashMap::new(),
            deferred: HashSet::new(),
            ignored: HashSet::new(),
            default: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn on_entry(mut self, action: EntryAction<B>) -> Self {
        self.entry = Some(action);
        self
    }

    pub fn on_exit(mut self, action: ExitAction<B>) -> Self {
        self.exit = Some(action);
        self
    }

    /// Handle events of type `T` with `action`.
    pub fn on<T: Event>(mut self, action: EventAction<B>) -> Self {
        self.handlers
            .insert(TypeId::of::<T>(), EventHandlerDecl::Action(action));
        self
    }

    /// Transition to `target` on events of type `T`.
    pub fn on_goto<T: Event>(mut self, target: &'static str) -> Self {
        self.handlers
            .insert(TypeId::of::<T>(), EventHandlerDecl::Goto(target));
        self
    }

    /// Run `action`, then transition to `target`, on events of type `T`.
    pub fn on_goto_with<T: Event>(mut self, target: &'static str, action: EventAction<B>) -> Self {
        self.handlers
            .insert(TypeId::of::<T>(), EventHandlerDecl::GotoWith(target, action));
        self
    }

    /// Skip events of type `T` during dequeue while in this state; they
    /// stay queued for a later state.
    pub fn defer<T: Event>(mut self) -> Self {
        self.deferred.insert(TypeId::of::<T>());
        self
    }

    /// Discard events of type `T` outright while in this state.
    pub fn ignore<T: Event>(mut self) -> Self {
        self.ignored.insert(TypeId::of::<T>());
        self
    }

    /// Handle the synthesized default event when the queue has nothing else
    /// to offer in this state.
    pub fn on_default(mut self, action: EventAction<B>) -> Self {
        self.default = Some(action);
        self
    }
}

/// A state-machine actor: user behavior data plus a declarative state
/// table, driven by the runtime's handler loop.
///
/// The machine keeps a stack of entered states; the top of the stack is the
/// current state. Unhandled events pop the stack until some state handles
/// them; popping the last state without a handler is an assertion failure.
pub struct StateMachine<B: Send + 'static> {
    behavior: B,
    states: Vec<StateDecl<B>>,
    stack: Vec<usize>,
    initial: usize,
    halt: Option<ExitAction<B>>,
}

impl<B: Send + 'static> StateMachine<B> {
    pub fn new(behavior: B, initial: &'static str, states: Vec<StateDecl<B>>) -> Self {
        let index = states
            .iter()
            .position(|state| state.name == initial)
            .unwrap_or_else(|| panic!("initial state '{initial}' is not declared"));

        Self {
            behavior,
            states,
            stack: Vec::new(),
            initial: index,
            halt: None,
        }
    }

    /// Install a hook to run when the actor halts.
    pub fn with_halt_handler(mut self, action: ExitAction<B>) -> Self {
        self.halt = Some(action);
        self
    }

    fn current_index(&self) -> usize {
        self.stack.last().copied().unwrap_or(self.initial)
    }

    fn current(&self) -> &StateDecl<B> {
        &self.states[self.current_index()]
    }

    fn resolve(&self, name: &'static str) -> anyhow::Result<usize> {
        self.states
            .iter()
            .position(|state| state.name == name)
            .ok_or_else(|| anyhow::anyhow!("state '{name}' is not declared"))
    }

    fn enter(&mut self, index: usize, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        self.stack.push(index);
        tracing::debug!(
            target: "weft_runtime::actor",
            "{} entering state '{}'",
            ctx.id(),
            self.states[index].name
        );

        if let Some(entry) = self.states[index].entry {
            entry(&mut self.behavior, ctx)?;
        }

        Ok(())
    }

    fn exit_current(&mut self, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        let index = self.current_index();
        tracing::debug!(
            target: "weft_runtime::actor",
            "{} exiting state '{}'",
            ctx.id(),
            self.states[index].name
        );

        if let Some(exit) = self.states[index].exit {
            exit(&mut self.behavior, ctx)?;
        }

        Ok(())
    }

    /// Apply the transitions an action requested, running exit and entry
    /// handlers. Entry handlers may themselves request transitions, so this
    /// loops until quiescent.
    fn apply_transitions(&mut self, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        while let Some(transition) = ctx.take_transition() {
            match transition {
                Transition::Goto(target) => {
                    let target = self.resolve(target)?;
                    self.exit_current(ctx)?;
                    self.stack.clear();
                    self.enter(target, ctx)?;
                }
                Transition::Push(target) => {
                    let target = self.resolve(target)?;
                    self.enter(target, ctx)?;
                }
                Transition::Pop => {
                    self.exit_current(ctx)?;
                    self.stack.pop();
                    if self.stack.is_empty() {
                        anyhow::bail!("popped the last state off the stack");
                    }

                    // Re-enter the exposed state.
                    let exposed = self.current_index();
                    self.stack.pop();
                    self.enter(exposed, ctx)?;
                }
            }
        }

        Ok(())
    }
}

impl<B: Send + 'static> ActorBehavior for StateMachine<B> {
    fn on_start(&mut self, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        let initial = self.initial;
        self.enter(initial, ctx)?;
        self.apply_transitions(ctx)
    }

    fn on_event(
        &mut self,
        ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        let event_type = event.as_any().type_id();

        loop {
            let current = self.current_index();

            if let Some(decl) = self.states[current].handlers.get(&event_type) {
                match decl {
                    EventHandlerDecl::Action(action) => {
                        let action = *action;
                        action(&mut self.behavior, ctx, event)?;
                    }
                    EventHandlerDecl::Goto(target) => {
                        ctx.goto_state(*target);
                    }
                    EventHandlerDecl::GotoWith(target, action) => {
                        let (target, action) = (*target, *action);
                        action(&mut self.behavior, ctx, event)?;
                        ctx.goto_state(target);
                    }
                }

                return self.apply_transitions(ctx);
            }

            if event.is::<DefaultEvent>() {
                if let Some(action) = self.states[current].default {
                    action(&mut self.behavior, ctx, event)?;
                    return self.apply_transitions(ctx);
                }
            }

            // No handler in the current state: pop and retry in the exposed
            // state. Running out of states for a non-benign event is a bug
            // in the machine.
            if self.stack.len() > 1 {
                self.exit_current(ctx)?;
                self.stack.pop();
                continue;
            }

            if event.is::<HaltEvent>() || event.is::<DefaultEvent>() {
                return Ok(());
            }

            anyhow::bail!(
                "event {} is not handled in state '{}'",
                event.type_name(),
                self.states[current].name
            );
        }
    }

    fn on_halt(&mut self, ctx: &mut ActorContext<'_>) {
        if let Some(halt) = self.halt {
            if let Err(error) = halt(&mut self.behavior, ctx) {
                tracing::warn!(
                    target: "weft_runtime::actor",
                    "{}: halt handler failed: {error:#}",
                    ctx.id()
                );
            }
        }
    }

    fn capabilities(&self) -> ActorCaps {
        let current = self.current();
        ActorCaps {
            deferred: current.deferred.clone(),
            ignored: current.ignored.clone(),
            has_default_handler: current.default.is_some(),
            state: current.name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Tick;
    crate::event!(Tick);

    #[test]
    fn capabilities_reflect_the_declared_state() {
        let machine = StateMachine::new(
            (),
            "busy",
            vec![
                StateDecl::new("busy").defer::<Tick>().on_default(|_, _, _| Ok(())),
                StateDecl::new("idle").ignore::<Tick>(),
            ],
        );

        let caps = machine.capabilities();
        assert_eq!(caps.state, "busy");
        assert!(caps.is_deferred(TypeId::of::<Tick>()));
        assert!(!caps.is_ignored(TypeId::of::<Tick>()));
        assert!(caps.has_default_handler);
    }

    #[test]
    #[should_panic(expected = "initial state 'missing' is not declared")]
    fn unknown_initial_state_panics() {
        let _ = StateMachine::new((), "missing", vec![StateDecl::<()>::new("only")]);
    }
}
