use std::any::TypeId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::actor::event::{DefaultEvent, EventEnvelope};
use crate::actor::Event;

/// Predicate attached to a receive wait: the event must satisfy it to
/// complete the receive.
pub type ReceivePredicate = Box<dyn Fn(&dyn Event) -> bool + Send>;

/// Snapshot of the owning actor's current capabilities, kept in sync by the
/// handler driver after every state change. Senders consult it during
/// enqueue without touching the actor's behavior.
#[derive(Debug, Default)]
pub struct ActorCaps {
    pub deferred: HashSet<TypeId>,
    pub ignored: HashSet<TypeId>,
    pub has_default_handler: bool,
    pub state: String,
}

impl ActorCaps {
    pub fn is_deferred(&self, event: TypeId) -> bool {
        self.deferred.contains(&event)
    }

    pub fn is_ignored(&self, event: TypeId) -> bool {
        self.ignored.contains(&event)
    }
}

/// What an enqueue did, from the sender's point of view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnqueueVerdict {
    /// The queue is closed (the actor halted); the event was discarded.
    Dropped,
    /// A handler is already running (or was unblocked by this event); the
    /// sender has nothing further to do.
    EventHandlerRunning,
    /// No handler was running and this event is deliverable: the sender is
    /// responsible for starting the handler turn.
    EventHandlerNotRunning,
    /// No handler is running, but nothing in the queue is deliverable in
    /// the actor's current state.
    NextEventUnavailable,
}

/// What a dequeue produced, from the handler's point of view.
#[derive(Debug)]
pub enum DequeueVerdict {
    /// The raised event jumped the queue.
    Raised(EventEnvelope),
    /// A queued event.
    Success(EventEnvelope),
    /// Nothing deliverable, but the current state has a default handler.
    Default(EventEnvelope),
    /// Nothing deliverable; the handler turn is over.
    NotAvailable,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<EventEnvelope>,
    raised: Option<EventEnvelope>,
    wait_set: HashMap<TypeId, Option<ReceivePredicate>>,
    /// The event that completed the pending receive, if any. At most one
    /// receive is pending per actor at a time.
    receive_slot: Option<EventEnvelope>,
    handler_running: bool,
    closed: bool,
}

/// Per-actor FIFO with defer/ignore/wait semantics; the sole communication
/// primitive between actors.
pub struct EventQueue {
    inner: Mutex<Inner>,
}

impl EventQueue {
    /// A new queue. `handler_running` starts true because the creation turn
    /// is about to run; sends observed before it must not start a second
    /// handler.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                handler_running: true,
                ..Inner::default()
            }),
        }
    }

    /// Enqueue an event. Returns the verdict plus whether this event
    /// completed a pending receive (in which case the caller wakes the
    /// receiver's operation).
    ///
    /// An event carrying an assert limit fails with a message when the
    /// queue now holds more events of its type than the limit allows.
    pub fn enqueue(
        &self,
        envelope: EventEnvelope,
        caps: &ActorCaps,
    ) -> Result<(EnqueueVerdict, bool), String> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Ok((EnqueueVerdict::Dropped, false));
        }

        // A matching pending receive consumes the event directly, skipping
        // the FIFO.
        let event_type = envelope.type_id();
        let completes_receive = match inner.wait_set.get(&event_type) {
            Some(Some(predicate)) => predicate(&*envelope.event),
            Some(None) => true,
            None => false,
        };

        if completes_receive {
            inner.wait_set.clear();
            debug_assert!(inner.receive_slot.is_none());
            inner.receive_slot = Some(envelope);
            return Ok((EnqueueVerdict::EventHandlerRunning, true));
        }

        if let Some(limit) = envelope.info.assert_limit {
            let count = 1 + inner
                .queue
                .iter()
                .filter(|queued| queued.type_id() == event_type)
                .count();
            if count > limit {
                return Err(format!(
                    "there are {count} events of type {} in the queue, exceeding the limit of \
                     {limit}",
                    envelope.type_name()
                ));
            }
        }

        inner.queue.push_back(envelope);

        if !inner.handler_running {
            if self.has_deliverable(&inner, caps) {
                inner.handler_running = true;
                return Ok((EnqueueVerdict::EventHandlerNotRunning, false));
            }

            return Ok((EnqueueVerdict::NextEventUnavailable, false));
        }

        Ok((EnqueueVerdict::EventHandlerRunning, false))
    }

    /// Check-only dequeue: would a dequeue in this state produce work?
    fn has_deliverable(&self, inner: &Inner, caps: &ActorCaps) -> bool {
        if let Some(raised) = &inner.raised {
            if !caps.is_ignored(raised.type_id()) {
                return true;
            }
        }

        let deliverable = inner.queue.iter().any(|envelope| {
            let event_type = envelope.type_id();
            !caps.is_ignored(event_type) && !caps.is_deferred(event_type)
        });

        deliverable || caps.has_default_handler
    }

    /// Dequeue the next deliverable event for the handler loop.
    ///
    /// The raised event has priority. Ignored events are discarded on the
    /// way; deferred ones are skipped in place.
    pub fn dequeue(&self, caps: &ActorCaps) -> DequeueVerdict {
        let mut inner = self.inner.lock();

        if let Some(raised) = inner.raised.take() {
            if caps.is_ignored(raised.type_id()) {
                tracing::trace!(
                    target: "weft_runtime::actor",
                    "dropping raised {} ignored in state '{}'",
                    raised.type_name(),
                    caps.state
                );
            } else {
                return DequeueVerdict::Raised(raised);
            }
        }

        let mut index = 0;
        while index < inner.queue.len() {
            let event_type = inner.queue[index].type_id();
            if caps.is_ignored(event_type) {
                let dropped = inner.queue.remove(index).expect("index is in bounds");
                tracing::trace!(
                    target: "weft_runtime::actor",
                    "dropping {} ignored in state '{}'",
                    dropped.type_name(),
                    caps.state
                );
                continue;
            }

            if caps.is_deferred(event_type) {
                index += 1;
                continue;
            }

            let envelope = inner.queue.remove(index).expect("index is in bounds");
            return DequeueVerdict::Success(envelope);
        }

        if caps.has_default_handler {
            return DequeueVerdict::Default(EventEnvelope::new(Arc::new(DefaultEvent)));
        }

        inner.handler_running = false;
        DequeueVerdict::NotAvailable
    }

    /// Synchronous half of a receive: take the first queued event matching
    /// the wait map, or install the wait map and report that the caller
    /// must block.
    pub fn try_receive(
        &self,
        mut wait: HashMap<TypeId, Option<ReceivePredicate>>,
    ) -> Option<EventEnvelope> {
        let mut inner = self.inner.lock();

        let position = inner.queue.iter().position(|envelope| {
            match wait.get(&envelope.type_id()) {
                Some(Some(predicate)) => predicate(&*envelope.event),
                Some(None) => true,
                None => false,
            }
        });

        match position {
            Some(index) => inner.queue.remove(index),
            None => {
                debug_assert!(inner.receive_slot.is_none());
                wait.shrink_to_fit();
                inner.wait_set = wait;
                None
            }
        }
    }

    /// Take the event that completed the pending receive.
    pub fn take_receive_slot(&self) -> Option<EventEnvelope> {
        self.inner.lock().receive_slot.take()
    }

    /// Set the one-slot raised event. Raised events do not enter the FIFO
    /// and supersede the ongoing dequeue.
    pub fn raise(&self, envelope: EventEnvelope) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.raised.is_none(), "only one raised event at a time");
        inner.raised = Some(envelope);
    }

    /// Close the queue (the actor halted). Further enqueues are dropped;
    /// anything still buffered is returned so the runtime can log it.
    pub fn close(&self) -> Vec<EventEnvelope> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.handler_running = false;
        inner.wait_set.clear();
        let mut dropped: Vec<_> = inner.queue.drain(..).collect();
        dropped.extend(inner.raised.take());
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
