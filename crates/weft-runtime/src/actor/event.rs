use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A message exchanged between actors (or delivered to a monitor).
///
/// Implement with the [`event!`](crate::event) macro:
///
/// ```
/// #[derive(Debug)]
/// struct Ping;
/// weft_runtime::event!(Ping);
/// ```
pub trait Event: Send + Sync + fmt::Debug + 'static {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
}

impl dyn Event {
    pub fn is<T: Event>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Implement [`Event`] for one or more concrete types.
#[macro_export]
macro_rules! event {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::actor::Event for $ty {
            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn type_name(&self) -> &'static str {
                ::std::any::type_name::<$ty>()
            }
        }
    )+};
}

/// Built-in event that halts the receiving actor.
#[derive(Clone, Copy, Debug, Default)]
pub struct HaltEvent;

event!(HaltEvent);

/// Built-in event synthesized when a state declares a default handler and
/// the queue has nothing else to offer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultEvent;

event!(DefaultEvent);

/// Delivery metadata attached to a sent event.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventInfo {
    /// Assert that the target queue holds at most this many events of this
    /// type (counted after the enqueue).
    pub assert_limit: Option<usize>,

    /// Dropping this event (for example because the target halted) is an
    /// assertion failure rather than a silent drop.
    pub must_handle: bool,
}

/// An event queued for delivery: the event itself, the sender's operation
/// group, and delivery metadata.
#[derive(Clone)]
pub struct EventEnvelope {
    pub event: Arc<dyn Event>,
    pub group: Option<u64>,
    pub info: EventInfo,
}

impl EventEnvelope {
    pub fn new(event: Arc<dyn Event>) -> Self {
        Self {
            event,
            group: None,
            info: EventInfo::default(),
        }
    }

    pub fn with_info(event: Arc<dyn Event>, info: EventInfo) -> Self {
        Self {
            event,
            group: None,
            info,
        }
    }

    /// The concrete type of the carried event.
    pub fn type_id(&self) -> TypeId {
        self.event.as_any().type_id()
    }

    pub fn type_name(&self) -> &'static str {
        self.event.type_name()
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("event", &self.event)
            .field("group", &self.group)
            .field("info", &self.info)
            .finish()
    }
}
