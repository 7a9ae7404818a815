//! Specification monitors: deterministic state machines that observe the
//! program under test and assert safety and liveness properties.

use std::any::TypeId;

use parking_lot::Mutex;

use crate::actor::Event;

/// Liveness classification of a monitor's current state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateStatus {
    /// A good state; being here resets the liveness temperature.
    Cold,
    /// Neither good nor bad; the temperature is left unchanged.
    Warm,
    /// A state the program must eventually leave; the temperature rises for
    /// every decision spent here.
    Hot,
}

/// Context handed to a monitor while it handles an event.
pub struct MonitorContext {
    failure: Option<String>,
}

impl MonitorContext {
    fn new() -> Self {
        Self { failure: None }
    }

    /// Assert a safety property. A failed assertion is funneled to the
    /// scheduler as a bug; only the first failure per delivery is kept.
    pub fn assert(&mut self, condition: bool, message: impl Into<String>) {
        if !condition && self.failure.is_none() {
            self.failure = Some(message.into());
        }
    }
}

/// A specification monitor.
///
/// Monitors keep their state-machine state internally and expose the pieces
/// the runtime consumes: the current state's name (for error messages) and
/// its hot/warm/cold classification (for liveness checking).
pub trait Monitor: Send + 'static {
    fn name(&self) -> &str;

    /// Name of the current state, used in bug messages.
    fn current_state(&self) -> &str;

    /// Liveness classification of the current state.
    fn status(&self) -> StateStatus;

    /// Deliver one event, synchronously, inside the calling operation's
    /// scheduling step.
    fn handle_event(&mut self, ctx: &mut MonitorContext, event: &dyn Event);
}

struct MonitorSlot {
    type_id: TypeId,
    temperature: u64,
    monitor: Box<dyn Monitor>,
}

/// Registry of the monitors of one iteration.
///
/// At most one monitor instance exists per monitor type; duplicate
/// registrations are no-ops.
pub struct SpecificationEngine {
    monitors: Mutex<Vec<MonitorSlot>>,
}

impl SpecificationEngine {
    pub fn new() -> Self {
        Self {
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Register a monitor instance. Returns false (and drops `monitor`) if a
    /// monitor of this type is already registered.
    pub fn register<M: Monitor>(&self, monitor: M) -> bool {
        let mut monitors = self.monitors.lock();
        let type_id = TypeId::of::<M>();
        if monitors.iter().any(|slot| slot.type_id == type_id) {
            return false;
        }

        tracing::debug!(
            target: "weft_runtime::monitor",
            "registered monitor '{}' in state '{}'",
            monitor.name(),
            monitor.current_state()
        );

        monitors.push(MonitorSlot {
            type_id,
            temperature: 0,
            monitor: Box::new(monitor),
        });
        true
    }

    pub fn is_registered<M: Monitor>(&self) -> bool {
        let monitors = self.monitors.lock();
        monitors.iter().any(|slot| slot.type_id == TypeId::of::<M>())
    }

    /// Deliver `event` to the monitor of type `M`, running its handler
    /// synchronously. Returns the assertion-failure message, if any.
    pub fn invoke<M: Monitor>(&self, event: &dyn Event) -> Result<(), String> {
        let mut monitors = self.monitors.lock();
        let slot = monitors
            .iter_mut()
            .find(|slot| slot.type_id == TypeId::of::<M>())
            .ok_or_else(|| {
                format!(
                    "monitor `{}` received event {:?} without being registered",
                    std::any::type_name::<M>(),
                    event
                )
            })?;

        let before = slot.monitor.current_state().to_string();
        let mut ctx = MonitorContext::new();
        slot.monitor.handle_event(&mut ctx, event);
        let after = slot.monitor.current_state();

        if before != after {
            tracing::debug!(
                target: "weft_runtime::monitor",
                "monitor '{}': '{}' -> '{}' on {}",
                slot.monitor.name(),
                before,
                after,
                event.type_name()
            );
        }

        match ctx.failure {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    /// Advance every monitor's liveness temperature by one decision and
    /// return a violation message once some monitor exceeds `threshold`.
    ///
    /// The temperature rises in a hot state, resets in a cold state, and is
    /// left alone in a warm one.
    pub fn check_liveness_temperature(&self, threshold: u64) -> Option<String> {
        let mut monitors = self.monitors.lock();
        for slot in monitors.iter_mut() {
            match slot.monitor.status() {
                StateStatus::Hot => slot.temperature += 1,
                StateStatus::Cold => slot.temperature = 0,
                StateStatus::Warm => (),
            }

            if slot.temperature > threshold {
                return Some(format!(
                    "liveness bug: monitor {} stuck in hot state {} (temperature exceeded {})",
                    slot.monitor.name(),
                    slot.monitor.current_state(),
                    threshold
                ));
            }
        }

        None
    }

    /// Monitors with a pending hot state at iteration end, used to decorate
    /// the final report when an unfair schedule was truncated.
    pub fn hot_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.lock();
        monitors
            .iter()
            .filter(|slot| slot.monitor.status() == StateStatus::Hot)
            .map(|slot| slot.monitor.name().to_string())
            .collect()
    }
}

impl Default for SpecificationEngine {
    fn default() -> Self {
        Self::new()
    }
}
