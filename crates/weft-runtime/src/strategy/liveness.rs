use std::sync::Arc;

use crate::monitor::SpecificationEngine;
use crate::operation::OperationId;
use crate::strategy::SchedulingStrategy;

/// Wraps another strategy and checks every monitor's liveness temperature
/// before each decision.
///
/// When a monitor has been in a hot state for more than the configured
/// threshold of decisions, the violation is parked here and the scheduler
/// drains it into the assertion-failure pipeline right after the decision.
pub struct TemperatureCheckingStrategy {
    inner: SchedulingStrategy,
    specs: Arc<SpecificationEngine>,
    threshold: u64,
    pending_violation: Option<String>,
}

impl TemperatureCheckingStrategy {
    pub fn new(
        inner: SchedulingStrategy,
        specs: Arc<SpecificationEngine>,
        threshold: u64,
    ) -> Self {
        Self {
            inner,
            specs,
            threshold,
            pending_violation: None,
        }
    }

    pub fn into_inner(self) -> SchedulingStrategy {
        self.inner
    }

    fn check_temperature(&mut self) {
        if self.pending_violation.is_none() {
            self.pending_violation = self.specs.check_liveness_temperature(self.threshold);
        }
    }

    pub fn next_operation(
        &mut self,
        enabled: &[OperationId],
        current: OperationId,
        is_yielding: bool,
    ) -> Option<OperationId> {
        self.check_temperature();
        self.inner.next_operation(enabled, current, is_yielding)
    }

    pub fn next_boolean_choice(&mut self, max: u64) -> Option<bool> {
        self.check_temperature();
        self.inner.next_boolean_choice(max)
    }

    pub fn next_integer_choice(&mut self, max: u64) -> Option<u64> {
        self.check_temperature();
        self.inner.next_integer_choice(max)
    }

    pub fn next_delay(&mut self, max: u64) -> Option<u64> {
        self.inner.next_delay(max)
    }

    pub fn has_reached_max_steps(&self) -> bool {
        self.inner.has_reached_max_steps()
    }

    pub fn is_fair(&self) -> bool {
        self.inner.is_fair()
    }

    pub fn scheduled_steps(&self) -> u64 {
        self.inner.scheduled_steps()
    }

    pub fn description(&self) -> String {
        format!("liveness-checking {}", self.inner.description())
    }

    pub fn prepare_next_iteration(&mut self) -> bool {
        self.pending_violation = None;
        self.inner.prepare_next_iteration()
    }

    pub fn take_pending_violation(&mut self) -> Option<String> {
        self.pending_violation.take()
    }
}
