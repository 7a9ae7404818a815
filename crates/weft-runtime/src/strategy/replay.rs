use crate::operation::OperationId;
use crate::trace::{ScheduleTrace, TraceEntry};

/// Replays the decisions recorded in a captured schedule trace, in order.
///
/// Replay expects the program to make the same sequence of scheduling
/// points and choices; any divergence means the program is nondeterministic
/// outside the runtime's control, and is reported loudly.
pub struct ReplayStrategy {
    entries: Vec<TraceEntry>,
    position: usize,
    steps: u64,
    diverged: bool,
}

impl ReplayStrategy {
    pub fn new(trace: ScheduleTrace) -> Self {
        Self {
            entries: trace.entries().to_vec(),
            position: 0,
            steps: 0,
            diverged: false,
        }
    }

    /// Whether the program diverged from the recorded trace.
    pub fn diverged(&self) -> bool {
        self.diverged
    }

    fn next_entry(&mut self) -> Option<TraceEntry> {
        let entry = self.entries.get(self.position).copied();
        if entry.is_some() {
            self.position += 1;
            self.steps += 1;
        }

        entry
    }

    fn divergence(&mut self, expected: &str, got: TraceEntry) {
        self.diverged = true;
        tracing::error!(
            target: "weft_runtime::strategy",
            "replay diverged at step {}: expected a {expected} entry, trace has {got:?}",
            self.position
        );
    }

    pub fn next_operation(
        &mut self,
        enabled: &[OperationId],
        _current: OperationId,
        _is_yielding: bool,
    ) -> Option<OperationId> {
        if enabled.is_empty() {
            return None;
        }

        match self.next_entry()? {
            TraceEntry::Schedule(id) => {
                let op = OperationId::new(id);
                if enabled.contains(&op) {
                    Some(op)
                } else {
                    self.diverged = true;
                    tracing::error!(
                        target: "weft_runtime::strategy",
                        "replay diverged at step {}: {op} is not enabled",
                        self.position
                    );
                    None
                }
            }
            other => {
                self.divergence("SCHED", other);
                None
            }
        }
    }

    pub fn next_boolean_choice(&mut self, _max: u64) -> Option<bool> {
        match self.next_entry()? {
            TraceEntry::Boolean(value) => Some(value),
            other => {
                self.divergence("BOOL", other);
                None
            }
        }
    }

    pub fn next_integer_choice(&mut self, _max: u64) -> Option<u64> {
        match self.next_entry()? {
            TraceEntry::Integer(value) => Some(value),
            other => {
                self.divergence("INT", other);
                None
            }
        }
    }

    pub fn next_delay(&mut self, max: u64) -> Option<u64> {
        self.next_integer_choice(max)
    }

    pub fn has_reached_max_steps(&self) -> bool {
        false
    }

    pub fn scheduled_steps(&self) -> u64 {
        self.steps
    }

    pub fn description(&self) -> String {
        format!("replay ({} recorded decisions)", self.entries.len())
    }

    pub fn prepare_next_iteration(&mut self) -> bool {
        // A trace replays exactly one iteration.
        false
    }
}
