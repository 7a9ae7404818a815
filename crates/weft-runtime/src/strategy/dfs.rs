use crate::operation::OperationId;

enum ChoicePoint {
    Schedule {
        options: Vec<OperationId>,
        index: usize,
    },
    Boolean {
        index: u64,
    },
    Integer {
        max: u64,
        index: u64,
    },
}

/// Systematic depth-first enumeration of the choice tree.
///
/// Each iteration replays the decisions recorded on the stack up to the
/// current depth, then extends the stack with first-option choices.
/// Preparing the next iteration advances the deepest choice point that
/// still has options and drops everything below it; once the stack empties
/// the whole (bounded) space has been covered.
///
/// Unfair, and only practical for small state spaces.
pub struct DfsStrategy {
    stack: Vec<ChoicePoint>,
    depth: usize,
    steps: u64,
    max_steps: u64,
}

impl DfsStrategy {
    pub fn new(max_steps: u64) -> Self {
        Self {
            stack: Vec::new(),
            depth: 0,
            steps: 0,
            max_steps,
        }
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

        self.steps += 1;

        if self.depth < self.stack.len() {
            if let ChoicePoint::Schedule { options, index } = &self.stack[self.depth] {
                let choice = options[*index];
                if enabled.contains(&choice) {
                    self.depth += 1;
                    return Some(choice);
                }
            }

            // The program diverged from the recorded prefix (a sign of
            // nondeterminism outside the runtime's control). Drop the stale
            // suffix and continue exploring from here.
            tracing::warn!(
                target: "weft_runtime::strategy",
                "dfs: schedule diverged from the recorded prefix at depth {}",
                self.depth
            );
            self.stack.truncate(self.depth);
        }

        self.stack.push(ChoicePoint::Schedule {
            options: enabled.to_vec(),
            index: 0,
        });
        self.depth = self.stack.len();
        Some(enabled[0])
    }

    pub fn next_boolean_choice(&mut self, _max: u64) -> Option<bool> {
        self.steps += 1;

        if self.depth < self.stack.len() {
            if let ChoicePoint::Boolean { index } = &self.stack[self.depth] {
                let value = *index == 1;
                self.depth += 1;
                return Some(value);
            }

            self.stack.truncate(self.depth);
        }

        self.stack.push(ChoicePoint::Boolean { index: 0 });
        self.depth = self.stack.len();
        Some(false)
    }

    pub fn next_integer_choice(&mut self, max: u64) -> Option<u64> {
        self.steps += 1;
        let max = max.max(1);

        if self.depth < self.stack.len() {
            if let ChoicePoint::Integer {
                max: recorded,
                index,
            } = &self.stack[self.depth]
            {
                if *recorded == max {
                    let value = *index;
                    self.depth += 1;
                    return Some(value);
                }
            }

            self.stack.truncate(self.depth);
        }

        self.stack.push(ChoicePoint::Integer { max, index: 0 });
        self.depth = self.stack.len();
        Some(0)
    }

    pub fn next_delay(&mut self, max: u64) -> Option<u64> {
        self.next_integer_choice(max.saturating_add(1))
    }

    pub fn has_reached_max_steps(&self) -> bool {
        self.max_steps != 0 && self.steps >= self.max_steps
    }

    pub fn scheduled_steps(&self) -> u64 {
        self.steps
    }

    pub fn description(&self) -> String {
        "dfs".to_string()
    }

    pub fn prepare_next_iteration(&mut self) -> bool {
        self.steps = 0;
        self.depth = 0;

        // Backtrack: advance the deepest choice point that still has an
        // unexplored option, discarding exhausted ones.
        while let Some(top) = self.stack.last_mut() {
            let has_more = match top {
                ChoicePoint::Schedule { options, index } => {
                    *index += 1;
                    *index < options.len()
                }
                ChoicePoint::Boolean { index } => {
                    *index += 1;
                    *index < 2
                }
                ChoicePoint::Integer { max, index } => {
                    *index += 1;
                    *index < *max
                }
            };

            if has_more {
                return true;
            }

            self.stack.pop();
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<OperationId> {
        raw.iter().copied().map(OperationId::new).collect()
    }

    #[test]
    fn enumerates_every_branch_of_a_two_choice_tree() {
        let mut strategy = DfsStrategy::new(0);
        let enabled = ids(&[0, 1]);

        let mut schedules = Vec::new();
        loop {
            let a = strategy
                .next_operation(&enabled, OperationId::new(0), false)
                .unwrap();
            let b = strategy
                .next_operation(&enabled, OperationId::new(0), false)
                .unwrap();
            schedules.push((a.get(), b.get()));

            if !strategy.prepare_next_iteration() {
                break;
            }
        }

        assert_eq!(schedules, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn enumerates_boolean_choices() {
        let mut strategy = DfsStrategy::new(0);

        let mut outcomes = Vec::new();
        loop {
            outcomes.push(strategy.next_boolean_choice(2).unwrap());
            if !strategy.prepare_next_iteration() {
                break;
            }
        }

        assert_eq!(outcomes, vec![false, true]);
    }

    #[test]
    fn integer_choices_cover_the_range() {
        let mut strategy = DfsStrategy::new(0);

        let mut outcomes = Vec::new();
        loop {
            outcomes.push(strategy.next_integer_choice(3).unwrap());
            if !strategy.prepare_next_iteration() {
                break;
            }
        }

        assert_eq!(outcomes, vec![0, 1, 2]);
    }

    #[test]
    fn mixed_depth_backtracking() {
        let mut strategy = DfsStrategy::new(0);
        let enabled = ids(&[0, 1]);

        let mut count = 0;
        loop {
            strategy.next_operation(&enabled, OperationId::new(0), false);
            strategy.next_boolean_choice(2);
            count += 1;

            if !strategy.prepare_next_iteration() {
                break;
            }
        }

        // 2 schedule options x 2 boolean options.
        assert_eq!(count, 4);
    }
}
