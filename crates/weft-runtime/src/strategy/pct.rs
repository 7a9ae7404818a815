use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::operation::OperationId;

/// Priority-based exploration (PCT).
///
/// At iteration start every operation gets a random position in a total
/// priority order, and a bounded number of priority-change points are placed
/// at random step indices. Between change points the highest-priority
/// enabled operation runs; at a change point one enabled operation is
/// demoted to the lowest priority.
///
/// Plain PCT is unfair: a low-priority operation may starve. The fair
/// variant falls back to uniform random scheduling once every change point
/// has been spent.
pub struct PctStrategy {
    rng: StdRng,
    seed: u64,
    bound: u32,
    fair: bool,

    /// Highest priority first. Operations are inserted at a random position
    /// the first time they are seen.
    priorities: Vec<OperationId>,
    change_points: HashSet<u64>,
    remaining_changes: u32,

    steps: u64,
    max_steps: u64,
    /// Step count of the previous iteration; change points for this
    /// iteration are sampled from that range.
    last_iteration_steps: u64,
}

impl PctStrategy {
    pub fn new(seed: u64, bound: u32, max_steps: u64, fair: bool) -> Self {
        let mut strategy = Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            bound,
            fair,
            priorities: Vec::new(),
            change_points: HashSet::new(),
            remaining_changes: bound,
            steps: 0,
            max_steps,
            last_iteration_steps: 0,
        };

        strategy.sample_change_points();
        strategy
    }

    fn sample_change_points(&mut self) {
        self.change_points.clear();
        self.remaining_changes = self.bound;

        // Until we have seen an iteration there is no step range to sample
        // from; spread the points over the first `10 * bound` steps instead.
        let range = self.last_iteration_steps.max(self.bound as u64 * 10).max(1);
        for _ in 0..self.bound {
            self.change_points.insert(self.rng.gen_range(1..=range));
        }
    }

    fn register_new_operations(&mut self, enabled: &[OperationId]) {
        for &op in enabled {
            if !self.priorities.contains(&op) {
                let index = self.rng.gen_range(0..=self.priorities.len());
                self.priorities.insert(index, op);
            }
        }
    }

    fn fallback_active(&self) -> bool {
        self.fair && self.remaining_changes == 0
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
        self.register_new_operations(enabled);

        if self.fallback_active() {
            let index = self.rng.gen_range(0..enabled.len());
            return Some(enabled[index]);
        }

        if self.remaining_changes > 0 && self.change_points.contains(&self.steps) {
            // Demote one enabled operation to the lowest priority.
            let victim = enabled[self.rng.gen_range(0..enabled.len())];
            self.priorities.retain(|&op| op != victim);
            self.priorities.push(victim);
            self.remaining_changes -= 1;

            tracing::trace!(
                target: "weft_runtime::strategy",
                "pct: demoted {victim} at step {}",
                self.steps
            );
        }

        self.priorities
            .iter()
            .find(|op| enabled.contains(op))
            .copied()
    }

    pub fn next_boolean_choice(&mut self, max: u64) -> Option<bool> {
        self.steps += 1;
        Some(self.rng.gen_range(0..max.max(1)) == 0)
    }

    pub fn next_integer_choice(&mut self, max: u64) -> Option<u64> {
        self.steps += 1;
        Some(self.rng.gen_range(0..max.max(1)))
    }

    pub fn next_delay(&mut self, max: u64) -> Option<u64> {
        self.steps += 1;
        Some(self.rng.gen_range(0..=max))
    }

    pub fn has_reached_max_steps(&self) -> bool {
        self.max_steps != 0 && self.steps >= self.max_steps
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn scheduled_steps(&self) -> u64 {
        self.steps
    }

    pub fn description(&self) -> String {
        format!(
            "{} (priority switch bound: {}, seed: {})",
            if self.fair { "fair-pct" } else { "pct" },
            self.bound,
            self.seed
        )
    }

    pub fn prepare_next_iteration(&mut self) -> bool {
        self.last_iteration_steps = self.steps;
        self.steps = 0;
        self.priorities.clear();
        self.sample_change_points();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<OperationId> {
        raw.iter().copied().map(OperationId::new).collect()
    }

    #[test]
    fn follows_priorities_between_change_points() {
        // bound = 0 means the priority order never changes.
        let mut strategy = PctStrategy::new(13, 0, 0, false);
        let enabled = ids(&[0, 1, 2]);

        let first = strategy
            .next_operation(&enabled, OperationId::new(0), false)
            .unwrap();

        // With no change points the same operation stays on top.
        for _ in 0..50 {
            assert_eq!(
                strategy.next_operation(&enabled, OperationId::new(0), false),
                Some(first)
            );
        }
    }

    #[test]
    fn picks_highest_priority_enabled_when_top_is_blocked() {
        let mut strategy = PctStrategy::new(13, 0, 0, false);
        let all = ids(&[0, 1, 2]);

        let top = strategy
            .next_operation(&all, OperationId::new(0), false)
            .unwrap();

        let without_top: Vec<_> = all.iter().copied().filter(|&op| op != top).collect();
        let second = strategy
            .next_operation(&without_top, OperationId::new(0), false)
            .unwrap();
        assert_ne!(second, top);

        // Re-enabling the top operation puts it back in charge.
        assert_eq!(
            strategy.next_operation(&all, OperationId::new(0), false),
            Some(top)
        );
    }

    #[test]
    fn deterministic_in_the_seed() {
        let enabled = ids(&[0, 1, 2, 3, 4]);
        let mut a = PctStrategy::new(99, 5, 0, false);
        let mut b = PctStrategy::new(99, 5, 0, false);

        for _ in 0..300 {
            assert_eq!(
                a.next_operation(&enabled, OperationId::new(0), false),
                b.next_operation(&enabled, OperationId::new(0), false)
            );
        }
    }

    #[test]
    fn fair_variant_falls_back_to_random_after_change_points() {
        let mut strategy = PctStrategy::new(7, 1, 0, true);
        let enabled = ids(&[0, 1, 2, 3]);

        // Drive until the single change point has been consumed.
        for _ in 0..2000 {
            strategy.next_operation(&enabled, OperationId::new(0), false);
            if strategy.fallback_active() {
                break;
            }
        }
        assert!(strategy.fallback_active());

        // In fallback mode every operation gets selected.
        let mut seen = [false; 4];
        for _ in 0..500 {
            let op = strategy
                .next_operation(&enabled, OperationId::new(0), false)
                .unwrap();
            seen[op.get() as usize] = true;
        }
        assert_eq!(seen, [true; 4]);
    }

    #[test]
    fn new_iteration_reshuffles_priorities() {
        let mut strategy = PctStrategy::new(3, 2, 0, false);
        let enabled = ids(&[0, 1, 2, 3, 4, 5, 6, 7]);

        let mut firsts = HashSet::new();
        for _ in 0..20 {
            firsts.insert(
                strategy
                    .next_operation(&enabled, OperationId::new(0), false)
                    .unwrap(),
            );
            assert!(strategy.prepare_next_iteration());
        }

        // Across 20 reshuffles of 8 operations the top pick varies.
        assert!(firsts.len() > 1);
    }
}
