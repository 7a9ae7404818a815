use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::operation::OperationId;

/// Uniformly random exploration.
///
/// Every decision draws from one seeded PRNG, so the whole run is a pure
/// function of the seed. The PRNG stream deliberately continues across
/// iterations; that is what makes different iterations explore different
/// schedules.
pub struct RandomStrategy {
    rng: StdRng,
    seed: u64,
    steps: u64,
    max_steps: u64,
}

impl RandomStrategy {
    pub fn new(seed: u64, max_steps: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
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
        let index = self.rng.gen_range(0..enabled.len());
        Some(enabled[index])
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

    pub fn scheduled_steps(&self) -> u64 {
        self.steps
    }

    pub fn description(&self) -> String {
        format!("random (seed: {})", self.seed)
    }

    pub fn prepare_next_iteration(&mut self) -> bool {
        self.steps = 0;
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
    fn selection_is_uniform_enough() {
        let mut strategy = RandomStrategy::new(3, 0);
        let enabled = ids(&[0, 1, 2]);

        let mut counts = [0usize; 3];
        for _ in 0..3000 {
            let op = strategy
                .next_operation(&enabled, OperationId::new(0), false)
                .unwrap();
            counts[op.get() as usize] += 1;
        }

        for count in counts {
            assert!(count > 700, "skewed selection: {counts:?}");
        }
    }

    #[test]
    fn empty_enabled_set_yields_none() {
        let mut strategy = RandomStrategy::new(0, 0);
        assert_eq!(
            strategy.next_operation(&[], OperationId::new(0), false),
            None
        );
        assert_eq!(strategy.scheduled_steps(), 0);
    }

    #[test]
    fn step_bound_is_respected() {
        let mut strategy = RandomStrategy::new(0, 2);
        let enabled = ids(&[0]);

        assert!(!strategy.has_reached_max_steps());
        strategy.next_operation(&enabled, OperationId::new(0), false);
        strategy.next_operation(&enabled, OperationId::new(0), false);
        assert!(strategy.has_reached_max_steps());

        strategy.prepare_next_iteration();
        assert!(!strategy.has_reached_max_steps());
    }

    #[test]
    fn boolean_probability_follows_max() {
        let mut strategy = RandomStrategy::new(11, 0);

        // max = 1 is always true.
        for _ in 0..10 {
            assert_eq!(strategy.next_boolean_choice(1), Some(true));
        }

        let trues = (0..1000)
            .filter(|_| strategy.next_boolean_choice(10) == Some(true))
            .count();
        assert!((50..200).contains(&trues), "got {trues} trues out of 1000");
    }
}
