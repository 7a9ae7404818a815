use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::operation::OperationId;

/// Random exploration with extra coin flips injected before each selection.
///
/// Flipping `coin_flips` biased coins between decisions perturbs the PRNG
/// stream, which decorrelates consecutive selections and makes the strategy
/// visit schedule patterns plain uniform selection reaches only rarely.
pub struct ProbabilisticStrategy {
    rng: StdRng,
    seed: u64,
    coin_flips: u32,
    steps: u64,
    max_steps: u64,
}

impl ProbabilisticStrategy {
    pub fn new(seed: u64, coin_flips: u32, max_steps: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            coin_flips,
            steps: 0,
            max_steps,
        }
    }

    pub fn next_operation(
        &mut self,
        enabled: &[OperationId],
        current: OperationId,
        _is_yielding: bool,
    ) -> Option<OperationId> {
        if enabled.is_empty() {
            return None;
        }

        self.steps += 1;

        // Prefer staying on the current operation unless a coin says to
        // switch; every flip also advances the stream.
        let mut switch = false;
        for _ in 0..self.coin_flips {
            switch |= self.rng.gen_bool(0.5);
        }

        if !switch && enabled.contains(&current) {
            return Some(current);
        }

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
        format!(
            "probabilistic (coin flips: {}, seed: {})",
            self.coin_flips, self.seed
        )
    }

    pub fn prepare_next_iteration(&mut self) -> bool {
        self.steps = 0;
        true
    }
}
