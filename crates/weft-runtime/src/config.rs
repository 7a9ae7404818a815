use std::time::Duration;

use derive_setters::Setters;
use serde::{Deserialize, Serialize};

/// Which exploration strategy drives scheduling decisions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Uniformly random choice among enabled operations.
    #[default]
    Random,
    /// Random with extra biased coin flips injected before each selection.
    Probabilistic,
    /// Priority-based exploration with a bounded number of priority-change
    /// points (PCT).
    Pct,
    /// PCT that falls back to random scheduling once its priority-change
    /// points are exhausted, making it fair.
    FairPct,
    /// Systematic depth-first enumeration of the choice tree.
    Dfs,
    /// A set of runners with different strategies and seeds racing to the
    /// first bug.
    Portfolio,
}

#[derive(Clone, Debug, Setters)]
#[setters(prefix = "with_")]
pub struct Config {
    /// The exploration strategy to use.
    pub strategy: StrategyKind,

    /// Seed for every pseudo-random decision the runtime makes.
    ///
    /// Two runs with the same seed, configuration, and program make exactly
    /// the same decisions.
    pub seed: u64,

    /// How many testing iterations to run.
    ///
    /// Exploration stops early when a bug is found or the strategy reports
    /// that its search space is exhausted.
    pub iterations: u32,

    /// Maximum number of scheduling decisions and nondeterministic choices
    /// per iteration under an unfair strategy.
    ///
    /// Unfair strategies can starve operations, so their executions are
    /// truncated earlier than fair ones.
    pub max_unfair_steps: u32,

    /// Maximum number of scheduling decisions and nondeterministic choices
    /// per iteration under a fair strategy. Must be at least
    /// [`max_unfair_steps`](Config::max_unfair_steps).
    pub max_fair_steps: u32,

    /// Whether hitting the step bound is reported as a bug instead of
    /// silently ending the iteration.
    pub depth_bound_hit_as_bug: bool,

    /// Whether to fingerprint the program state at each scheduling decision
    /// and stamp the current operation with it.
    pub program_state_hashing: bool,

    /// Number of consecutive hot-state decisions after which a monitor is
    /// reported as a liveness bug.
    ///
    /// When unset, half of [`max_fair_steps`](Config::max_fair_steps) is
    /// used.
    pub liveness_temperature_threshold: Option<u32>,

    /// Enable delay-injection fuzzing instead of systematic serialization.
    ///
    /// In this mode delay operations sleep for real and the deadlock
    /// watchdog below applies.
    pub fuzzing: bool,

    /// How long the step counter may stall before the watchdog declares a
    /// potential deadlock. Only meaningful in fuzzing mode.
    pub deadlock_timeout: Duration,

    /// Tolerate operations blocked on dependencies the runtime cannot
    /// observe by retrying the scheduling decision after a short sleep.
    pub relaxed_controlled_testing: bool,

    /// How long to sleep before each relaxed-mode retry.
    pub relaxed_retry_delay: Duration,

    /// How many relaxed-mode retries to attempt before declaring the
    /// schedule exhausted.
    pub relaxed_retry_limit: u32,

    /// Ask an attached debugger to break when a bug is found.
    ///
    /// Recorded for front-ends; the core itself only carries the value.
    pub attach_debugger_on_bug: bool,

    /// Number of priority-change points available to the PCT strategies.
    pub priority_switch_bound: u32,

    /// Number of biased coin flips the probabilistic strategy injects before
    /// each selection.
    pub probabilistic_coin_flips: u32,

    /// How many runners the portfolio meta-strategy launches.
    pub portfolio_size: u32,

    /// Upper bound on the virtual duration of a delay operation, in delay
    /// units.
    pub max_delay_units: u64,
}

impl Config {
    /// The liveness temperature threshold with the default applied.
    pub fn effective_temperature_threshold(&self) -> u64 {
        match self.liveness_temperature_threshold {
            Some(threshold) => threshold as u64,
            None => (self.max_fair_steps / 2) as u64,
        }
    }

    /// The step bound that applies to a strategy of the given fairness.
    pub fn max_steps(&self, fair: bool) -> u64 {
        if fair {
            self.max_fair_steps as u64
        } else {
            self.max_unfair_steps as u64
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Random,
            seed: 0,
            iterations: 1,
            max_unfair_steps: 10_000,
            max_fair_steps: 100_000,
            depth_bound_hit_as_bug: false,
            program_state_hashing: false,
            liveness_temperature_threshold: None,
            fuzzing: false,
            deadlock_timeout: Duration::from_millis(5000),
            relaxed_controlled_testing: false,
            relaxed_retry_delay: Duration::from_millis(10),
            relaxed_retry_limit: 5,
            attach_debugger_on_bug: false,
            priority_switch_bound: 10,
            probabilistic_coin_flips: 3,
            portfolio_size: 4,
            max_delay_units: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds_are_ordered() {
        let config = Config::default();
        assert!(config.max_fair_steps >= config.max_unfair_steps);
    }

    #[test]
    fn temperature_threshold_defaults_to_half_fair_bound() {
        let config = Config::default().with_max_fair_steps(1000);
        assert_eq!(config.effective_temperature_threshold(), 500);

        let config = config.with_liveness_temperature_threshold(Some(200));
        assert_eq!(config.effective_temperature_threshold(), 200);
    }

    #[test]
    fn setters_chain() {
        let config = Config::default()
            .with_strategy(StrategyKind::Pct)
            .with_seed(42)
            .with_iterations(100);

        assert_eq!(config.strategy, StrategyKind::Pct);
        assert_eq!(config.seed, 42);
        assert_eq!(config.iterations, 100);
    }
}
