//! Exploration strategies: pure decision modules that, given the enabled
//! operations, pick the next one to run (plus boolean/integer choices and
//! delays).
//!
//! Strategies are deterministic in their seed: replaying an iteration with
//! the same seed and schedule reproduces the same decisions. Dispatch is a
//! closed tagged enum rather than open-world virtual dispatch; the liveness
//! wrapper is itself a variant holding a boxed inner strategy.

mod dfs;
mod liveness;
mod pct;
mod probabilistic;
mod random;
mod replay;

use std::sync::Arc;

pub use self::dfs::DfsStrategy;
pub use self::liveness::TemperatureCheckingStrategy;
pub use self::pct::PctStrategy;
pub use self::probabilistic::ProbabilisticStrategy;
pub use self::random::RandomStrategy;
pub use self::replay::ReplayStrategy;
use crate::config::{Config, StrategyKind};
use crate::monitor::SpecificationEngine;
use crate::operation::OperationId;
use crate::trace::ScheduleTrace;

/// The configured exploration strategy for one test run.
pub enum SchedulingStrategy {
    Random(RandomStrategy),
    Probabilistic(ProbabilisticStrategy),
    Pct(PctStrategy),
    Dfs(DfsStrategy),
    Replay(ReplayStrategy),
    Liveness(Box<TemperatureCheckingStrategy>),
}

impl SchedulingStrategy {
    /// Build the strategy selected by `config`.
    ///
    /// The portfolio meta-strategy is not a decision module; it is driven by
    /// the engine, which builds one child strategy per runner.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let strategy = match config.strategy {
            StrategyKind::Random => {
                Self::Random(RandomStrategy::new(config.seed, config.max_steps(true)))
            }
            StrategyKind::Probabilistic => Self::Probabilistic(ProbabilisticStrategy::new(
                config.seed,
                config.probabilistic_coin_flips,
                config.max_steps(true),
            )),
            StrategyKind::Pct => Self::Pct(PctStrategy::new(
                config.seed,
                config.priority_switch_bound,
                config.max_steps(false),
                false,
            )),
            StrategyKind::FairPct => Self::Pct(PctStrategy::new(
                config.seed,
                config.priority_switch_bound,
                config.max_steps(true),
                true,
            )),
            StrategyKind::Dfs => Self::Dfs(DfsStrategy::new(config.max_steps(false))),
            StrategyKind::Portfolio => {
                anyhow::bail!("the portfolio strategy is a meta-runner; use TestEngine::portfolio")
            }
        };

        Ok(strategy)
    }

    /// Wrap this strategy for liveness checking against `specs`.
    pub fn with_liveness_checking(self, specs: Arc<SpecificationEngine>, threshold: u64) -> Self {
        Self::Liveness(Box::new(TemperatureCheckingStrategy::new(
            self, specs, threshold,
        )))
    }

    /// Undo [`with_liveness_checking`](Self::with_liveness_checking),
    /// recovering the inner strategy.
    pub fn without_liveness_checking(self) -> Self {
        match self {
            Self::Liveness(wrapper) => wrapper.into_inner(),
            other => other,
        }
    }

    /// Pick the next operation among `enabled` (listed in ascending id
    /// order). Returns `None` when there is nothing to schedule.
    pub fn next_operation(
        &mut self,
        enabled: &[OperationId],
        current: OperationId,
        is_yielding: bool,
    ) -> Option<OperationId> {
        match self {
            Self::Random(s) => s.next_operation(enabled, current, is_yielding),
            Self::Probabilistic(s) => s.next_operation(enabled, current, is_yielding),
            Self::Pct(s) => s.next_operation(enabled, current, is_yielding),
            Self::Dfs(s) => s.next_operation(enabled, current, is_yielding),
            Self::Replay(s) => s.next_operation(enabled, current, is_yielding),
            Self::Liveness(s) => s.next_operation(enabled, current, is_yielding),
        }
    }

    /// A nondeterministic boolean that is true with probability `1/max`.
    pub fn next_boolean_choice(&mut self, max: u64) -> Option<bool> {
        match self {
            Self::Random(s) => s.next_boolean_choice(max),
            Self::Probabilistic(s) => s.next_boolean_choice(max),
            Self::Pct(s) => s.next_boolean_choice(max),
            Self::Dfs(s) => s.next_boolean_choice(max),
            Self::Replay(s) => s.next_boolean_choice(max),
            Self::Liveness(s) => s.next_boolean_choice(max),
        }
    }

    /// A nondeterministic integer in `[0, max)`.
    pub fn next_integer_choice(&mut self, max: u64) -> Option<u64> {
        match self {
            Self::Random(s) => s.next_integer_choice(max),
            Self::Probabilistic(s) => s.next_integer_choice(max),
            Self::Pct(s) => s.next_integer_choice(max),
            Self::Dfs(s) => s.next_integer_choice(max),
            Self::Replay(s) => s.next_integer_choice(max),
            Self::Liveness(s) => s.next_integer_choice(max),
        }
    }

    /// A nondeterministic delay in `[0, max]` virtual units.
    pub fn next_delay(&mut self, max: u64) -> Option<u64> {
        match self {
            Self::Random(s) => s.next_delay(max),
            Self::Probabilistic(s) => s.next_delay(max),
            Self::Pct(s) => s.next_delay(max),
            Self::Dfs(s) => s.next_delay(max),
            Self::Replay(s) => s.next_delay(max),
            Self::Liveness(s) => s.next_delay(max),
        }
    }

    pub fn has_reached_max_steps(&self) -> bool {
        match self {
            Self::Random(s) => s.has_reached_max_steps(),
            Self::Probabilistic(s) => s.has_reached_max_steps(),
            Self::Pct(s) => s.has_reached_max_steps(),
            Self::Dfs(s) => s.has_reached_max_steps(),
            Self::Replay(s) => s.has_reached_max_steps(),
            Self::Liveness(s) => s.has_reached_max_steps(),
        }
    }

    /// Fair strategies never starve an enabled operation forever; unfair
    /// ones may, and are truncated at the (smaller) unfair step bound.
    pub fn is_fair(&self) -> bool {
        match self {
            Self::Random(_) | Self::Probabilistic(_) | Self::Replay(_) => true,
            Self::Pct(s) => s.is_fair(),
            Self::Dfs(_) => false,
            Self::Liveness(s) => s.is_fair(),
        }
    }

    /// Scheduling decisions plus nondeterministic choices made so far in the
    /// current iteration.
    pub fn scheduled_steps(&self) -> u64 {
        match self {
            Self::Random(s) => s.scheduled_steps(),
            Self::Probabilistic(s) => s.scheduled_steps(),
            Self::Pct(s) => s.scheduled_steps(),
            Self::Dfs(s) => s.scheduled_steps(),
            Self::Replay(s) => s.scheduled_steps(),
            Self::Liveness(s) => s.scheduled_steps(),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Random(s) => s.description(),
            Self::Probabilistic(s) => s.description(),
            Self::Pct(s) => s.description(),
            Self::Dfs(s) => s.description(),
            Self::Replay(s) => s.description(),
            Self::Liveness(s) => s.description(),
        }
    }

    /// Reset per-iteration state. Returns whether another iteration is worth
    /// running (DFS returns false once its choice tree is exhausted).
    pub fn prepare_next_iteration(&mut self) -> bool {
        match self {
            Self::Random(s) => s.prepare_next_iteration(),
            Self::Probabilistic(s) => s.prepare_next_iteration(),
            Self::Pct(s) => s.prepare_next_iteration(),
            Self::Dfs(s) => s.prepare_next_iteration(),
            Self::Replay(s) => s.prepare_next_iteration(),
            Self::Liveness(s) => s.prepare_next_iteration(),
        }
    }

    /// A liveness violation detected by the temperature wrapper during the
    /// last decision, if any. The scheduler drains this after every call.
    pub fn take_pending_violation(&mut self) -> Option<String> {
        match self {
            Self::Liveness(s) => s.take_pending_violation(),
            _ => None,
        }
    }

    /// Build a replay strategy for a captured trace.
    pub fn replay(trace: ScheduleTrace) -> Self {
        Self::Replay(ReplayStrategy::new(trace))
    }
}
