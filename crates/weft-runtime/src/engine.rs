//! The test engine: drives testing iterations against one strategy,
//! replays captured schedules, and runs strategy portfolios.

use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{Config, StrategyKind};
use crate::error::{self, BugKind, BugReport};
use crate::flag::DetachFlag;
use crate::monitor::{Monitor, SpecificationEngine};
use crate::runtime::{RootGuard, Runtime};
use crate::scheduler::OperationScheduler;
use crate::strategy::SchedulingStrategy;
use crate::trace::ScheduleTrace;

/// A test body, run once per iteration inside a controlled root operation.
pub type TestFn = dyn Fn(&Runtime) + Send + Sync;

type MonitorFactory = Box<dyn Fn(&SpecificationEngine) + Send + Sync>;

/// Outcome of a test run.
///
/// A command-line driver maps this to the exit-code contract: 0 when no bug
/// was found, 1 when one was, and 2 (an `Err` from the engine) for internal
/// errors such as uncontrolled concurrency.
#[derive(Clone, Debug, Serialize)]
pub struct TestReport {
    pub bug: Option<BugReport>,
    /// How many iterations actually ran.
    pub iterations: u32,
    pub strategy: String,
}

impl TestReport {
    pub fn found_bug(&self) -> bool {
        self.bug.is_some()
    }

    pub fn exit_code(&self) -> i32 {
        if self.bug.is_some() {
            1
        } else {
            0
        }
    }

    /// The report in the JSON form the report-file writers consume.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Runs a user test under systematic exploration.
pub struct TestEngine {
    config: Arc<Config>,
    strategy: Option<SchedulingStrategy>,
    monitors: Vec<MonitorFactory>,
    on_failure: Option<Arc<dyn Fn(&BugReport) + Send + Sync>>,
    stop: Option<DetachFlag>,
}

impl TestEngine {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let strategy = SchedulingStrategy::from_config(&config)?;
        Ok(Self::with_strategy(config, strategy))
    }

    pub fn with_strategy(config: Config, strategy: SchedulingStrategy) -> Self {
        install_panic_hook();
        Self {
            config: Arc::new(config),
            strategy: Some(strategy),
            monitors: Vec::new(),
            on_failure: None,
            stop: None,
        }
    }

    /// Register a monitor type; a fresh instance is created for every
    /// iteration. Registering monitors also turns on liveness checking.
    pub fn register_monitor<M, F>(&mut self, factory: F) -> &mut Self
    where
        M: Monitor,
        F: Fn() -> M + Send + Sync + 'static,
    {
        self.monitors.push(Box::new(move |specs| {
            specs.register(factory());
        }));
        self
    }

    /// Install a callback invoked once with the first bug of a run.
    pub fn on_failure(&mut self, callback: impl Fn(&BugReport) + Send + Sync + 'static) -> &mut Self {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Run up to the configured number of iterations, stopping at the
    /// first bug or when the strategy exhausts its search space.
    pub fn run<F>(&mut self, test: F) -> anyhow::Result<TestReport>
    where
        F: Fn(&Runtime) + Send + Sync + 'static,
    {
        self.run_shared(Arc::new(test))
    }

    fn run_shared(&mut self, test: Arc<TestFn>) -> anyhow::Result<TestReport> {
        let description = self
            .strategy
            .as_ref()
            .map(SchedulingStrategy::description)
            .unwrap_or_default();
        tracing::info!(
            target: "weft_runtime::engine",
            "exploring with strategy: {description}"
        );

        let total = self.config.iterations.max(1);
        let mut iterations = 0;
        let mut bug = None;

        for iteration in 0..total {
            if self.stop.as_ref().is_some_and(DetachFlag::is_raised) {
                tracing::debug!(
                    target: "weft_runtime::engine",
                    "stopping before iteration {iteration}: another runner found a bug"
                );
                break;
            }

            let outcome = self.run_iteration(iteration, test.clone())?;
            iterations += 1;

            if let Some(report) = outcome {
                if let Some(stop) = &self.stop {
                    stop.raise();
                }
                bug = Some(report);
                break;
            }

            let strategy = self.strategy.as_mut().expect("strategy is installed");
            if iteration + 1 < total && !strategy.prepare_next_iteration() {
                tracing::debug!(
                    target: "weft_runtime::engine",
                    "search space exhausted after {iterations} iterations"
                );
                break;
            }
        }

        Ok(TestReport {
            bug,
            iterations,
            strategy: description,
        })
    }

    fn run_iteration(
        &mut self,
        iteration: u32,
        test: Arc<TestFn>,
    ) -> anyhow::Result<Option<BugReport>> {
        tracing::debug!(
            target: "weft_runtime::engine",
            "starting iteration {iteration}"
        );

        let specs = Arc::new(SpecificationEngine::new());
        for factory in &self.monitors {
            factory(&specs);
        }

        let mut strategy = self.strategy.take().expect("strategy is installed");
        if !self.monitors.is_empty() {
            strategy = strategy.with_liveness_checking(
                specs.clone(),
                self.config.effective_temperature_threshold(),
            );
        }

        let scheduler = Arc::new(OperationScheduler::new(
            self.config.clone(),
            strategy,
            iteration,
        ));
        if let Some(callback) = &self.on_failure {
            let callback = callback.clone();
            scheduler.set_on_failure(Box::new(move |report| callback(report)));
        }

        let runtime = Runtime::new(scheduler.clone(), specs.clone(), self.config.clone());
        let watchdog = self
            .config
            .fuzzing
            .then(|| spawn_watchdog(scheduler.clone(), self.config.clone()));

        {
            let _root = RootGuard::enter();
            runtime.spawn_named("root", move |rt: &Runtime| test(rt));
            scheduler.wait_iteration_complete();
        }

        // The iteration is over one way or another; make sure every paused
        // thread has been released before joining them.
        scheduler.detach();
        runtime.join_threads();

        tracing::trace!(
            target: "weft_runtime::engine",
            "iteration {iteration} finished: {:?}",
            scheduler.operation_statuses()
        );

        let hot = specs.hot_monitors();
        if !hot.is_empty() {
            tracing::debug!(
                target: "weft_runtime::engine",
                "monitors still in a hot state at iteration end: {}",
                hot.join(", ")
            );
        }

        if let Some(watchdog) = watchdog {
            watchdog.stop();
        }

        self.strategy = Some(scheduler.reclaim_strategy().without_liveness_checking());

        if let Some(reason) = scheduler.invalid_reason() {
            anyhow::bail!("iteration {iteration} is invalid: {reason}");
        }

        Ok(scheduler.bug())
    }

    /// Replay a captured schedule trace against the same program: one
    /// iteration, decisions taken from the trace in order.
    pub fn replay<F>(config: Config, trace: &str, test: F) -> anyhow::Result<TestReport>
    where
        F: Fn(&Runtime) + Send + Sync + 'static,
    {
        let trace = ScheduleTrace::parse(trace)?;
        let mut engine = Self::with_strategy(
            config.with_iterations(1),
            SchedulingStrategy::replay(trace),
        );
        engine.run(test)
    }

    /// Race several strategies (with distinct seeds) against the same test
    /// on parallel runners. The first bug stops every other runner; exactly
    /// one bug is reported.
    pub fn portfolio<F>(config: Config, test: F) -> anyhow::Result<TestReport>
    where
        F: Fn(&Runtime) + Send + Sync + 'static,
    {
        const CHILD_STRATEGIES: [StrategyKind; 4] = [
            StrategyKind::Random,
            StrategyKind::Probabilistic,
            StrategyKind::FairPct,
            StrategyKind::Pct,
        ];

        let test: Arc<TestFn> = Arc::new(test);
        let stop = DetachFlag::new();
        let first_bug: Arc<Mutex<Option<BugReport>>> = Arc::new(Mutex::new(None));
        let runners = config.portfolio_size.max(1);

        let mut handles = Vec::new();
        for index in 0..runners {
            let kind = CHILD_STRATEGIES[index as usize % CHILD_STRATEGIES.len()];
            let child_config = config
                .clone()
                .with_strategy(kind)
                .with_seed(config.seed.wrapping_add(index as u64));

            let stop = stop.clone();
            let first_bug = first_bug.clone();
            let test = test.clone();
            let handle = std::thread::Builder::new()
                .name(format!("weft-portfolio-{index}"))
                .spawn(move || -> anyhow::Result<u32> {
                    let mut engine = TestEngine::new(child_config)?;
                    engine.stop = Some(stop.clone());

                    let report = engine.run_shared(test)?;
                    if let Some(bug) = report.bug {
                        let mut slot = first_bug.lock();
                        if slot.is_none() {
                            *slot = Some(bug);
                        }
                        // Instruct the siblings to stop.
                        stop.raise();
                    }

                    Ok(report.iterations)
                })
                .expect("failed to spawn a portfolio runner");

            handles.push(handle);
        }

        let mut iterations = 0;
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(count)) => iterations += count,
                Ok(Err(error)) => first_error = Some(error),
                Err(_) => first_error = Some(anyhow::anyhow!("a portfolio runner panicked")),
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        let bug = first_bug.lock().take();
        Ok(TestReport {
            bug,
            iterations,
            strategy: format!("portfolio ({runners} runners)"),
        })
    }
}

struct Watchdog {
    flag: DetachFlag,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn stop(self) {
        self.flag.raise();
        let _ = self.thread.join();
    }
}

/// Fuzzing-mode deadlock watchdog: samples the step counter and declares a
/// potential deadlock when it stops advancing between samples.
fn spawn_watchdog(scheduler: Arc<OperationScheduler>, config: Arc<Config>) -> Watchdog {
    let flag = DetachFlag::new();
    let watchdog_flag = flag.clone();
    let timeout = if config.deadlock_timeout.is_zero() {
        Duration::from_millis(5000)
    } else {
        config.deadlock_timeout
    };

    let thread = std::thread::Builder::new()
        .name("weft-watchdog".to_string())
        .spawn(move || {
            let mut last = scheduler.scheduled_steps();
            loop {
                if watchdog_flag.wait_timeout(timeout) {
                    return;
                }

                let steps = scheduler.scheduled_steps();
                if steps == last && scheduler.is_attached() {
                    scheduler.notify_assertion_failure(
                        BugKind::Deadlock,
                        format!(
                            "potential deadlock detected: no scheduling progress for {}ms",
                            timeout.as_millis()
                        ),
                    );
                    return;
                }

                last = steps;
            }
        })
        .expect("failed to spawn the deadlock watchdog");

    Watchdog { flag, thread }
}

/// Panic payloads implementing the detach protocol are expected and must
/// not spam stderr with backtraces; everything else keeps the default
/// behavior.
fn install_panic_hook() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if error::is_controlled_payload(info.payload()) {
                return;
            }

            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_trivial_test_completes_without_bugs() {
        let mut engine = TestEngine::new(Config::default()).unwrap();
        let report = engine
            .run(|rt| {
                let one = rt.spawn(|_| 1);
                let value = rt.join(&one).unwrap();
                rt.assert(value == 1, "join returned the task's value");
            })
            .unwrap();

        assert!(!report.found_bug());
        assert_eq!(report.iterations, 1);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn an_assertion_failure_is_reported_with_a_trace() {
        let mut engine = TestEngine::new(Config::default()).unwrap();
        let report = engine.run(|rt| rt.assert(false, "always fails")).unwrap();

        assert_eq!(report.exit_code(), 1);

        let json = report.to_json();
        let bug = report.bug.expect("the assertion must fail");
        assert_eq!(bug.kind, BugKind::Assertion);
        assert!(bug.message.contains("always fails"));
        assert!(ScheduleTrace::parse(&bug.trace).is_ok());
        assert!(json.contains("\"kind\": \"assertion\""), "{json}");
        assert!(json.contains("always fails"), "{json}");
    }

    #[test]
    fn the_failure_callback_sees_the_first_bug() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let mut engine = TestEngine::new(Config::default().with_iterations(5)).unwrap();
        engine.on_failure(move |report| {
            assert_eq!(report.kind, BugKind::Assertion);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let report = engine.run(|rt| rt.assert(false, "boom")).unwrap();
        assert!(report.found_bug());
        assert_eq!(report.iterations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn program_state_hashing_does_not_disturb_a_run() {
        let config = Config::default().with_program_state_hashing(true);
        let mut engine = TestEngine::new(config).unwrap();
        let report = engine
            .run(|rt| {
                let task = rt.spawn(|rt| {
                    rt.yield_now();
                    3
                });
                let value = rt.join(&task).unwrap();
                rt.assert(value == 3, "hashing is observation only");
            })
            .unwrap();

        assert!(!report.found_bug(), "{:?}", report.bug);
    }

    #[test]
    fn fuzzing_watchdog_flags_a_stalled_program() {
        let config = Config::default()
            .with_fuzzing(true)
            .with_deadlock_timeout(Duration::from_millis(50));
        let mut engine = TestEngine::new(config).unwrap();

        // The body holds the virtual CPU without reaching a scheduling
        // point, which only the watchdog can notice.
        let report = engine
            .run(|_| std::thread::sleep(Duration::from_millis(400)))
            .unwrap();

        let bug = report.bug.expect("the watchdog sees no progress");
        assert_eq!(bug.kind, BugKind::Deadlock);
        assert!(bug.message.contains("no scheduling progress"), "{}", bug.message);
    }

    #[test]
    fn iterations_stop_when_dfs_exhausts_the_space() {
        let config = Config::default()
            .with_strategy(StrategyKind::Dfs)
            .with_iterations(100);
        let mut engine = TestEngine::new(config).unwrap();

        // One boolean choice: exactly two branches to explore.
        let report = engine
            .run(|rt| {
                let _ = rt.random_bool();
            })
            .unwrap();

        assert!(!report.found_bug());
        assert_eq!(report.iterations, 2);
    }

    #[test]
    fn delays_expire_through_virtual_time() {
        let mut engine = TestEngine::new(Config::default()).unwrap();
        let report = engine
            .run(|rt| {
                let task = rt.spawn(|rt| {
                    rt.delay();
                    7
                });
                let value = rt.join(&task).unwrap();
                rt.assert(value == 7, "the delayed task completed");
            })
            .unwrap();

        assert!(!report.found_bug(), "{:?}", report.bug);
    }

    #[test]
    fn wait_any_resumes_on_the_first_completion() {
        let mut engine = TestEngine::new(Config::default().with_iterations(10)).unwrap();
        let report = engine
            .run(|rt| {
                let slow = rt.spawn(|rt| {
                    for _ in 0..5 {
                        rt.yield_now();
                    }
                    1
                });
                let quick = rt.spawn(|_| 2);

                let index = rt.wait_any(&[slow.dep(), quick.dep()]);
                rt.assert(index < 2, "wait_any returned a valid index");

                rt.wait_all(&[slow.dep(), quick.dep()]);
                let total = rt.join(&slow).unwrap() + rt.join(&quick).unwrap();
                rt.assert(total == 3, "both tasks produced their values");
            })
            .unwrap();

        assert!(!report.found_bug(), "{:?}", report.bug);
    }

    #[test]
    fn unhandled_panics_surface_as_bugs() {
        let mut engine = TestEngine::new(Config::default()).unwrap();
        let report = engine
            .run(|rt| {
                let doomed = rt.spawn::<(), _>(|_| panic!("kaboom"));
                let _ = rt.join(&doomed);
            })
            .unwrap();

        let bug = report.bug.expect("the panic must be reported");
        assert_eq!(bug.kind, BugKind::UnhandledPanic);
        assert!(bug.message.contains("kaboom"), "{}", bug.message);
    }
}
