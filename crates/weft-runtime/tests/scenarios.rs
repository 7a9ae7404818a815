//! End-to-end exploration scenarios, each with a deterministic seed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use weft_runtime::actor::{ActorCaps, DequeueVerdict, EventEnvelope, EventQueue};
use weft_runtime::trace::{ScheduleTrace, TraceEntry};
use weft_runtime::{
    event, Actor, ActorContext, ActorId, BugKind, Config, Event, EventInfo, ExternalSource,
    Monitor, MonitorContext, Runtime, StateDecl, StateMachine, StateStatus, TestEngine,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Two tasks race a read-modify-write on a shared counter, with one
/// scheduling point between the read and the write.
fn racy_counter(rt: &Runtime) {
    let counter = Arc::new(Mutex::new(0));

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let counter = counter.clone();
            rt.spawn(move |rt| {
                let value = *counter.lock();
                rt.explore_context_switch();
                *counter.lock() = value + 1;
            })
        })
        .collect();

    rt.wait_all(&[tasks[0].dep(), tasks[1].dep()]);

    let value = *counter.lock();
    rt.assert(value == 2, format!("lost update: counter is {value}"));
}

#[test]
fn scenario_a_race_on_a_shared_counter() {
    init_logging();
    let config = Config::default().with_seed(42).with_iterations(100);
    let mut engine = TestEngine::new(config).unwrap();
    let report = engine.run(racy_counter).unwrap();

    let bug = report.bug.expect("the lost update must be found within 100 iterations");
    assert_eq!(bug.kind, BugKind::Assertion);
    assert!(bug.message.contains("lost update"), "{}", bug.message);
    assert_eq!(bug.seed, 42);

    let trace = ScheduleTrace::parse(&bug.trace).unwrap();
    assert!(trace
        .entries()
        .iter()
        .any(|entry| matches!(entry, TraceEntry::Schedule(_))));
}

#[derive(Debug)]
struct Ping;
#[derive(Debug)]
struct Pong;
#[derive(Debug)]
struct Go;
event!(Ping, Pong, Go);

struct Waiter;

impl Actor for Waiter {
    fn on_event(
        &mut self,
        ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        if event.is::<Ping>() {
            // Wait for a Go that nobody ever sends.
            let _ = ctx.receive::<Go>()?;
        }

        Ok(())
    }
}

struct Pinger {
    peer: ActorId,
}

impl Actor for Pinger {
    fn on_start(&mut self, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
        ctx.send(self.peer, Ping);
        let _ = ctx.receive::<Pong>()?;
        Ok(())
    }

    fn on_event(
        &mut self,
        _ctx: &mut ActorContext<'_>,
        _event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn scenario_b_receive_wait_deadlock() {
    let config = Config::default().with_seed(1);
    let mut engine = TestEngine::new(config).unwrap();
    let report = engine
        .run(|rt| {
            let waiter = rt.create_actor("waiter", Waiter);
            rt.create_actor("pinger", Pinger { peer: waiter });
        })
        .unwrap();

    let bug = report.bug.expect("both actors wait forever");
    assert_eq!(bug.kind, BugKind::Deadlock);
    assert!(bug.message.contains("actor(0)"), "{}", bug.message);
    assert!(bug.message.contains("actor(1)"), "{}", bug.message);
    assert!(
        bug.message.contains("blocked-on-receive"),
        "{}",
        bug.message
    );
}

#[derive(Debug)]
struct BusyEvent;
#[derive(Debug)]
struct IdleEvent;
event!(BusyEvent, IdleEvent);

struct EscapeMonitor {
    working: bool,
}

impl Monitor for EscapeMonitor {
    fn name(&self) -> &str {
        "EscapeMonitor"
    }

    fn current_state(&self) -> &str {
        if self.working {
            "Working"
        } else {
            "Idle"
        }
    }

    fn status(&self) -> StateStatus {
        if self.working {
            StateStatus::Hot
        } else {
            StateStatus::Cold
        }
    }

    fn handle_event(&mut self, _ctx: &mut MonitorContext, event: &dyn Event) {
        if event.is::<BusyEvent>() {
            self.working = true;
        } else if event.is::<IdleEvent>() {
            self.working = false;
        }
    }
}

#[test]
fn scenario_c_hot_state_never_escapes() {
    let config = Config::default()
        .with_seed(3)
        .with_max_fair_steps(1000)
        .with_liveness_temperature_threshold(Some(200));

    let mut engine = TestEngine::new(config).unwrap();
    engine.register_monitor(|| EscapeMonitor { working: false });

    let report = engine
        .run(|rt| {
            rt.monitor::<EscapeMonitor>(&BusyEvent);
            // Never send IdleEvent; just keep the schedule alive.
            for _ in 0..1500 {
                rt.yield_now();
            }
        })
        .unwrap();

    let bug = report.bug.expect("the monitor is stuck hot");
    assert_eq!(bug.kind, BugKind::Liveness);
    assert!(bug.message.contains("EscapeMonitor"), "{}", bug.message);
    assert!(bug.message.contains("Working"), "{}", bug.message);

    // The violation fired before the fair step bound truncated the run.
    let trace = ScheduleTrace::parse(&bug.trace).unwrap();
    assert!(trace.len() < 1000);
}

#[derive(Debug)]
struct X;
#[derive(Debug)]
struct Y;
#[derive(Debug)]
struct Kick;
event!(X, Y, Kick);

/// Scenario D at the queue level, exactly as specified: defer in S1,
/// priority of the raised slot in S3, discard-on-ignore in S2.
#[test]
fn scenario_d_defer_ignore_raise_queue_semantics() {
    let queue = EventQueue::new();

    let mut s1 = ActorCaps::default();
    s1.state = "S1".to_string();
    s1.deferred.insert(std::any::TypeId::of::<X>());

    queue.enqueue(EventEnvelope::new(Arc::new(X)), &s1).unwrap();
    queue.enqueue(EventEnvelope::new(Arc::new(Y)), &s1).unwrap();
    queue.enqueue(EventEnvelope::new(Arc::new(X)), &s1).unwrap();

    // In S1 the dequeue skips the deferred X and finds Y.
    let verdict = queue.dequeue(&s1);
    assert!(matches!(verdict, DequeueVerdict::Success(env) if env.event.is::<Y>()));

    // S3 raises Y; the raised slot has priority over the queued X events.
    let mut s3 = ActorCaps::default();
    s3.state = "S3".to_string();
    queue.raise(EventEnvelope::new(Arc::new(Y)));
    let verdict = queue.dequeue(&s3);
    assert!(matches!(verdict, DequeueVerdict::Raised(env) if env.event.is::<Y>()));

    // In S2 both X events are ignored and discarded; the queue drains.
    let mut s2 = ActorCaps::default();
    s2.state = "S2".to_string();
    s2.ignored.insert(std::any::TypeId::of::<X>());
    assert!(matches!(queue.dequeue(&s2), DequeueVerdict::NotAvailable));
    assert_eq!(queue.len(), 0);
}

struct DeferLog {
    entries: Arc<Mutex<Vec<String>>>,
    settled: Arc<AtomicBool>,
}

fn log_s1_y(
    behavior: &mut DeferLog,
    _ctx: &mut ActorContext<'_>,
    _event: &Arc<dyn Event>,
) -> anyhow::Result<()> {
    behavior.entries.lock().push("S1:Y".to_string());
    Ok(())
}

fn enter_s3(behavior: &mut DeferLog, ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
    behavior.entries.lock().push("S3:entry".to_string());
    ctx.raise(Y);
    Ok(())
}

fn log_s3_y(
    behavior: &mut DeferLog,
    _ctx: &mut ActorContext<'_>,
    _event: &Arc<dyn Event>,
) -> anyhow::Result<()> {
    behavior.entries.lock().push("S3:Y".to_string());
    Ok(())
}

fn enter_s2(behavior: &mut DeferLog, _ctx: &mut ActorContext<'_>) -> anyhow::Result<()> {
    behavior.entries.lock().push("S2:entry".to_string());
    behavior.settled.store(true, Ordering::SeqCst);
    Ok(())
}

#[test]
fn scenario_d_defer_ignore_raise_end_to_end() {
    let entries = Arc::new(Mutex::new(Vec::new()));
    let settled = Arc::new(AtomicBool::new(false));

    let log = entries.clone();
    let flag = settled.clone();
    let config = Config::default().with_seed(11);
    let mut engine = TestEngine::new(config).unwrap();

    let report = engine
        .run(move |rt| {
            let machine = StateMachine::new(
                DeferLog {
                    entries: log.clone(),
                    settled: flag.clone(),
                },
                "S0",
                vec![
                    // Gate: hold everything back until the Kick arrives, so
                    // the whole drain happens in one turn.
                    StateDecl::new("S0")
                        .defer::<X>()
                        .defer::<Y>()
                        .on_goto::<Kick>("S1"),
                    StateDecl::new("S1")
                        .defer::<X>()
                        .on_goto_with::<Y>("S3", log_s1_y),
                    StateDecl::new("S3")
                        .on_entry(enter_s3)
                        .on_goto_with::<Y>("S2", log_s3_y),
                    StateDecl::new("S2").on_entry(enter_s2).ignore::<X>(),
                ],
            );

            let actor = rt.create_state_machine("deferrer", machine);
            rt.send_event(actor, X);
            rt.send_event(actor, Y);
            rt.send_event(actor, X);
            rt.send_event(actor, Kick);

            while !(flag.load(Ordering::SeqCst) && rt.actor_queue_len(actor) == Some(0)) {
                rt.yield_now();
            }
        })
        .unwrap();

    assert!(!report.found_bug(), "{:?}", report.bug);
    assert_eq!(
        *entries.lock(),
        vec!["S1:Y", "S3:entry", "S3:Y", "S2:entry"]
    );
}

#[test]
fn scenario_e_replay_fidelity() {
    let config = Config::default().with_seed(7).with_iterations(100);
    let mut engine = TestEngine::new(config).unwrap();
    let report = engine.run(racy_counter).unwrap();
    let original = report.bug.expect("the race is found with seed 7");

    let replayed = TestEngine::replay(Config::default().with_seed(7), &original.trace, racy_counter)
        .unwrap()
        .bug
        .expect("the replay reproduces the bug");

    assert_eq!(replayed.kind, original.kind);
    assert_eq!(replayed.message, original.message);
    // The serialized trace of the replay is byte-identical to the captured
    // one: the bug fires at the same step index.
    assert_eq!(replayed.trace, original.trace);
}

#[test]
fn scenario_f_portfolio_stops_on_first_bug() {
    let config = Config::default()
        .with_seed(42)
        .with_iterations(200)
        .with_portfolio_size(4);

    let report = TestEngine::portfolio(config, racy_counter).unwrap();

    // Exactly one bug is reported, no matter how many runners found one.
    let bug = report.bug.expect("some runner finds the race");
    assert_eq!(bug.kind, BugKind::Assertion);
    assert!(report.iterations > 0);
}

// Boundary behaviors.

#[test]
fn trivial_test_without_scheduling_points_completes() {
    let mut engine = TestEngine::new(Config::default()).unwrap();
    let report = engine.run(|_| {}).unwrap();
    assert!(!report.found_bug());
}

#[test]
fn step_bound_detaches_silently_by_default() {
    let config = Config::default().with_seed(5).with_max_fair_steps(50);
    let mut engine = TestEngine::new(config).unwrap();
    let report = engine
        .run(|rt| {
            for _ in 0..200 {
                rt.yield_now();
            }
        })
        .unwrap();

    assert!(!report.found_bug());
}

#[test]
fn step_bound_is_a_bug_when_configured() {
    let config = Config::default()
        .with_seed(5)
        .with_max_fair_steps(50)
        .with_depth_bound_hit_as_bug(true);
    let mut engine = TestEngine::new(config).unwrap();
    let report = engine
        .run(|rt| {
            for _ in 0..200 {
                rt.yield_now();
            }
        })
        .unwrap();

    let bug = report.bug.expect("the bound is treated as a bug");
    assert_eq!(bug.kind, BugKind::DepthBoundHit);

    // Step-bound respect: the trace never outgrows the configured bound.
    let trace = ScheduleTrace::parse(&bug.trace).unwrap();
    assert!(trace.len() <= 50, "trace has {} entries", trace.len());
}

struct Sink;

impl Actor for Sink {
    fn on_event(
        &mut self,
        _ctx: &mut ActorContext<'_>,
        _event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn halted_actor_dropping_a_must_handle_event_is_a_bug() {
    let mut engine = TestEngine::new(Config::default().with_seed(2)).unwrap();
    let report = engine
        .run(|rt| {
            let sink = rt.create_actor("sink", Sink);
            rt.halt_actor(sink);
            rt.send_event_with_info(
                sink,
                X,
                EventInfo {
                    assert_limit: None,
                    must_handle: true,
                },
            );
            while rt.is_actor_halted(sink) != Some(true) {
                rt.yield_now();
            }
        })
        .unwrap();

    let bug = report.bug.expect("dropping a must-handle event is a bug");
    assert_eq!(bug.kind, BugKind::Assertion);
    assert!(bug.message.contains("must-handle"), "{}", bug.message);
}

#[derive(Debug)]
struct Data(u32);
#[derive(Debug)]
struct Trigger;
event!(Data, Trigger);

struct SyncReceive {
    seen: Arc<Mutex<Vec<u32>>>,
}

fn on_trigger(
    behavior: &mut SyncReceive,
    ctx: &mut ActorContext<'_>,
    _event: &Arc<dyn Event>,
) -> anyhow::Result<()> {
    // Data is already queued, so this completes without blocking.
    let event = ctx.receive_where::<Data>(|data| data.0 > 1)?;
    let value = event.downcast_ref::<Data>().map(|data| data.0).unwrap_or(0);
    behavior.seen.lock().push(value);
    Ok(())
}

#[test]
fn receive_returns_synchronously_when_the_event_is_queued() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observed = seen.clone();

    let mut engine = TestEngine::new(Config::default().with_seed(4)).unwrap();
    let report = engine
        .run(move |rt| {
            let machine = StateMachine::new(
                SyncReceive {
                    seen: observed.clone(),
                },
                "S1",
                vec![StateDecl::new("S1")
                    .defer::<Data>()
                    .on::<Trigger>(on_trigger)],
            );

            let actor = rt.create_state_machine("receiver", machine);
            rt.send_event(actor, Data(5));
            rt.send_event(actor, Trigger);
            while rt.actor_queue_len(actor) != Some(0) {
                rt.yield_now();
            }
        })
        .unwrap();

    assert!(!report.found_bug(), "{:?}", report.bug);
    assert_eq!(*seen.lock(), vec![5]);
}

#[derive(Debug)]
struct Num(u32);
event!(Num);

struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Actor for Recorder {
    fn on_event(
        &mut self,
        _ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        if let Some(num) = event.downcast_ref::<Num>() {
            self.seen.lock().push(num.0);
        }

        Ok(())
    }
}

/// Per-actor delivery is FIFO regardless of the explored schedule.
#[test]
fn events_from_one_sender_arrive_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    for seed in 0..10 {
        seen.lock().clear();
        let observed = seen.clone();

        let mut engine = TestEngine::new(Config::default().with_seed(seed)).unwrap();
        let report = engine
            .run(move |rt| {
                let actor = rt.create_actor(
                    "recorder",
                    Recorder {
                        seen: observed.clone(),
                    },
                );
                rt.send_event(actor, Num(1));
                rt.send_event(actor, Num(2));
                rt.send_event(actor, Num(3));
                while rt.actor_queue_len(actor) != Some(0) {
                    rt.yield_now();
                }
            })
            .unwrap();

        assert!(!report.found_bug());
        assert_eq!(*seen.lock(), vec![1, 2, 3], "seed {seed}");
    }
}

#[test]
fn uncontrolled_dependency_deadlocks_without_relaxed_mode() {
    let mut engine = TestEngine::new(Config::default().with_seed(6)).unwrap();
    let report = engine
        .run(|rt| {
            let source = ExternalSource::new();
            let dep = source.dep();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(500));
                source.complete();
            });
            rt.wait_all(&[dep]);
        })
        .unwrap();

    let bug = report.bug.expect("strict mode cannot wait out native work");
    assert_eq!(bug.kind, BugKind::Deadlock);
}

#[test]
fn relaxed_mode_waits_out_uncontrolled_dependencies() {
    let config = Config::default()
        .with_seed(6)
        .with_relaxed_controlled_testing(true)
        .with_relaxed_retry_limit(200);
    let mut engine = TestEngine::new(config).unwrap();

    let report = engine
        .run(|rt| {
            let source = ExternalSource::new();
            let dep = source.dep();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                source.complete();
            });
            rt.wait_all(&[dep]);
        })
        .unwrap();

    assert!(!report.found_bug(), "{:?}", report.bug);
}

#[test]
fn scheduling_from_an_unregistered_thread_is_an_internal_error() {
    let config = Config::default().with_seed(8).with_max_fair_steps(0);
    let mut engine = TestEngine::new(config).unwrap();

    let result = engine.run(|rt| {
        let handle = Runtime::current().expect("inside a controlled operation");
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.explore_context_switch();
        });

        loop {
            rt.yield_now();
        }
    });

    let error = result.expect_err("uncontrolled scheduling is fatal");
    assert!(error.to_string().contains("invalid"), "{error:#}");
}

#[derive(Debug)]
struct Stop;
event!(Stop);

struct SelfHalting;

impl Actor for SelfHalting {
    fn on_event(
        &mut self,
        ctx: &mut ActorContext<'_>,
        event: &Arc<dyn Event>,
    ) -> anyhow::Result<()> {
        if event.is::<Stop>() {
            ctx.halt();
        }

        Ok(())
    }
}

#[test]
fn a_halted_actor_silently_drops_ordinary_events() {
    let mut engine = TestEngine::new(Config::default().with_seed(14)).unwrap();
    let report = engine
        .run(|rt| {
            let actor = rt.create_actor("stopper", SelfHalting);
            rt.send_event(actor, Stop);
            while rt.is_actor_halted(actor) != Some(true) {
                rt.yield_now();
            }

            // Without the must-handle flag the drop is silent.
            rt.send_event(actor, X);
            rt.assert(
                rt.actor_queue_len(actor) == Some(0),
                "the closed queue buffers nothing",
            );
        })
        .unwrap();

    assert!(!report.found_bug(), "{:?}", report.bug);
}

#[test]
fn a_signal_wakes_operations_blocked_on_it() {
    let mut engine = TestEngine::new(Config::default().with_seed(12).with_iterations(20)).unwrap();
    let report = engine
        .run(|rt| {
            let ready = weft_runtime::Signal::new();

            let waiter_signal = ready.clone();
            let waiter = rt.spawn(move |rt| {
                waiter_signal.wait(rt);
                waiter_signal.is_raised()
            });

            let setter_signal = ready.clone();
            let setter = rt.spawn(move |rt| {
                rt.yield_now();
                setter_signal.raise(rt);
            });

            let observed = rt.join(&waiter).unwrap();
            rt.assert(observed, "the waiter resumed after the raise");
            rt.join(&setter).unwrap();
        })
        .unwrap();

    assert!(!report.found_bug(), "{:?}", report.bug);
}

#[test]
fn waiting_forever_on_a_signal_is_a_resource_deadlock() {
    let mut engine = TestEngine::new(Config::default().with_seed(13)).unwrap();
    let report = engine
        .run(|rt| {
            let never = weft_runtime::Signal::new();
            never.wait(rt);
        })
        .unwrap();

    let bug = report.bug.expect("nobody raises the signal");
    assert_eq!(bug.kind, BugKind::Deadlock);
    assert!(
        bug.message.contains("blocked-on-resource"),
        "{}",
        bug.message
    );
}

#[test]
fn random_choices_are_recorded_and_replayable() {
    let picks = |rt: &Runtime| {
        let flip = rt.random_bool();
        let number = rt.random_integer(10);
        rt.assert(
            !(flip && number > 7),
            format!("bad draw: {flip} and {number}"),
        );
    };

    let config = Config::default().with_seed(9).with_iterations(500);
    let mut engine = TestEngine::new(config).unwrap();
    let report = engine.run(picks).unwrap();

    let bug = report
        .bug
        .expect("the bad draw combination turns up within 500 iterations");
    let trace = ScheduleTrace::parse(&bug.trace).unwrap();
    assert!(trace
        .entries()
        .iter()
        .any(|entry| matches!(entry, TraceEntry::Boolean(_))));
    assert!(trace
        .entries()
        .iter()
        .any(|entry| matches!(entry, TraceEntry::Integer(_))));

    let replayed = TestEngine::replay(Config::default().with_seed(9), &bug.trace, picks)
        .unwrap()
        .bug
        .expect("the replay reproduces the draw");
    assert_eq!(replayed.message, bug.message);
}
