//! Systematic concurrency testing for message-passing programs.
//!
//! A test body runs inside a controlled runtime that owns every scheduling
//! decision, random choice, and delay. Execution is serialized onto a
//! single virtual CPU; across iterations a pluggable exploration strategy
//! drives the program through distinct interleavings, hunting for assertion
//! failures, deadlocks, and liveness violations. When a bug is found, the
//! schedule trace that produced it is captured and can be replayed
//! deterministically.
//!
//! ```no_run
//! use weft_runtime::{Config, TestEngine};
//!
//! let mut engine = TestEngine::new(Config::default().with_iterations(100))?;
//! let report = engine.run(|rt| {
//!     let task = rt.spawn(|_| 41);
//!     let value = rt.join(&task).unwrap();
//!     rt.assert(value + 1 == 42, "arithmetic still works");
//! })?;
//! assert!(!report.found_bug());
//! # anyhow::Ok(())
//! ```

pub mod actor;
mod config;
mod engine;
mod error;
pub mod flag;
mod monitor;
mod operation;
mod runtime;
mod scheduler;
pub mod strategy;
mod task;
pub mod trace;

pub use self::actor::{
    Actor, ActorContext, ActorId, DefaultEvent, Event, EventInfo, HaltEvent, StateDecl,
    StateMachine,
};
pub use self::config::{Config, StrategyKind};
pub use self::engine::{TestEngine, TestReport};
pub use self::flag::Signal;
pub use self::error::{catch_panic, BugKind, BugReport, ExecutionCanceled, ThreadInterrupted};
pub use self::monitor::{Monitor, MonitorContext, SpecificationEngine, StateStatus};
pub use self::operation::{BlockReason, OperationId, OperationStatus};
pub use self::runtime::Runtime;
pub use self::task::{ExternalSource, TaskDep, TaskHandle};
