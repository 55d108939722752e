#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Simwrap parallel evaluator – fans independent evaluations of a function
//! out over a worker pool and returns the outcomes in input order.
//!
//! ```no_run
//! use simwrap_parallel::{EvaluatorConfig, ParallelEvaluator};
//!
//! let config = EvaluatorConfig { n_jobs: Some(2), ..EvaluatorConfig::default() };
//! let evaluator = ParallelEvaluator::in_process(&config, |x: &i64| {
//!     Ok::<_, String>(x * x)
//! })
//! .unwrap();
//! let outcomes = evaluator.evaluate(vec![1, 2, 3, 4]).unwrap();
//! assert_eq!(outcomes.into_iter().map(Result::unwrap).collect::<Vec<_>>(), [1, 4, 9, 16]);
//! ```

/// Tasks, outcomes, futures and batch cancellation.
#[path = "../task.rs"]
pub mod task;

/// Evaluator configuration.
#[path = "../config.rs"]
pub mod config;

/// Worker pool abstraction and the inline pool.
#[path = "../pool.rs"]
pub mod pool;

/// Rayon-backed thread pool.
#[path = "../thread_pool.rs"]
pub mod thread_pool;

/// JSON-lines protocol spoken between pools and worker services.
#[path = "../wire.rs"]
pub mod wire;

/// Shared driver for process and remote pools.
#[path = "../link.rs"]
pub mod link;

/// Pool of local worker processes.
#[path = "../process_pool.rs"]
pub mod process_pool;

/// Pool of remote worker connections.
#[path = "../remote_pool.rs"]
pub mod remote_pool;

/// Worker side of the wire protocol.
#[path = "../worker.rs"]
pub mod worker;

/// The order-preserving batch evaluator.
#[path = "../evaluator.rs"]
pub mod evaluator;

/// Error-trapping decorator.
#[path = "../trap.rs"]
pub mod trap;

/// Memoizing decorator.
#[path = "../cache.rs"]
pub mod cache;

/// Structured batch telemetry.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use cache::Memoized;
pub use config::{
    available_workers, BackendKind, ConfigError, EvaluatorConfig, ProcessBackendConfig,
    RemoteBackendConfig,
};
pub use evaluator::{BatchAborted, ParallelEvaluator};
pub use link::LinkPool;
pub use pool::{eval_fn, EvalFn, PoolError, SequentialPool, WorkerPool};
pub use process_pool::spawn_process_pool;
pub use remote_pool::connect_remote_pool;
pub use task::{
    into_outputs, BatchControl, CancelToken, Completer, FailureKind, Task, TaskError, TaskFuture,
    TaskOutcome,
};
pub use telemetry::{EvaluatorTelemetry, EvaluatorTelemetryBuilder};
pub use thread_pool::ThreadPool;
pub use trap::trap;
pub use worker::{handler, serve_lines, serve_stdio, serve_tcp, WorkerHandler};
