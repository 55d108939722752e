use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use thiserror::Error;

use crate::{
    config::{BackendKind, ConfigError},
    task::{BatchControl, Task, TaskError, TaskFuture, TaskOutcome},
};

/// Errors raised while building a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The constructor cannot build this backend.
    #[error("backend `{0}` is not supported by this constructor")]
    Unsupported(BackendKind),
    /// Rayon refused to build the thread pool.
    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
    /// The async runtime driving worker links failed to start.
    #[error("failed to start link runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// A worker process could not be started.
    #[error("failed to spawn worker `{program}`: {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A remote worker could not be reached.
    #[error("failed to connect to worker {address}: {reason}")]
    Connect {
        /// Worker address.
        address: String,
        /// Cause.
        reason: String,
    },
    /// The batch log could not be opened.
    #[error("failed to open batch log: {0}")]
    Telemetry(String),
    /// A worker did not announce itself correctly.
    #[error("worker {link} handshake failed: {reason}")]
    Handshake {
        /// Link label.
        link: String,
        /// Cause.
        reason: String,
    },
}

/// Backend that runs tasks: one capability, submit a task and get a future.
///
/// Implementations must complete every submitted future exactly once and must
/// consult [`BatchControl`] before starting a task so fail-fast batches can
/// skip queued work.
pub trait WorkerPool<I, O>: Send + Sync {
    /// Backend implemented by this pool.
    fn kind(&self) -> BackendKind;

    /// Number of tasks the pool runs concurrently.
    fn workers(&self) -> usize;

    /// Queues `task`, returning a handle to its outcome.
    fn submit(&self, task: Task<I>, control: &BatchControl) -> TaskFuture<O>;
}

/// Type-erased evaluation function with stringified errors.
pub type EvalFn<I, O> = Arc<dyn Fn(&I) -> Result<O, String> + Send + Sync>;

/// Erases the error type of `f`.
#[must_use]
pub fn eval_fn<I, O, E, F>(f: F) -> EvalFn<I, O>
where
    I: 'static,
    O: 'static,
    E: fmt::Display,
    F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
{
    Arc::new(move |input: &I| f(input).map_err(|err| err.to_string()))
}

/// Calls `f`, turning errors and panics into task markers.
pub(crate) fn guarded_call<I, O>(index: usize, f: &EvalFn<I, O>, input: &I) -> TaskOutcome<O> {
    match panic::catch_unwind(AssertUnwindSafe(|| f(input))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(message)) => Err(TaskError::evaluation(index, message)),
        Err(payload) => Err(TaskError::panicked(index, payload.as_ref())),
    }
}

/// Evaluates each task inline, on the submitting thread.
pub struct SequentialPool<I, O> {
    f: EvalFn<I, O>,
}

impl<I, O> SequentialPool<I, O> {
    /// Wraps an evaluation function.
    #[must_use]
    pub fn new(f: EvalFn<I, O>) -> Self {
        Self { f }
    }
}

impl<I, O> fmt::Debug for SequentialPool<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialPool").finish_non_exhaustive()
    }
}

impl<I, O> WorkerPool<I, O> for SequentialPool<I, O> {
    fn kind(&self) -> BackendKind {
        BackendKind::Sequential
    }

    fn workers(&self) -> usize {
        1
    }

    fn submit(&self, task: Task<I>, control: &BatchControl) -> TaskFuture<O> {
        let Task { index, input } = task;
        let outcome = control.run(index, || guarded_call(index, &self.f, &input));
        TaskFuture::ready(index, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FailureKind;

    #[test]
    fn sequential_pool_traps_errors_and_panics() {
        let pool = SequentialPool::new(eval_fn(|x: &i32| match *x {
            0 => Err("zero".to_string()),
            13 => panic!("unlucky input"),
            x => Ok(x * 2),
        }));
        let control = BatchControl::new(false);
        assert_eq!(pool.submit(Task::new(0, 4), &control).wait(), Ok(8));
        let err = pool.submit(Task::new(1, 0), &control).wait().unwrap_err();
        assert_eq!((err.index, err.kind), (1, FailureKind::Evaluation));
        let err = pool.submit(Task::new(2, 13), &control).wait().unwrap_err();
        assert_eq!(err.kind, FailureKind::Panicked);
        assert!(err.message.contains("unlucky input"));
    }

    #[test]
    fn sequential_pool_skips_after_cancellation() {
        let pool = SequentialPool::new(eval_fn(|x: &i32| Ok::<_, String>(*x)));
        let control = BatchControl::new(true);
        control.token().cancel();
        let err = pool.submit(Task::new(0, 1), &control).wait().unwrap_err();
        assert!(err.is_cancelled());
    }
}
