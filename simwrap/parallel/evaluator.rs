use std::{error::Error, fmt, time::Instant};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{BackendKind, EvaluatorConfig},
    pool::{eval_fn, PoolError, SequentialPool, WorkerPool},
    process_pool::spawn_process_pool,
    remote_pool::connect_remote_pool,
    task::{BatchControl, Task, TaskError, TaskFuture, TaskOutcome},
    telemetry::EvaluatorTelemetry,
    thread_pool::ThreadPool,
};

const TELEMETRY_MODULE: &str = "simwrap.evaluator";

/// Fail-fast batch that stopped after at least one task failed.
///
/// Nothing is discarded: every real failure, the indices of tasks skipped by
/// cancellation and the outputs that did complete are all kept.
#[derive(Debug)]
pub struct BatchAborted<O> {
    /// Lowest-index failure that was not a cancellation.
    pub first_failure: TaskError,
    /// Every failure that was not a cancellation, in index order.
    pub failures: Vec<TaskError>,
    /// Indices of tasks skipped after cancellation.
    pub cancelled: Vec<usize>,
    /// Completed outputs at their input index.
    pub partial: Vec<Option<O>>,
}

impl<O> BatchAborted<O> {
    fn new(first_failure: TaskError, outcomes: Vec<TaskOutcome<O>>) -> Self {
        let mut failures = Vec::new();
        let mut cancelled = Vec::new();
        let partial = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Ok(output) => Some(output),
                Err(err) if err.is_cancelled() => {
                    cancelled.push(err.index);
                    None
                }
                Err(err) => {
                    failures.push(err);
                    None
                }
            })
            .collect();
        Self {
            first_failure,
            failures,
            cancelled,
            partial,
        }
    }

    /// Number of tasks that produced an output.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.partial.iter().filter(|slot| slot.is_some()).count()
    }
}

impl<O> fmt::Display for BatchAborted<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch aborted after {} failure(s) with {} task(s) cancelled; first: {}",
            self.failures.len(),
            self.cancelled.len(),
            self.first_failure
        )
    }
}

impl<O: fmt::Debug> Error for BatchAborted<O> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.first_failure)
    }
}

/// Evaluates a batch of independent inputs on a worker pool and returns the
/// outcomes in input order.
///
/// Every task is tagged with its input index before dispatch and its outcome
/// is written to that slot, so completion order never leaks into the result.
/// Failures become [`TaskError`] markers at their index unless fail-fast is
/// on, in which case the batch returns [`BatchAborted`].
pub struct ParallelEvaluator<I, O> {
    pool: Box<dyn WorkerPool<I, O>>,
    fail_fast: bool,
    telemetry: Option<EvaluatorTelemetry>,
}

impl<I, O> fmt::Debug for ParallelEvaluator<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelEvaluator")
            .field("backend", &self.pool.kind())
            .field("workers", &self.pool.workers())
            .field("fail_fast", &self.fail_fast)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

fn telemetry_for(config: &EvaluatorConfig) -> Result<Option<EvaluatorTelemetry>, PoolError> {
    config
        .log_path
        .as_ref()
        .map(|path| {
            EvaluatorTelemetry::builder(TELEMETRY_MODULE)
                .log_path(path)
                .min_level(config.verbosity)
                .build()
                .map_err(|err| PoolError::Telemetry(format!("{err:#}")))
        })
        .transpose()
}

impl<I, O> ParallelEvaluator<I, O> {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: Box<dyn WorkerPool<I, O>>, fail_fast: bool) -> Self {
        Self {
            pool,
            fail_fast,
            telemetry: None,
        }
    }

    /// Writes batch records through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EvaluatorTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Backend of the underlying pool.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.pool.kind()
    }

    /// Concurrency of the underlying pool.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// Whether the first failure aborts the batch.
    #[must_use]
    pub const fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    fn record(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.log(level, message, metadata) {
                warn!(error = %err, "failed to write batch record");
            }
        }
    }

    /// Evaluates every input, blocking until all tasks finished or were
    /// cancelled.
    ///
    /// `result[i]` always belongs to `input[i]`. An empty batch returns an
    /// empty vector without touching the pool.
    pub fn evaluate<T>(&self, inputs: T) -> Result<Vec<TaskOutcome<O>>, BatchAborted<O>>
    where
        T: IntoIterator<Item = I>,
    {
        let inputs: Vec<I> = inputs.into_iter().collect();
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let batch = Uuid::new_v4();
        let total = inputs.len();
        let backend = self.pool.kind();
        let workers = self.pool.workers();
        let started = Instant::now();
        info!(%batch, tasks = total, %backend, workers, fail_fast = self.fail_fast, "batch started");
        self.record(
            LogLevel::Info,
            "evaluation.batch.start",
            json!({
                "batch": batch,
                "tasks": total,
                "backend": backend,
                "workers": workers,
                "fail_fast": self.fail_fast,
            }),
        );

        let control = BatchControl::new(self.fail_fast);
        let futures: Vec<TaskFuture<O>> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| self.pool.submit(Task::new(index, input), &control))
            .collect();

        let mut slots: Vec<Option<TaskOutcome<O>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        for future in futures {
            let index = future.index();
            let outcome = future.wait();
            if let Err(err) = &outcome {
                if !err.is_cancelled() {
                    warn!(%batch, index = err.index, kind = %err.kind, message = %err.message, "task failed");
                    self.record(
                        LogLevel::Warn,
                        "evaluation.task.failed",
                        json!({
                            "batch": batch,
                            "index": err.index,
                            "kind": err.kind,
                            "message": err.message,
                        }),
                    );
                }
            }
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(outcome);
            }
        }
        let outcomes: Vec<TaskOutcome<O>> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| Err(TaskError::worker_lost(index, "no outcome recorded")))
            })
            .collect();

        let failed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(err) if !err.is_cancelled()))
            .count();
        let cancelled = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(err) if err.is_cancelled()))
            .count();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = json!({
            "batch": batch,
            "tasks": total,
            "succeeded": total - failed - cancelled,
            "failed": failed,
            "cancelled": cancelled,
            "elapsed_ms": elapsed_ms,
        });

        let first_failure = outcomes
            .iter()
            .find_map(|outcome| outcome.as_ref().err().filter(|err| !err.is_cancelled()))
            .cloned();
        if self.fail_fast {
            if let Some(first_failure) = first_failure {
                warn!(%batch, failed, cancelled, elapsed_ms, "batch aborted");
                self.record(LogLevel::Error, "evaluation.batch.aborted", summary);
                return Err(BatchAborted::new(first_failure, outcomes));
            }
        }
        info!(%batch, failed, elapsed_ms, "batch completed");
        self.record(LogLevel::Info, "evaluation.batch.completed", summary);
        Ok(outcomes)
    }
}

impl<I, O> ParallelEvaluator<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Builds an evaluator running `f` in this process.
    ///
    /// One worker (or the `sequential` backend) evaluates inline; more use a
    /// thread pool. Out-of-process backends are rejected.
    pub fn in_process<E, F>(config: &EvaluatorConfig, f: F) -> Result<Self, PoolError>
    where
        E: fmt::Display,
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
    {
        if config.backend.is_out_of_process() {
            return Err(PoolError::Unsupported(config.backend));
        }
        config.validate()?;
        let f = eval_fn(f);
        let workers = config.effective_jobs();
        let pool: Box<dyn WorkerPool<I, O>> =
            if config.backend == BackendKind::Sequential || workers == 1 {
                Box::new(SequentialPool::new(f))
            } else {
                Box::new(ThreadPool::new(workers, f)?)
            };
        let mut evaluator = Self::new(pool, config.fail_fast);
        evaluator.telemetry = telemetry_for(config)?;
        Ok(evaluator)
    }
}

impl<I, O> ParallelEvaluator<I, O>
where
    I: Serialize + Send + 'static,
    O: DeserializeOwned + Send + 'static,
{
    /// Builds an evaluator whose tasks run in worker processes or on remote
    /// worker services. In-process backends are rejected.
    pub fn out_of_process(config: &EvaluatorConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let workers = config.effective_jobs();
        let expect_model = config.expect_model.as_deref();
        let pool: Box<dyn WorkerPool<I, O>> = match config.backend {
            BackendKind::Processes => {
                Box::new(spawn_process_pool(&config.process, workers, expect_model)?)
            }
            BackendKind::Remote => {
                Box::new(connect_remote_pool(&config.remote, workers, expect_model)?)
            }
            other => return Err(PoolError::Unsupported(other)),
        };
        let mut evaluator = Self::new(pool, config.fail_fast);
        evaluator.telemetry = telemetry_for(config)?;
        Ok(evaluator)
    }

    /// Builds the evaluator for whichever backend `config` selects. `f` is
    /// only used by in-process backends; out-of-process workers evaluate with
    /// their own copy of the function.
    pub fn from_config<E, F>(config: &EvaluatorConfig, f: F) -> Result<Self, PoolError>
    where
        E: fmt::Display,
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
    {
        if config.backend.is_out_of_process() {
            Self::out_of_process(config)
        } else {
            Self::in_process(config, f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RemoteBackendConfig,
        task::{into_outputs, FailureKind},
        worker::{handler, serve_tcp},
    };
    use proptest::prelude::*;
    use std::{thread, time::Duration};

    fn threads(n_jobs: usize, fail_fast: bool) -> EvaluatorConfig {
        EvaluatorConfig {
            backend: BackendKind::Threads,
            n_jobs: Some(n_jobs),
            fail_fast,
            ..EvaluatorConfig::default()
        }
    }

    fn ten_over(x: &f64) -> Result<f64, String> {
        if *x == 0.0 {
            Err("division by zero".into())
        } else {
            Ok(10.0 / x)
        }
    }

    #[test]
    fn squares_keep_input_order() {
        let evaluator = ParallelEvaluator::in_process(&threads(2, false), |x: &i64| {
            Ok::<_, String>(x * x)
        })
        .unwrap();
        assert_eq!(evaluator.backend(), BackendKind::Threads);
        let outputs = into_outputs(evaluator.evaluate(vec![1, 2, 3, 4]).unwrap()).unwrap();
        assert_eq!(outputs, vec![1, 4, 9, 16]);
    }

    #[test]
    fn failures_are_embedded_at_their_index() {
        let evaluator = ParallelEvaluator::in_process(&threads(2, false), ten_over).unwrap();
        let outcomes = evaluator.evaluate(vec![1.0, 0.0, 2.0]).unwrap();
        assert_eq!(outcomes[0], Ok(10.0));
        let err = outcomes[1].clone().unwrap_err();
        assert_eq!((err.index, err.kind), (1, FailureKind::Evaluation));
        assert!(err.message.contains("division by zero"));
        assert_eq!(outcomes[2], Ok(5.0));
    }

    #[test]
    fn fail_fast_returns_aggregate_with_partial_results() {
        let config = EvaluatorConfig {
            backend: BackendKind::Sequential,
            fail_fast: true,
            ..EvaluatorConfig::default()
        };
        let evaluator = ParallelEvaluator::in_process(&config, ten_over).unwrap();
        let aborted = evaluator.evaluate(vec![1.0, 0.0, 2.0, 5.0]).unwrap_err();
        assert_eq!(aborted.first_failure.index, 1);
        assert_eq!(aborted.failures.len(), 1);
        assert_eq!(aborted.cancelled, vec![2, 3]);
        assert_eq!(aborted.partial, vec![Some(10.0), None, None, None]);
        assert_eq!(aborted.completed(), 1);
        assert!(aborted.to_string().contains("task 1 evaluation"));
        assert!(aborted.source().is_some());
    }

    #[test]
    fn fail_fast_on_threads_keeps_only_correct_outputs() {
        let evaluator = ParallelEvaluator::in_process(&threads(2, true), |x: &u64| {
            thread::sleep(Duration::from_millis(5));
            if *x == 3 {
                Err(format!("bad input {x}"))
            } else {
                Ok(x + 100)
            }
        })
        .unwrap();
        let aborted = evaluator.evaluate(0..40_u64).unwrap_err();
        assert_eq!(aborted.first_failure.index, 3);
        assert_eq!(aborted.partial.len(), 40);
        for (index, slot) in aborted.partial.iter().enumerate() {
            if let Some(output) = slot {
                assert_eq!(*output, index as u64 + 100);
            }
        }
        assert!(!aborted.cancelled.is_empty());
    }

    struct UntouchablePool;

    impl WorkerPool<u8, u8> for UntouchablePool {
        fn kind(&self) -> BackendKind {
            BackendKind::Threads
        }

        fn workers(&self) -> usize {
            1
        }

        fn submit(&self, _task: Task<u8>, _control: &BatchControl) -> TaskFuture<u8> {
            panic!("empty batches must not reach the pool");
        }
    }

    #[test]
    fn empty_batch_skips_the_pool() {
        let evaluator = ParallelEvaluator::new(Box::new(UntouchablePool), true);
        assert!(evaluator.evaluate(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn repeated_batches_are_identical() {
        let evaluator = ParallelEvaluator::in_process(&threads(4, false), |x: &i32| {
            if x % 7 == 0 {
                Err("multiple of seven")
            } else {
                Ok(x * 3)
            }
        })
        .unwrap();
        let first = evaluator.evaluate(0..50).unwrap();
        let second = evaluator.evaluate(0..50).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn single_worker_runs_inline() {
        let evaluator =
            ParallelEvaluator::in_process(&threads(1, false), |x: &i32| Ok::<_, String>(*x))
                .unwrap();
        assert_eq!(evaluator.backend(), BackendKind::Sequential);
        assert_eq!(evaluator.workers(), 1);
    }

    #[test]
    fn in_process_rejects_out_of_process_backends() {
        let config = EvaluatorConfig {
            backend: BackendKind::Remote,
            ..EvaluatorConfig::default()
        };
        let err = ParallelEvaluator::in_process(&config, |x: &i32| Ok::<_, String>(*x))
            .unwrap_err();
        assert!(matches!(err, PoolError::Unsupported(BackendKind::Remote)));
        let err = ParallelEvaluator::<i32, i32>::out_of_process(&threads(2, false)).unwrap_err();
        assert!(matches!(err, PoolError::Unsupported(BackendKind::Threads)));
    }

    #[test]
    fn failures_are_written_to_the_batch_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("batch.jsonl");
        let config = EvaluatorConfig {
            log_path: Some(log_path.clone()),
            ..threads(2, false)
        };
        let evaluator = ParallelEvaluator::in_process(&config, ten_over).unwrap();
        evaluator.evaluate(vec![2.0, 0.0]).unwrap();
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("evaluation.batch.start"));
        assert!(content.contains("evaluation.task.failed"));
        assert!(content.contains("\"index\":1"));
        assert!(content.contains("evaluation.batch.completed"));
    }

    fn ten_over_service() -> std::net::SocketAddr {
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                let _ = serve_tcp(listener, "ten-over".into(), handler(ten_over)).await;
            });
        });
        rx.recv().unwrap()
    }

    fn remote_config(address: std::net::SocketAddr, n_jobs: usize, fail_fast: bool) -> EvaluatorConfig {
        EvaluatorConfig {
            backend: BackendKind::Remote,
            n_jobs: Some(n_jobs),
            fail_fast,
            expect_model: Some("ten-over".into()),
            remote: RemoteBackendConfig {
                workers: vec![address.to_string()],
                ..RemoteBackendConfig::default()
            },
            ..EvaluatorConfig::default()
        }
    }

    #[test]
    fn remote_backend_matches_threads() {
        let address = ten_over_service();
        let remote = ParallelEvaluator::from_config(&remote_config(address, 2, false), ten_over).unwrap();
        assert_eq!(remote.backend(), BackendKind::Remote);
        let local = ParallelEvaluator::in_process(&threads(2, false), ten_over).unwrap();
        let inputs = vec![1.0, 0.0, 2.0, 4.0, 0.5];
        let remote_outcomes = remote.evaluate(inputs.clone()).unwrap();
        let local_outcomes = local.evaluate(inputs).unwrap();
        assert_eq!(remote_outcomes, local_outcomes);
    }

    #[test]
    fn remote_fail_fast_skips_queued_tasks() {
        let address = ten_over_service();
        let evaluator = ParallelEvaluator::from_config(&remote_config(address, 1, true), ten_over).unwrap();
        let aborted = evaluator
            .evaluate(vec![1.0, 0.0, 2.0, 4.0, 5.0])
            .unwrap_err();
        assert_eq!(aborted.first_failure.index, 1);
        assert_eq!(aborted.first_failure.kind, FailureKind::Evaluation);
        assert_eq!(aborted.failures.len(), 1);
        assert_eq!(aborted.cancelled, vec![2, 3, 4]);
        assert_eq!(aborted.partial, vec![Some(10.0), None, None, None, None]);
        assert_eq!(aborted.completed(), 1);

        // The same connection serves the next batch.
        let outcomes = evaluator.evaluate(vec![2.0, 5.0]).unwrap();
        assert_eq!(outcomes, vec![Ok(5.0), Ok(2.0)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn output_order_does_not_depend_on_workers(
            inputs in prop::collection::vec(-1_000_i64..1_000, 0..48),
            workers in prop::sample::select(vec![1_usize, 2, 8]),
        ) {
            let evaluator = ParallelEvaluator::in_process(&threads(workers, false), |x: &i64| {
                thread::sleep(Duration::from_micros(x.unsigned_abs() % 200));
                Ok::<_, String>(x * 2 + 1)
            })
            .unwrap();
            let outputs = into_outputs(evaluator.evaluate(inputs.clone()).unwrap()).unwrap();
            let expected: Vec<i64> = inputs.iter().map(|x| x * 2 + 1).collect();
            prop_assert_eq!(outputs, expected);
        }
    }
}
