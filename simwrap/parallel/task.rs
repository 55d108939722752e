use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One unit of work: an input tagged with its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<I> {
    /// Position of the input in the batch.
    pub index: usize,
    /// Input owned by this task.
    pub input: I,
}

impl<I> Task<I> {
    /// Tags `input` with `index`.
    #[must_use]
    pub const fn new(index: usize, input: I) -> Self {
        Self { index, input }
    }
}

/// Why a task produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The evaluation function returned an error.
    Evaluation,
    /// The evaluation function panicked.
    Panicked,
    /// Skipped because the batch was cancelled.
    Cancelled,
    /// The worker running the task went away before answering.
    WorkerLost,
}

impl FailureKind {
    /// Label for logging.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Evaluation => "evaluation",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
            Self::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error marker stored at the index of a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("task {index} {kind}: {message}")]
pub struct TaskError {
    /// Index of the failed input.
    pub index: usize,
    /// Failure category.
    pub kind: FailureKind,
    /// Human readable cause.
    pub message: String,
}

impl TaskError {
    /// Builds an error of the given kind.
    #[must_use]
    pub fn new(index: usize, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            message: message.into(),
        }
    }

    /// The evaluation function returned `message`.
    #[must_use]
    pub fn evaluation(index: usize, message: impl Into<String>) -> Self {
        Self::new(index, FailureKind::Evaluation, message)
    }

    /// The evaluation function panicked with `payload`.
    #[must_use]
    pub fn panicked(index: usize, payload: &(dyn Any + Send)) -> Self {
        Self::new(index, FailureKind::Panicked, panic_message(payload))
    }

    /// The task was skipped after the batch was cancelled.
    #[must_use]
    pub fn cancelled(index: usize) -> Self {
        Self::new(index, FailureKind::Cancelled, "batch cancelled before the task ran")
    }

    /// The worker holding the task disappeared.
    #[must_use]
    pub fn worker_lost(index: usize, message: impl Into<String>) -> Self {
        Self::new(index, FailureKind::WorkerLost, message)
    }

    /// Whether the task never ran because of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// Output of one task, or the error marker recorded in its place.
pub type TaskOutcome<O> = Result<O, TaskError>;

/// Unwraps a full batch of outcomes, returning the lowest-index error if any.
pub fn into_outputs<O>(outcomes: Vec<TaskOutcome<O>>) -> Result<Vec<O>, TaskError> {
    outcomes.into_iter().collect()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// Shared flag telling pools to skip tasks that have not started yet.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-batch state handed to pools alongside every task.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    token: CancelToken,
    fail_fast: bool,
}

impl BatchControl {
    /// Creates the control block for a new batch.
    #[must_use]
    pub fn new(fail_fast: bool) -> Self {
        Self {
            token: CancelToken::default(),
            fail_fast,
        }
    }

    /// Whether the first failure cancels the batch.
    #[must_use]
    pub const fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Cancellation token of the batch.
    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Whether queued tasks should be skipped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Records a finished outcome; under fail-fast a failure cancels the rest.
    pub fn settle<O>(&self, outcome: &TaskOutcome<O>) {
        if self.fail_fast {
            if let Err(err) = outcome {
                if !err.is_cancelled() {
                    self.token.cancel();
                }
            }
        }
    }

    /// Runs `job` unless the batch is cancelled, then settles its outcome.
    pub fn run<O>(&self, index: usize, job: impl FnOnce() -> TaskOutcome<O>) -> TaskOutcome<O> {
        if self.is_cancelled() {
            return Err(TaskError::cancelled(index));
        }
        let outcome = job();
        self.settle(&outcome);
        outcome
    }
}

/// Sending half of a [`TaskFuture`]; completing it wakes the waiter.
#[derive(Debug)]
pub struct Completer<O> {
    index: usize,
    sender: Sender<TaskOutcome<O>>,
}

impl<O> Completer<O> {
    /// Index of the task this completer answers for.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Delivers the outcome. A waiter that has gone away is ignored.
    pub fn complete(self, outcome: TaskOutcome<O>) {
        let _ = self.sender.send(outcome);
    }
}

/// Handle to the eventual outcome of a submitted task.
#[derive(Debug)]
pub struct TaskFuture<O> {
    index: usize,
    state: FutureState<O>,
}

#[derive(Debug)]
enum FutureState<O> {
    Ready(TaskOutcome<O>),
    Pending(Receiver<TaskOutcome<O>>),
}

impl<O> TaskFuture<O> {
    /// Future that already holds its outcome.
    #[must_use]
    pub const fn ready(index: usize, outcome: TaskOutcome<O>) -> Self {
        Self {
            index,
            state: FutureState::Ready(outcome),
        }
    }

    /// Future paired with the completer that will resolve it.
    #[must_use]
    pub fn pending(index: usize) -> (Completer<O>, Self) {
        let (sender, receiver) = bounded(1);
        (
            Completer { index, sender },
            Self {
                index,
                state: FutureState::Pending(receiver),
            },
        )
    }

    /// Index of the task.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Whether [`TaskFuture::wait`] would return without blocking.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match &self.state {
            FutureState::Ready(_) => true,
            FutureState::Pending(receiver) => !receiver.is_empty(),
        }
    }

    /// Blocks until the outcome is available. A completer dropped without
    /// answering yields a [`FailureKind::WorkerLost`] marker.
    pub fn wait(self) -> TaskOutcome<O> {
        match self.state {
            FutureState::Ready(outcome) => outcome,
            FutureState::Pending(receiver) => receiver.recv().unwrap_or_else(|_| {
                Err(TaskError::worker_lost(
                    self.index,
                    "worker dropped the task without answering",
                ))
            }),
        }
    }
}
