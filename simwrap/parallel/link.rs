use std::{
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    process::Child,
    runtime::{Builder, Handle, Runtime},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex as AsyncMutex,
    },
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::BackendKind,
    pool::{PoolError, WorkerPool},
    task::{BatchControl, Task, TaskError, TaskFuture, TaskOutcome},
    wire::{decode_line, encode_line, PoolMessage, WireOutcome, WorkerMessage},
};

pub(crate) type LinkReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub(crate) type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

/// One line-oriented connection to a worker: a child's pipes or a socket.
pub(crate) struct Link {
    label: String,
    reader: LinkReader,
    writer: LinkWriter,
    child: Option<Child>,
}

impl Link {
    pub(crate) fn new(
        label: String,
        reader: LinkReader,
        writer: LinkWriter,
        child: Option<Child>,
    ) -> Self {
        Self {
            label,
            reader,
            writer,
            child,
        }
    }

    /// Reads the worker's ready line, returning the announced model.
    pub(crate) async fn handshake(
        &mut self,
        expect_model: Option<&str>,
        wait: Duration,
    ) -> Result<String, PoolError> {
        let mut line = String::new();
        let read = match timeout(wait, self.reader.read_line(&mut line)).await {
            Err(_) => return Err(self.handshake_error(format!("no ready line within {wait:?}"))),
            Ok(Err(err)) => return Err(self.handshake_error(err.to_string())),
            Ok(Ok(read)) => read,
        };
        if read == 0 {
            return Err(self.handshake_error("closed before announcing itself".into()));
        }
        match decode_line::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Ready { model, pid }) => {
                if let Some(expected) = expect_model {
                    if expected != model {
                        return Err(self.handshake_error(format!(
                            "serves model `{model}`, expected `{expected}`"
                        )));
                    }
                }
                debug!(link = %self.label, %model, pid, "worker ready");
                Ok(model)
            }
            Ok(other) => Err(self.handshake_error(format!("unexpected first message {other:?}"))),
            Err(err) => Err(self.handshake_error(format!("malformed ready line: {err}"))),
        }
    }

    fn handshake_error(&self, reason: String) -> PoolError {
        PoolError::Handshake {
            link: self.label.clone(),
            reason,
        }
    }

    /// Sends one request and reads its answer. `Err` means the link is dead.
    async fn exchange(
        &mut self,
        index: usize,
        input: Value,
        line: &mut String,
    ) -> Result<TaskOutcome<Value>, String> {
        let request = encode_line(&PoolMessage::Evaluate { index, input })
            .map_err(|err| format!("encoding request: {err}"))?;
        self.writer
            .write_all(request.as_bytes())
            .await
            .map_err(|err| format!("sending request: {err}"))?;
        self.writer
            .flush()
            .await
            .map_err(|err| format!("sending request: {err}"))?;
        line.clear();
        let read = self
            .reader
            .read_line(line)
            .await
            .map_err(|err| format!("reading response: {err}"))?;
        if read == 0 {
            return Err("worker closed the connection".into());
        }
        match decode_line::<WorkerMessage>(line) {
            Ok(WorkerMessage::Result {
                index: answered,
                outcome,
            }) if answered == index => Ok(match outcome {
                WireOutcome::Ok(value) => Ok(value),
                WireOutcome::Err(message) => Err(TaskError::evaluation(index, message)),
            }),
            Ok(other) => Err(format!("unexpected message {other:?}")),
            Err(err) => Err(format!("malformed response: {err}")),
        }
    }

    /// Closes the request stream and reaps the child, if any.
    async fn close(self) {
        let Self {
            label,
            reader,
            mut writer,
            child,
        } = self;
        let _ = writer.shutdown().await;
        drop(writer);
        drop(reader);
        if let Some(mut child) = child {
            match timeout(CHILD_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(link = %label, %status, "worker exited"),
                Ok(Err(err)) => warn!(link = %label, error = %err, "failed to reap worker"),
                Err(_) => {
                    warn!(link = %label, "worker ignored end of input, killing it");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

type Reply = Box<dyn FnOnce(TaskOutcome<Value>) + Send>;

struct Job {
    index: usize,
    input: Value,
    control: BatchControl,
    reply: Reply,
}

struct Shared {
    backlog: AsyncMutex<UnboundedReceiver<Job>>,
    live: AtomicUsize,
}

fn fail_queued(backlog: &mut UnboundedReceiver<Job>, reason: &str) -> usize {
    let mut failed = 0;
    while let Ok(job) = backlog.try_recv() {
        (job.reply)(Err(TaskError::worker_lost(job.index, reason)));
        failed += 1;
    }
    failed
}

async fn drive(mut link: Link, shared: Arc<Shared>) {
    let mut line = String::new();
    let mut lost = None;
    loop {
        let next = shared.backlog.lock().await.recv().await;
        let Some(job) = next else { break };
        let Job {
            index,
            input,
            control,
            reply,
        } = job;
        if control.is_cancelled() {
            reply(Err(TaskError::cancelled(index)));
            continue;
        }
        match link.exchange(index, input, &mut line).await {
            Ok(outcome) => reply(outcome),
            Err(reason) => {
                reply(Err(TaskError::worker_lost(
                    index,
                    format!("{}: {reason}", link.label),
                )));
                lost = Some(reason);
                break;
            }
        }
    }
    let label = link.label.clone();
    link.close().await;
    if let Some(reason) = lost {
        warn!(link = %label, %reason, "worker link lost");
        if shared.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut backlog = shared.backlog.lock().await;
            let failed = fail_queued(&mut backlog, "all worker links lost");
            if failed > 0 {
                warn!(failed, "failed queued tasks after losing every worker");
            }
        }
    }
}

/// Pool of worker links (child processes or remote connections) driven by a
/// private tokio runtime. Inputs and outputs travel as JSON.
///
/// Each link runs one task at a time. Links pull from a shared queue, so a
/// slow worker never holds up the others. A link that dies fails its
/// in-flight task with [`crate::FailureKind::WorkerLost`]; once every link is
/// gone, queued and later tasks fail the same way instead of hanging.
pub struct LinkPool<I, O> {
    kind: BackendKind,
    workers: usize,
    queue: Option<UnboundedSender<Job>>,
    shared: Arc<Shared>,
    drivers: Vec<JoinHandle<()>>,
    runtime: Option<Runtime>,
    _types: PhantomData<fn(I) -> O>,
}

/// Runtime dedicated to link I/O.
pub(crate) fn link_runtime() -> Result<Runtime, PoolError> {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("simwrap-link")
        .enable_all()
        .build()
        .map_err(PoolError::Runtime)
}

impl<I, O> LinkPool<I, O> {
    pub(crate) fn start(kind: BackendKind, runtime: Runtime, links: Vec<Link>) -> Self {
        let (queue, backlog) = mpsc::unbounded_channel();
        let workers = links.len();
        let shared = Arc::new(Shared {
            backlog: AsyncMutex::new(backlog),
            live: AtomicUsize::new(workers),
        });
        let drivers = links
            .into_iter()
            .map(|link| runtime.spawn(drive(link, Arc::clone(&shared))))
            .collect();
        info!(backend = %kind, workers, "worker links ready");
        Self {
            kind,
            workers,
            queue: Some(queue),
            shared,
            drivers,
            runtime: Some(runtime),
            _types: PhantomData,
        }
    }

    /// Links still able to take work.
    #[must_use]
    pub fn live_links(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    fn dispatch(&self, job: Job) {
        let Some(queue) = self.queue.as_ref() else {
            (job.reply)(Err(TaskError::worker_lost(job.index, "link pool shut down")));
            return;
        };
        if let Err(mpsc::error::SendError(job)) = queue.send(job) {
            (job.reply)(Err(TaskError::worker_lost(job.index, "link pool shut down")));
            return;
        }
        if self.live_links() == 0 {
            self.drain_backlog("no live worker links");
        }
    }

    fn drain_backlog(&self, reason: &str) {
        loop {
            if let Ok(mut backlog) = self.shared.backlog.try_lock() {
                fail_queued(&mut backlog, reason);
                return;
            }
            std::thread::yield_now();
        }
    }
}

impl<I, O> fmt::Debug for LinkPool<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkPool")
            .field("kind", &self.kind)
            .field("workers", &self.workers)
            .field("live", &self.live_links())
            .finish_non_exhaustive()
    }
}

impl<I, O> WorkerPool<I, O> for LinkPool<I, O>
where
    I: Serialize,
    O: DeserializeOwned + Send + 'static,
{
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn submit(&self, task: Task<I>, control: &BatchControl) -> TaskFuture<O> {
        let Task { index, input } = task;
        if control.is_cancelled() {
            return TaskFuture::ready(index, Err(TaskError::cancelled(index)));
        }
        let input = match serde_json::to_value(&input) {
            Ok(value) => value,
            Err(err) => {
                let outcome = Err(TaskError::evaluation(
                    index,
                    format!("input does not serialize: {err}"),
                ));
                control.settle(&outcome);
                return TaskFuture::ready(index, outcome);
            }
        };
        let (completer, future) = TaskFuture::pending(index);
        let settle = control.clone();
        let reply: Reply = Box::new(move |outcome: TaskOutcome<Value>| {
            let decoded = outcome.and_then(|value| {
                serde_json::from_value::<O>(value).map_err(|err| {
                    TaskError::evaluation(index, format!("worker output does not decode: {err}"))
                })
            });
            settle.settle(&decoded);
            completer.complete(decoded);
        });
        self.dispatch(Job {
            index,
            input,
            control: control.clone(),
            reply,
        });
        future
    }
}

impl<I, O> Drop for LinkPool<I, O> {
    fn drop(&mut self) {
        self.queue.take();
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
            return;
        }
        let drivers = std::mem::take(&mut self.drivers);
        let _ = runtime.block_on(async {
            timeout(CHILD_EXIT_GRACE * 2, async {
                for driver in drivers {
                    let _ = driver.await;
                }
            })
            .await
        });
        runtime.shutdown_timeout(Duration::from_millis(500));
    }
}
