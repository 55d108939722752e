use std::{fmt, sync::Arc};

use rayon::ThreadPoolBuilder;

use crate::{
    config::BackendKind,
    pool::{guarded_call, EvalFn, PoolError, WorkerPool},
    task::{BatchControl, Task, TaskFuture},
};

/// Fixed-size rayon pool running an in-process evaluation function.
pub struct ThreadPool<I, O> {
    pool: rayon::ThreadPool,
    f: EvalFn<I, O>,
    workers: usize,
}

impl<I, O> ThreadPool<I, O> {
    /// Starts `workers` threads.
    pub fn new(workers: usize, f: EvalFn<I, O>) -> Result<Self, PoolError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("simwrap-eval-{idx}"))
            .build()
            .map_err(|err| PoolError::ThreadPool(err.to_string()))?;
        Ok(Self {
            pool,
            f,
            workers: workers.max(1),
        })
    }
}

impl<I, O> fmt::Debug for ThreadPool<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl<I, O> WorkerPool<I, O> for ThreadPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::Threads
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn submit(&self, task: Task<I>, control: &BatchControl) -> TaskFuture<O> {
        let (completer, future) = TaskFuture::pending(task.index);
        let f = Arc::clone(&self.f);
        let control = control.clone();
        self.pool.spawn(move || {
            let Task { index, input } = task;
            let outcome = control.run(index, || guarded_call(index, &f, &input));
            completer.complete(outcome);
        });
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::eval_fn;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    #[test]
    fn runs_tasks_concurrently() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let pool = ThreadPool::new(
            4,
            eval_fn(move |x: &u64| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                a.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(x + 1)
            }),
        )
        .unwrap();
        let control = BatchControl::new(false);
        let futures: Vec<_> = (0..8)
            .map(|i| pool.submit(Task::new(i as usize, i), &control))
            .collect();
        let results: Vec<_> = futures.into_iter().map(|f| f.wait().unwrap()).collect();
        assert_eq!(results, (1..=8).collect::<Vec<u64>>());
        assert!(peak.load(Ordering::SeqCst) > 1);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn panics_do_not_kill_workers() {
        let pool = ThreadPool::new(
            1,
            eval_fn(|x: &i32| {
                assert!(*x != 0, "zero input");
                Ok::<_, String>(*x)
            }),
        )
        .unwrap();
        let control = BatchControl::new(false);
        assert!(pool.submit(Task::new(0, 0), &control).wait().is_err());
        assert_eq!(pool.submit(Task::new(1, 5), &control).wait(), Ok(5));
    }
}
