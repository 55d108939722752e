use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;

type CachedFn<I, O, E> = Box<dyn Fn(&I) -> Result<O, E> + Send + Sync>;

/// Memoizing wrapper around an evaluation function.
///
/// Successful outputs are cached under the JSON encoding of the input; errors
/// are returned but never cached. Inputs that fail to serialize bypass the
/// cache. The lock is not held while `f` runs, so two threads missing on the
/// same input may both evaluate it.
pub struct Memoized<I, O, E> {
    f: CachedFn<I, O, E>,
    store: Mutex<HashMap<String, O>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<I, O, E> fmt::Debug for Memoized<I, O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("entries", &self.store.lock().len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish_non_exhaustive()
    }
}

impl<I, O, E> Memoized<I, O, E>
where
    I: Serialize,
    O: Clone,
{
    /// Wraps `f` with an empty cache.
    #[must_use]
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
    {
        Self {
            f: Box::new(f),
            store: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached output for `input`, evaluating it on a miss.
    pub fn call(&self, input: &I) -> Result<O, E> {
        let Ok(key) = serde_json::to_string(input) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return (self.f)(input);
        };
        if let Some(output) = self.store.lock().get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(output);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let output = (self.f)(input)?;
        self.store.lock().insert(key, output.clone());
        Ok(output)
    }
}

impl<I, O, E> Memoized<I, O, E> {
    /// Calls answered from the cache.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Calls that evaluated the wrapped function.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of cached outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Drops every cached output and resets the counters.
    pub fn clear(&self) {
        self.store.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
