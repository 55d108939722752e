use std::{fmt, sync::Arc};

use simwrap_parallel::{
    into_outputs, BackendKind, EvaluatorConfig, EvaluatorTelemetry, Memoized, ParallelEvaluator,
    PoolError, TaskOutcome,
};
use simwrap_toolkit::Sample;
use tracing::info;

use crate::model::{check_dimension, Model, ModelError};

/// Cache of model outputs keyed by input point.
pub type PointCache = Memoized<Vec<f64>, Vec<f64>, ModelError>;

/// A model whose samples are evaluated in parallel.
///
/// Single points run inline on the caller's thread; samples go through a
/// [`ParallelEvaluator`] built from the evaluator configuration. With
/// `cache` enabled, points and in-process batches share one [`PointCache`].
/// Out-of-process workers keep no cache of their own.
pub struct ParallelModel {
    model: Arc<dyn Model>,
    cache: Option<Arc<PointCache>>,
    evaluator: ParallelEvaluator<Vec<f64>, Vec<f64>>,
}

impl fmt::Debug for ParallelModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelModel")
            .field("model", &self.model.name())
            .field("cache", &self.cache)
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

/// Fills in what an out-of-process backend needs to serve `model`: the
/// current executable as worker program and the model name to expect.
fn worker_defaults(model: &str, config: &EvaluatorConfig) -> Result<EvaluatorConfig, PoolError> {
    let mut config = config.clone();
    if config.backend.is_out_of_process() && config.expect_model.is_none() {
        config.expect_model = Some(model.to_owned());
    }
    if config.backend == BackendKind::Processes && config.process.program.is_none() {
        let program = std::env::current_exe().map_err(|source| PoolError::Spawn {
            program: "<current executable>".into(),
            source,
        })?;
        config.process.program = Some(program);
        if config.process.args.is_empty() {
            config.process.args = vec!["worker".into(), "--model".into(), model.to_owned()];
        }
    }
    Ok(config)
}

impl ParallelModel {
    /// Pairs `model` with an evaluator for `config`.
    pub fn new(model: Arc<dyn Model>, config: &EvaluatorConfig) -> Result<Self, ModelError> {
        let config = worker_defaults(model.name(), config)?;
        let cache = config.cache.then(|| {
            let cached = Arc::clone(&model);
            Arc::new(PointCache::new(move |x: &Vec<f64>| cached.evaluate(x)))
        });
        let evaluator = match &cache {
            Some(cache) => {
                let cache = Arc::clone(cache);
                ParallelEvaluator::from_config(&config, move |x: &Vec<f64>| cache.call(x))?
            }
            None => {
                let inline = Arc::clone(&model);
                ParallelEvaluator::from_config(&config, move |x: &Vec<f64>| inline.evaluate(x))?
            }
        };
        info!(
            model = model.name(),
            backend = %evaluator.backend(),
            workers = evaluator.workers(),
            cache = cache.is_some(),
            "parallel model ready"
        );
        Ok(Self {
            model,
            cache,
            evaluator,
        })
    }

    /// Writes batch records through `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EvaluatorTelemetry) -> Self {
        self.evaluator = self.evaluator.with_telemetry(telemetry);
        self
    }

    /// The wrapped model.
    #[must_use]
    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    /// The point cache, when caching is enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&PointCache> {
        self.cache.as_deref()
    }

    /// The evaluator used for samples.
    #[must_use]
    pub const fn evaluator(&self) -> &ParallelEvaluator<Vec<f64>, Vec<f64>> {
        &self.evaluator
    }

    /// Evaluates one point on the calling thread.
    pub fn evaluate_point(&self, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        match &self.cache {
            Some(cache) => cache.call(&x.to_vec()),
            None => self.model.evaluate(x),
        }
    }

    /// Evaluates every row of `sample`; `result[i]` belongs to row `i`.
    ///
    /// The sample dimension is checked once up front. A fail-fast batch that
    /// stops is returned as [`ModelError::Aborted`].
    pub fn evaluate_sample(
        &self,
        sample: &Sample,
    ) -> Result<Vec<TaskOutcome<Vec<f64>>>, ModelError> {
        if let Some(row) = sample.rows().first() {
            check_dimension(self.model.as_ref(), row)?;
        }
        Ok(self.evaluator.evaluate(sample.rows().to_vec())?)
    }

    /// Evaluates `sample` and collects the outputs into a sample described by
    /// the model outputs. The lowest-index failure fails the whole call.
    pub fn evaluate_sample_outputs(&self, sample: &Sample) -> Result<Sample, ModelError> {
        let outputs = into_outputs(self.evaluate_sample(sample)?)?;
        Ok(Sample::new(self.model.output_description().to_vec(), outputs)?)
    }
}
