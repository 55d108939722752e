use simwrap_parallel::{BatchAborted, PoolError, TaskError};
use simwrap_toolkit::{Bounds, ToolkitError};
use thiserror::Error;

/// Errors raised while resolving or evaluating a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Input point of the wrong length.
    #[error("model `{model}` expects {expected} inputs, got {actual}")]
    Dimension {
        /// Model name.
        model: String,
        /// Declared input dimension.
        expected: usize,
        /// Length of the offending point.
        actual: usize,
    },
    /// The registry has no model with this name.
    #[error("unknown model `{name}` (known: {})", .known.join(", "))]
    UnknownModel {
        /// Requested name.
        name: String,
        /// Registered names.
        known: Vec<String>,
    },
    /// The beam configuration names no such site.
    #[error("unknown site `{0}`")]
    UnknownSite(String),
    /// The model rejected the point.
    #[error("{0}")]
    Evaluation(String),
    /// A coupling step (work dir, template, command, output) failed.
    #[error(transparent)]
    Toolkit(#[from] ToolkitError),
    /// The evaluator could not be built.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// One point of a sample failed.
    #[error(transparent)]
    Task(#[from] TaskError),
    /// A fail-fast batch stopped.
    #[error(transparent)]
    Aborted(Box<BatchAborted<Vec<f64>>>),
}

impl From<BatchAborted<Vec<f64>>> for ModelError {
    fn from(aborted: BatchAborted<Vec<f64>>) -> Self {
        Self::Aborted(Box::new(aborted))
    }
}

/// A deterministic function from an input point to an output vector.
pub trait Model: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Input column names; their count is the input dimension.
    fn input_description(&self) -> &[String];

    /// Output column names.
    fn output_description(&self) -> &[String];

    /// Bounds used when sampling the model without explicit bounds.
    fn default_bounds(&self) -> Option<Vec<Bounds>> {
        None
    }

    /// Evaluates a point whose dimension has already been checked.
    fn compute(&self, x: &[f64]) -> Result<Vec<f64>, ModelError>;

    /// Checks the dimension of `x`, then evaluates it.
    fn evaluate(&self, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        check_dimension(self, x)?;
        self.compute(x)
    }
}

/// Fails unless `x` has one value per declared input.
pub fn check_dimension<M: Model + ?Sized>(model: &M, x: &[f64]) -> Result<(), ModelError> {
    let expected = model.input_description().len();
    if x.len() == expected {
        Ok(())
    } else {
        Err(ModelError::Dimension {
            model: model.name().to_owned(),
            expected,
            actual: x.len(),
        })
    }
}
