#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Simwrap models – numerical models behind a common trait, the registry the
//! command line resolves names against, and [`ParallelModel`] which evaluates
//! whole samples through the parallel evaluator.

/// Model trait and errors.
#[path = "../model.rs"]
pub mod model;

/// Ordered name to model map.
#[path = "../registry.rs"]
pub mod registry;

/// `[beam]` configuration of the external beam code.
#[path = "../beam_config.rs"]
pub mod beam_config;

/// Cantilever beam models.
#[path = "../beam.rs"]
pub mod beam;

/// A model paired with a parallel evaluator.
#[path = "../parallel_model.rs"]
pub mod parallel_model;

pub use beam::{beam_bounds, AnalyticBeam, BeamCode, BEAM_INPUTS, BEAM_OUTPUTS, BEAM_TOKENS};
pub use beam_config::{BeamConfig, SiteConfig};
pub use model::{check_dimension, Model, ModelError};
pub use parallel_model::{ParallelModel, PointCache};
pub use registry::ModelRegistry;
