#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Simwrap toolkit – the small utilities a simulation wrapper needs around
//! each evaluation: scratch directories, array files, template/command
//! coupling and input samples.

/// Error type shared by the toolkit helpers.
#[path = "../error.rs"]
pub mod error;

/// Scoped temporary work directories.
#[path = "../workdir.rs"]
pub mod workdir;

/// Array (de)serialization with optional gzip compression.
#[path = "../arrays.rs"]
pub mod arrays;

/// Coupling helpers for file-driven external codes.
#[path = "../coupling.rs"]
pub mod coupling;

/// Input samples and Monte Carlo designs.
#[path = "../sample.rs"]
pub mod sample;

pub use arrays::{dump_array, load_array, Compression};
pub use coupling::{execute, read_xml_attribute, render_str, render_template};
pub use error::ToolkitError;
pub use sample::{Bounds, Sample};
pub use workdir::{ensure_dir, TempWorkDir};
