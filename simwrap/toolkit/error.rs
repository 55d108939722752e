use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised by the toolkit helpers.
#[derive(Debug, Error)]
pub enum ToolkitError {
    /// Filesystem or process I/O failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// JSON encoding or decoding failure.
    #[error("serialization failed for {}: {source}", .path.display())]
    Serde {
        /// File being read or written.
        path: PathBuf,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
    /// A template token does not occur in the template.
    #[error("token `{token}` not found in template {template}")]
    MissingToken {
        /// Template file (or `<inline>`).
        template: String,
        /// Token that was looked up.
        token: String,
    },
    /// Token and value lists differ in length.
    #[error("expected {expected} values for tokens, got {actual}")]
    TokenCount {
        /// Number of tokens.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },
    /// External command returned a non-zero status.
    #[error("command `{command}` exited with {status}: {stderr}")]
    CommandFailed {
        /// Command line that was run.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error (trimmed).
        stderr: String,
    },
    /// Attribute missing from an output file.
    #[error("attribute `{attribute}` of <{element}> not found in {}", .path.display())]
    MissingAttribute {
        /// File that was parsed.
        path: PathBuf,
        /// Element name.
        element: String,
        /// Attribute name.
        attribute: String,
    },
    /// A value could not be parsed as a number.
    #[error("invalid number `{raw}` in {}", .path.display())]
    InvalidNumber {
        /// File that was parsed.
        path: PathBuf,
        /// Offending text.
        raw: String,
    },
    /// Sample rows or description are inconsistent.
    #[error("invalid sample: {0}")]
    InvalidSample(String),
    /// Bounds are malformed or inverted.
    #[error("invalid bounds: {0}")]
    InvalidBounds(String),
}

impl ToolkitError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
