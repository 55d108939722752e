//! One JSON object per line. The worker speaks first with a `ready` line,
//! then answers every `evaluate` request with a `result` carrying the same
//! index. Requests on one link are strictly sequential.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Lines sent by a pool to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolMessage {
    /// Evaluate `input` and answer with `index`.
    Evaluate {
        /// Task index.
        index: usize,
        /// Serialized task input.
        input: Value,
    },
}

/// Lines sent by a worker to a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First line of every link.
    Ready {
        /// Model served by the worker.
        model: String,
        /// Worker process id.
        pid: u32,
    },
    /// Answer to an `evaluate` request.
    Result {
        /// Task index.
        index: usize,
        /// Output or error message.
        outcome: WireOutcome,
    },
}

/// Serialized outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireOutcome {
    /// Serialized output.
    Ok(Value),
    /// Error message.
    Err(String),
}

impl From<Result<Value, String>> for WireOutcome {
    fn from(result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(message) => Self::Err(message),
        }
    }
}

/// Encodes a message as one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one line, ignoring surrounding whitespace.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}
