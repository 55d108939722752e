use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde_json::json;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tracing::{error, warn};

use crate::task::panic_message;

const TRAP_MODULE: &str = "simwrap.trap";

fn report(label: &str, logger: Option<&JsonLogger>, input: &dyn fmt::Debug, message: &str, kind: &str) {
    error!(label, input = ?input, error = message, kind, "evaluation failed");
    let Some(logger) = logger else { return };
    let record = LogRecord::new(TRAP_MODULE, LogLevel::Error, format!("{label} failed"))
        .with_metadata(json!({
            "label": label,
            "input": format!("{input:?}"),
            "error": message,
            "kind": kind,
        }));
    if let Err(err) = logger.log(&record) {
        warn!(label, error = %err, "failed to write trap record");
    }
}

/// Wraps `f` so every failure is logged with `label` and the offending input
/// before it reaches the caller.
///
/// The wrapped function has the same signature and returns the original
/// error unchanged. A panic is logged and then resumed.
#[must_use]
pub fn trap<I, O, E, F>(
    label: impl Into<String>,
    logger: Option<Arc<JsonLogger>>,
    f: F,
) -> impl Fn(&I) -> Result<O, E> + Send + Sync
where
    I: fmt::Debug,
    E: fmt::Display,
    F: Fn(&I) -> Result<O, E> + Send + Sync,
{
    let label = label.into();
    move |input: &I| match panic::catch_unwind(AssertUnwindSafe(|| f(input))) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => {
            report(&label, logger.as_deref(), input, &err.to_string(), "error");
            Err(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            report(&label, logger.as_deref(), input, &message, "panic");
            panic::resume_unwind(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn returns_errors_unchanged_and_logs_them() {
        let dir = tempdir().unwrap();
        let logger = Arc::new(JsonLogger::new(dir.path().join("trap.jsonl")).unwrap());
        let guarded = trap("beam", Some(Arc::clone(&logger)), |x: &[f64; 2]| {
            if x[1] == 0.0 {
                Err(format!("zero stiffness for load {}", x[0]))
            } else {
                Ok(x[0] / x[1])
            }
        });
        assert_eq!(guarded(&[6.0, 3.0]), Ok(2.0));
        assert_eq!(
            guarded(&[6.0, 0.0]),
            Err("zero stiffness for load 6".to_string())
        );
        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"label\":\"beam\""));
        assert!(content.contains("[6.0, 0.0]"));
        assert!(content.contains("zero stiffness"));
    }

    #[test]
    fn panics_are_logged_and_resumed() {
        let dir = tempdir().unwrap();
        let logger = Arc::new(JsonLogger::new(dir.path().join("trap.jsonl")).unwrap());
        let guarded = trap("explode", Some(Arc::clone(&logger)), |x: &i32| {
            assert!(*x >= 0, "negative input {x}");
            Ok::<_, String>(*x)
        });
        let caught = panic::catch_unwind(AssertUnwindSafe(|| guarded(&-1)));
        assert!(caught.is_err());
        let content = std::fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"kind\":\"panic\""));
        assert!(content.contains("negative input -1"));
    }

    #[test]
    fn works_without_a_logger() {
        let guarded = trap("plain", None, |x: &u8| x.checked_sub(1).ok_or("underflow"));
        assert_eq!(guarded(&0), Err("underflow"));
        assert_eq!(guarded(&1), Ok(0));
    }
}
