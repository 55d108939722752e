use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::{io::BufReader, process::Command};
use tracing::debug;

use crate::{
    config::{BackendKind, ConfigError, ProcessBackendConfig},
    link::{link_runtime, Link, LinkPool},
    pool::PoolError,
};

/// Starts `workers` copies of the configured worker program and waits for
/// each to announce itself.
///
/// Children are killed if the pool fails to start or is dropped while they
/// are still running.
pub fn spawn_process_pool<I, O>(
    config: &ProcessBackendConfig,
    workers: usize,
    expect_model: Option<&str>,
) -> Result<LinkPool<I, O>, PoolError> {
    let program = config.program.clone().ok_or_else(|| {
        ConfigError::Invalid("processes backend needs process.program".into())
    })?;
    if workers == 0 {
        return Err(ConfigError::Invalid("n_jobs must be at least 1".into()).into());
    }
    let runtime = link_runtime()?;
    let links = runtime.block_on(async {
        let mut links = (0..workers)
            .map(|slot| spawn_worker(&program, &config.args, slot))
            .collect::<Result<Vec<_>, _>>()?;
        for link in &mut links {
            link.handshake(expect_model, config.handshake_timeout())
                .await?;
        }
        Ok::<_, PoolError>(links)
    })?;
    Ok(LinkPool::start(BackendKind::Processes, runtime, links))
}

fn spawn_worker(program: &Path, args: &[String], slot: usize) -> Result<Link, PoolError> {
    let spawn_error = |source: io::Error| PoolError::Spawn {
        program: program.display().to_string(),
        source,
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(spawn_error)?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(spawn_error(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "worker pipes unavailable",
        )));
    };
    let pid = child.id().unwrap_or_default();
    debug!(program = %program.display(), slot, pid, "spawned worker process");
    Ok(Link::new(
        format!("{}#{slot} (pid {pid})", program_name(program).display()),
        Box::new(BufReader::new(stdout)),
        Box::new(stdin),
        Some(child),
    ))
}

fn program_name(program: &Path) -> PathBuf {
    program
        .file_name()
        .map_or_else(|| program.to_path_buf(), PathBuf::from)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{
        pool::WorkerPool,
        task::{BatchControl, FailureKind, Task},
    };

    fn shell(script: &str) -> ProcessBackendConfig {
        ProcessBackendConfig {
            program: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".into(), script.into()],
            handshake_timeout_ms: 2_000,
        }
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let config = ProcessBackendConfig {
            program: Some(PathBuf::from("/definitely/not/a/worker")),
            ..ProcessBackendConfig::default()
        };
        let err = spawn_process_pool::<f64, f64>(&config, 1, None).unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
    }

    #[test]
    fn silent_worker_fails_handshake() {
        let err = spawn_process_pool::<f64, f64>(&shell("exit 0"), 1, None).unwrap_err();
        assert!(matches!(err, PoolError::Handshake { .. }));
    }

    #[test]
    fn worker_exiting_mid_batch_is_reported_as_lost() {
        let script = r#"echo '{"type":"ready","model":"echo","pid":1}'; read line; exit 3"#;
        let pool = spawn_process_pool::<f64, f64>(&shell(script), 1, Some("echo")).unwrap();
        let control = BatchControl::new(false);
        let err = pool.submit(Task::new(0, 1.5), &control).wait().unwrap_err();
        assert_eq!(err.kind, FailureKind::WorkerLost);
        assert_eq!(err.index, 0);
    }
}
