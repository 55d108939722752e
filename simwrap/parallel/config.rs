use std::{
    fmt, fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {}: {source}", .path.display())]
    Read {
        /// Configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        /// Configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// The values are inconsistent.
    #[error("invalid evaluator configuration: {0}")]
    Invalid(String),
}

/// Worker pool implementation used for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Inline on the calling thread.
    Sequential,
    /// In-process thread pool.
    #[default]
    Threads,
    /// Local worker processes speaking the wire protocol.
    Processes,
    /// Remote worker services reached over TCP.
    Remote,
}

impl BackendKind {
    /// Label for logging and the command line.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Threads => "threads",
            Self::Processes => "processes",
            Self::Remote => "remote",
        }
    }

    /// Whether inputs and outputs cross a process boundary.
    #[must_use]
    pub const fn is_out_of_process(self) -> bool {
        matches!(self, Self::Processes | Self::Remote)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" | "serial" => Ok(Self::Sequential),
            "threads" | "thread" => Ok(Self::Threads),
            "processes" | "process" | "multiprocessing" => Ok(Self::Processes),
            "remote" | "distributed" => Ok(Self::Remote),
            other => Err(ConfigError::Invalid(format!("unknown backend `{other}`"))),
        }
    }
}

/// Settings for the `processes` backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Worker program. Callers that know their own worker entry point may
    /// fill this in before building the pool.
    pub program: Option<PathBuf>,
    /// Arguments passed to every worker process.
    pub args: Vec<String>,
    /// Time allowed for a worker to announce itself.
    pub handshake_timeout_ms: u64,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ProcessBackendConfig {
    /// Handshake timeout as a duration.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Settings for the `remote` backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    /// `host:port` of each worker service.
    pub workers: Vec<String>,
    /// Time allowed to connect and receive the ready line.
    pub connect_timeout_ms: u64,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl RemoteBackendConfig {
    /// Connect timeout as a duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Evaluator configuration, usually read from the `[evaluator]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Worker pool implementation.
    pub backend: BackendKind,
    /// Worker count; defaults to the available hardware concurrency.
    pub n_jobs: Option<usize>,
    /// Abort the batch on the first failure.
    pub fail_fast: bool,
    /// Memoize successful in-process evaluations by input.
    pub cache: bool,
    /// Minimum level of structured and console logs.
    pub verbosity: LogLevel,
    /// JSON-lines batch log.
    pub log_path: Option<PathBuf>,
    /// Model name workers must announce in their ready line.
    pub expect_model: Option<String>,
    /// `processes` backend settings.
    pub process: ProcessBackendConfig,
    /// `remote` backend settings.
    pub remote: RemoteBackendConfig,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            n_jobs: None,
            fail_fast: false,
            cache: false,
            verbosity: LogLevel::Info,
            log_path: None,
            expect_model: None,
            process: ProcessBackendConfig::default(),
            remote: RemoteBackendConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    evaluator: EvaluatorConfig,
}

/// Available hardware concurrency, at least one.
#[must_use]
pub fn available_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

impl EvaluatorConfig {
    /// Number of workers the pool will run.
    #[must_use]
    pub fn effective_jobs(&self) -> usize {
        match (self.n_jobs, self.backend) {
            (Some(n), _) => n,
            (None, BackendKind::Sequential) => 1,
            (None, BackendKind::Remote) if !self.remote.workers.is_empty() => {
                self.remote.workers.len()
            }
            (None, _) => available_workers(),
        }
    }

    /// Checks the settings for the selected backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_jobs == Some(0) {
            return Err(ConfigError::Invalid("n_jobs must be at least 1".into()));
        }
        match self.backend {
            BackendKind::Remote if self.remote.workers.is_empty() => Err(ConfigError::Invalid(
                "remote backend needs at least one worker address".into(),
            )),
            BackendKind::Remote if self.remote.connect_timeout_ms == 0 => Err(
                ConfigError::Invalid("remote.connect_timeout_ms must be positive".into()),
            ),
            BackendKind::Processes if self.process.program.is_none() => Err(
                ConfigError::Invalid("processes backend needs process.program".into()),
            ),
            BackendKind::Processes if self.process.handshake_timeout_ms == 0 => Err(
                ConfigError::Invalid("process.handshake_timeout_ms must be positive".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Parses the `[evaluator]` table of a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str::<ConfigDocument>(raw)
            .map(|doc| doc.evaluator)
            .map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })
    }

    /// Loads the `[evaluator]` table of a TOML file. Relative paths are
    /// resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = toml::from_str::<ConfigDocument>(&raw)
            .map(|doc| doc.evaluator)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(log_path) = self.log_path.as_mut() {
            if log_path.is_relative() {
                *log_path = base.join(&*log_path);
            }
        }
        if let Some(program) = self.process.program.as_mut() {
            // Bare program names are looked up on PATH.
            if program.is_relative() && program.components().count() > 1 {
                *program = base.join(&*program);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_to_threads_on_all_cores() {
        let config = EvaluatorConfig::default();
        assert_eq!(config.backend, BackendKind::Threads);
        assert_eq!(config.effective_jobs(), available_workers());
        assert!(!config.fail_fast);
        assert!(!config.cache);
        config.validate().unwrap();
    }

    #[test]
    fn parses_evaluator_table_and_ignores_other_sections() {
        let config = EvaluatorConfig::from_toml_str(
            r#"
            [beam]
            executable = "beam -x beam.xml"

            [evaluator]
            backend = "remote"
            fail_fast = true
            cache = true
            verbosity = "debug"

            [evaluator.remote]
            workers = ["node-a:7070", "node-b:7070"]
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Remote);
        assert_eq!(config.effective_jobs(), 2);
        assert_eq!(config.verbosity, LogLevel::Debug);
        assert!(config.cache);
        assert_eq!(config.remote.connect_timeout_ms, 5_000);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let zero = EvaluatorConfig {
            n_jobs: Some(0),
            ..EvaluatorConfig::default()
        };
        assert!(zero.validate().is_err());
        let remote = EvaluatorConfig {
            backend: BackendKind::Remote,
            ..EvaluatorConfig::default()
        };
        assert!(remote.validate().is_err());
        let processes = EvaluatorConfig {
            backend: BackendKind::Processes,
            ..EvaluatorConfig::default()
        };
        assert!(processes.validate().is_err());
        assert!(EvaluatorConfig::from_toml_str("[evaluator]\nbackend = \"gpu\"").is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simwrap.toml");
        fs::write(
            &path,
            "[evaluator]\nbackend = \"processes\"\nlog_path = \"logs/batch.jsonl\"\n\n[evaluator.process]\nprogram = \"bin/worker\"\n",
        )
        .unwrap();
        let config = EvaluatorConfig::load(&path).unwrap();
        assert_eq!(config.log_path.unwrap(), dir.path().join("logs/batch.jsonl"));
        assert_eq!(config.process.program.unwrap(), dir.path().join("bin/worker"));
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("multiprocessing".parse::<BackendKind>().unwrap(), BackendKind::Processes);
        assert_eq!("distributed".parse::<BackendKind>().unwrap(), BackendKind::Remote);
        assert!("joblib".parse::<BackendKind>().is_err());
    }
}
