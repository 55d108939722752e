use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use shared_logging::init_tracing;
use simwrap_models::{BeamCode, BeamConfig, Model, ModelError, ModelRegistry, ParallelModel};
use simwrap_parallel::{
    handler, serve_stdio, serve_tcp, BackendKind, BatchAborted, EvaluatorConfig, TaskError,
    TaskOutcome,
};
use simwrap_toolkit::{dump_array, load_array, Bounds, Compression, Sample};
use tokio::{net::TcpListener, runtime::Runtime};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "simwrap", version, about = "Parallel evaluation of wrapped simulation models")]
struct Cli {
    /// More console output; repeat for more.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Less console output; repeat for less.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    quiet: u8,
    /// TOML file with `[evaluator]` and `[beam]` tables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Execution site of the beam code (`[beam.sites.<name>]`).
    #[arg(long, global = true)]
    site: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lists the available models.
    Models,
    /// Writes a Monte Carlo design for a model.
    Sample(SampleArgs),
    /// Evaluates a sample or a single point.
    Run(RunArgs),
    /// Serves a model to a process or remote pool.
    Worker(WorkerArgs),
}

#[derive(Parser, Debug)]
struct SampleArgs {
    #[arg(long)]
    model: String,
    #[arg(long)]
    size: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Per-input bounds as `lo:hi`, comma separated. Defaults to the model's.
    #[arg(long, value_delimiter = ',')]
    bounds: Vec<Bounds>,
    /// Output file; `.gz` compresses.
    #[arg(long)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    model: String,
    /// Sample file written by `simwrap sample`.
    #[arg(long, conflicts_with = "point")]
    input: Option<PathBuf>,
    /// A single point.
    #[arg(long, num_args = 1.., allow_negative_numbers = true)]
    point: Vec<f64>,
    #[arg(long)]
    backend: Option<BackendKind>,
    #[arg(long)]
    n_jobs: Option<usize>,
    #[arg(long)]
    fail_fast: bool,
    /// Evaluate repeated points once.
    #[arg(long)]
    cache: bool,
    /// Report file; printed to stdout when absent.
    #[arg(long)]
    output: Option<PathBuf>,
    /// JSON-lines batch log.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[arg(long)]
    model: String,
    /// Listen on this address instead of serving stdin/stdout.
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Debug, Serialize)]
struct PointReport {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    model: String,
    backend: BackendKind,
    workers: usize,
    aborted: bool,
    failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_hits: Option<u64>,
    results: Vec<PointReport>,
}

impl RunReport {
    fn completed(model: &ParallelModel, outcomes: Vec<TaskOutcome<Vec<f64>>>) -> Self {
        let results: Vec<PointReport> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| match outcome {
                Ok(output) => PointReport {
                    index,
                    output: Some(output),
                    error: None,
                },
                Err(err) => PointReport {
                    index,
                    output: None,
                    error: Some(err),
                },
            })
            .collect();
        Self {
            model: model.model().name().to_owned(),
            backend: model.evaluator().backend(),
            workers: model.evaluator().workers(),
            aborted: false,
            failed: results.iter().filter(|r| r.error.is_some()).count(),
            cache_hits: model.cache().map(|cache| cache.hits()),
            results,
        }
    }

    fn aborted(model: &ParallelModel, aborted: BatchAborted<Vec<f64>>) -> Self {
        let mut errors: Vec<Option<TaskError>> = vec![None; aborted.partial.len()];
        for err in &aborted.failures {
            if let Some(slot) = errors.get_mut(err.index) {
                *slot = Some(err.clone());
            }
        }
        for &index in &aborted.cancelled {
            if let Some(slot) = errors.get_mut(index) {
                *slot = Some(TaskError::cancelled(index));
            }
        }
        let results = aborted
            .partial
            .into_iter()
            .zip(errors)
            .enumerate()
            .map(|(index, (output, error))| PointReport {
                index,
                output,
                error,
            })
            .collect();
        Self {
            model: model.model().name().to_owned(),
            backend: model.evaluator().backend(),
            workers: model.evaluator().workers(),
            aborted: true,
            failed: aborted.failures.len(),
            cache_hits: model.cache().map(|cache| cache.hits()),
            results,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let evaluator = load_evaluator_config(cli.config.as_deref())?;
    init_tracing(evaluator.verbosity.shifted(cli.verbose, cli.quiet))?;
    let registry = load_registry(cli.config.as_deref(), cli.site.as_deref())?;
    match &cli.command {
        Commands::Models => {
            list_models(&registry);
            Ok(())
        }
        Commands::Sample(args) => handle_sample(&registry, args),
        Commands::Run(args) => handle_run(&cli, &registry, evaluator, args),
        Commands::Worker(args) => handle_worker(&registry, args),
    }
}

fn load_evaluator_config(path: Option<&Path>) -> Result<EvaluatorConfig> {
    match path {
        Some(path) => EvaluatorConfig::load(path)
            .with_context(|| format!("loading evaluator settings from {}", path.display())),
        None => Ok(EvaluatorConfig::default()),
    }
}

fn load_registry(config: Option<&Path>, site: Option<&str>) -> Result<ModelRegistry> {
    let mut registry = ModelRegistry::builtin();
    let beam = match config {
        Some(path) => BeamConfig::load(path)?,
        None => None,
    };
    match beam {
        Some(beam) => {
            registry.register(Arc::new(BeamCode::new(beam, site)?));
        }
        None if site.is_some() => bail!("--site needs a config file with a [beam] table"),
        None => {}
    }
    Ok(registry)
}

fn list_models(registry: &ModelRegistry) {
    for model in registry.iter() {
        println!(
            "{} | inputs: {} | outputs: {}",
            model.name(),
            model.input_description().join(", "),
            model.output_description().join(", ")
        );
        if let Some(bounds) = model.default_bounds() {
            let bounds: Vec<String> = bounds.iter().map(ToString::to_string).collect();
            println!("    default bounds: {}", bounds.join(", "));
        }
    }
}

fn handle_sample(registry: &ModelRegistry, args: &SampleArgs) -> Result<()> {
    let model = registry.get(&args.model)?;
    let bounds = if args.bounds.is_empty() {
        model
            .default_bounds()
            .with_context(|| format!("model `{}` has no default bounds; pass --bounds", args.model))?
    } else {
        args.bounds.clone()
    };
    let sample = Sample::uniform(
        model.input_description().to_vec(),
        &bounds,
        args.size,
        args.seed,
    )?;
    dump_array(&sample, &args.output, Compression::from_path(&args.output))?;
    info!(model = %args.model, size = args.size, seed = args.seed, output = %args.output.display(), "sample written");
    Ok(())
}

/// Evaluator settings after command line overrides. Worker processes are
/// this executable, started with the same config file and site.
fn run_config(cli: &Cli, mut config: EvaluatorConfig, args: &RunArgs) -> Result<EvaluatorConfig> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if args.n_jobs.is_some() {
        config.n_jobs = args.n_jobs;
    }
    config.fail_fast |= args.fail_fast;
    config.cache |= args.cache;
    if let Some(log_file) = &args.log_file {
        config.log_path = Some(log_file.clone());
    }
    if config.backend == BackendKind::Processes && config.process.program.is_none() {
        config.process.program =
            Some(std::env::current_exe().context("locating the simwrap executable")?);
        let mut worker_args = vec!["worker".to_owned(), "--model".to_owned(), args.model.clone()];
        if let Some(path) = &cli.config {
            worker_args.push("--config".into());
            worker_args.push(path.display().to_string());
        }
        if let Some(site) = &cli.site {
            worker_args.push("--site".into());
            worker_args.push(site.clone());
        }
        config.process.args = worker_args;
    }
    Ok(config)
}

fn handle_run(
    cli: &Cli,
    registry: &ModelRegistry,
    config: EvaluatorConfig,
    args: &RunArgs,
) -> Result<()> {
    let model = registry.get(&args.model)?;
    let sample = match (&args.input, args.point.is_empty()) {
        (Some(path), _) => load_array::<Sample>(path, Compression::from_path(path))?,
        (None, false) => Sample::new(model.input_description().to_vec(), vec![args.point.clone()])?,
        (None, true) => bail!("pass --input or --point"),
    };
    let config = run_config(cli, config, args)?;
    let parallel = ParallelModel::new(model, &config)?;
    let (report, aborted) = match parallel.evaluate_sample(&sample) {
        Ok(outcomes) => (RunReport::completed(&parallel, outcomes), None),
        Err(ModelError::Aborted(aborted)) => {
            let first = aborted.first_failure.clone();
            (RunReport::aborted(&parallel, *aborted), Some(first))
        }
        Err(err) => return Err(err.into()),
    };
    if report.failed > 0 {
        warn!(failed = report.failed, points = report.results.len(), "some points failed");
    }
    match &args.output {
        Some(path) => {
            dump_array(&report, path, Compression::from_path(path))?;
            info!(output = %path.display(), points = report.results.len(), "report written");
        }
        None => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    if let Some(first) = aborted {
        bail!("batch aborted: {first}");
    }
    Ok(())
}

fn handle_worker(registry: &ModelRegistry, args: &WorkerArgs) -> Result<()> {
    let model = registry.get(&args.model)?;
    let name = model.name().to_owned();
    let evaluate = handler(move |x: &Vec<f64>| model.evaluate(x));
    let runtime = Runtime::new().context("starting worker runtime")?;
    match &args.listen {
        Some(address) => runtime.block_on(async {
            let listener = TcpListener::bind(address.as_str())
                .await
                .with_context(|| format!("binding {address}"))?;
            serve_tcp(listener, name, evaluate).await?;
            Ok::<_, anyhow::Error>(())
        }),
        None => {
            let served = runtime.block_on(serve_stdio(&name, evaluate))?;
            info!(model = %name, served, "worker finished");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_logging::LogLevel;

    #[test]
    fn command_line_parses() {
        let cli = Cli::try_parse_from([
            "simwrap", "-vv", "run", "--model", "beam", "--point", "1", "-2.5", "3", "4",
            "--backend", "processes", "--n-jobs", "3", "--fail-fast", "--cache",
        ])
        .unwrap();
        assert_eq!(LogLevel::Info.shifted(cli.verbose, cli.quiet), LogLevel::Debug);
        let Commands::Run(args) = &cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.point, vec![1.0, -2.5, 3.0, 4.0]);
        assert_eq!(args.backend, Some(BackendKind::Processes));

        let config = run_config(&cli, EvaluatorConfig::default(), args).unwrap();
        assert_eq!(config.n_jobs, Some(3));
        assert!(config.fail_fast);
        assert!(config.cache);
        assert_eq!(config.process.args, ["worker", "--model", "beam"]);
    }

    #[test]
    fn input_and_point_conflict() {
        assert!(Cli::try_parse_from([
            "simwrap", "run", "--model", "beam", "--input", "x.json", "--point", "1",
        ])
        .is_err());
    }

    #[test]
    fn bounds_parse_from_the_command_line() {
        let cli = Cli::try_parse_from([
            "simwrap", "sample", "--model", "beam", "--size", "4", "--bounds", "0:1,2:3",
            "--output", "s.json",
        ])
        .unwrap();
        let Commands::Sample(args) = cli.command else {
            panic!("expected sample");
        };
        assert_eq!(
            args.bounds,
            vec![
                Bounds { lower: 0.0, upper: 1.0 },
                Bounds { lower: 2.0, upper: 3.0 }
            ]
        );
    }
}
