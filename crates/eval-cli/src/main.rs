use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use eval_runner::{EvalError, Experiment, GridSummary, LoadOptions, MetricFilter, Summary};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "evalgrid",
    version = "0.3.0",
    about = "Plan evaluation grids and summarize their statistics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand an experiment and create its job folders.
    Plan {
        experiment: PathBuf,
        #[arg(long)]
        results_folder: Option<PathBuf>,
        #[arg(long)]
        data_folder: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show the grid an experiment expands to without writing anything.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        data_folder: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Turn a job's raw statistics.yaml into formatted_stats.yaml.
    FormatStats {
        #[arg(long)]
        job_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate formatted statistics across runs.
    Summarize {
        #[arg(long)]
        results_dir: Option<PathBuf>,
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Take metric filters from this experiment's summarize_statistics.
        #[arg(long)]
        experiment: Option<PathBuf>,
        #[arg(long)]
        whitelist: Vec<String>,
        #[arg(long)]
        blacklist: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<EvalError>()
                    .map(EvalError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Plan {
            experiment,
            results_folder,
            data_folder,
            json,
        } => {
            let options = LoadOptions {
                results_folder,
                data_folder,
                generated_time: None,
            };
            let exp = Experiment::load(&experiment, &options)?;
            let source = exp.parameter_source();
            let jobs = eval_runner::GridBuilder::from_experiment(&exp).build(
                &exp.datasets,
                &exp.parameter_files,
                &exp.custom_runs,
                &source,
            )?;
            let folders = eval_runner::materialize_jobs(&jobs, &exp.metadata)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "experiment": exp.basename,
                    "experiment_folder": exp.experiment_folder().display().to_string(),
                    "jobs": jobs.len(),
                    "job_folders": folders
                        .iter()
                        .map(|f| f.display().to_string())
                        .collect::<Vec<_>>()
                })));
            }
            println!("experiment: {}", exp.basename);
            println!("experiment_folder: {}", exp.experiment_folder().display());
            println!("jobs: {}", jobs.len());
            for folder in &folders {
                println!("  {}", folder.display());
            }
        }
        Commands::Describe {
            experiment,
            data_folder,
            json,
        } => {
            let options = LoadOptions {
                data_folder,
                ..LoadOptions::default()
            };
            let exp = Experiment::load(&experiment, &options)?;
            let grid = eval_runner::describe_grid(&exp, &exp.parameter_source())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": grid_to_json(&grid, &exp)
                })));
            }
            print_grid(&grid, &exp);
        }
        Commands::FormatStats { job_dir, json } => {
            let out = eval_runner::format_job_statistics(&job_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "format-stats",
                    "formatted_stats": out.display().to_string()
                })));
            }
            println!("formatted_stats: {}", out.display());
        }
        Commands::Summarize {
            results_dir,
            files,
            experiment,
            whitelist,
            blacklist,
            out,
            json,
        } => {
            let filter = summarize_filter(experiment.as_deref(), whitelist, blacklist)?;
            let mut inputs = files;
            if let Some(dir) = &results_dir {
                inputs.extend(eval_runner::discover_statistics_files(dir)?);
            }
            if inputs.is_empty() {
                bail!("nothing to summarize: pass --results-dir or at least one --file");
            }
            info!(files = inputs.len(), "summarizing statistics files");
            let summary = eval_runner::summarize_files(&inputs, filter)?;
            if let Some(path) = &out {
                summary.write(path)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "out": out.as_ref().map(|p| p.display().to_string()),
                    "summary": summary
                })));
            }
            print_summary(&summary, out.as_deref());
        }
    }
    Ok(None)
}

/// Flags extend whatever the experiment file declares.
fn summarize_filter(
    experiment: Option<&Path>,
    whitelist: Vec<String>,
    blacklist: Vec<String>,
) -> Result<MetricFilter> {
    let mut filter = match experiment {
        Some(path) => Experiment::load(path, &LoadOptions::default())?
            .summarize
            .metric_filter(),
        None => MetricFilter::default(),
    };
    filter.whitelist.extend(whitelist);
    filter.blacklist.extend(blacklist);
    Ok(filter)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<EvalError>() {
        Some(EvalError::UnresolvedPlaceholder { token, partial }) => {
            json!({ "token": token, "partial": partial })
        }
        Some(EvalError::NotASubset { missing }) => json!({ "missing": missing }),
        Some(EvalError::MalformedRunSpec { index, .. }) => json!({ "custom_run": index }),
        Some(
            EvalError::ConfigNotFound(path)
            | EvalError::DuplicateOutputDirectory(path)
            | EvalError::MalformedConfig { path, .. }
            | EvalError::MalformedStatistics { path, .. }
            | EvalError::Io { path, .. },
        ) => json!({ "path": path.display().to_string() }),
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Plan { json, .. }
        | Commands::Describe { json, .. }
        | Commands::FormatStats { json, .. }
        | Commands::Summarize { json, .. } => *json,
    }
}

fn grid_to_json(grid: &GridSummary, exp: &Experiment) -> Value {
    json!({
        "experiment": grid.experiment,
        "experiment_folder": grid.experiment_folder.display().to_string(),
        "app_package_name": exp.config.app_package_name,
        "app_executable": exp.config.app_executable,
        "datasets": grid.datasets,
        "parameter_files": grid.parameter_files,
        "sweeps": grid.sweeps,
        "custom_runs": grid.custom_runs,
        "total_jobs": grid.total_jobs,
        "parameter_sets": grid.parameter_sets,
        "summarize_statistics": exp.summarize.enabled
    })
}

fn print_grid(grid: &GridSummary, exp: &Experiment) {
    println!("experiment: {}", grid.experiment);
    println!("experiment_folder: {}", grid.experiment_folder.display());
    println!(
        "app: {}/{}",
        exp.config.app_package_name, exp.config.app_executable
    );
    println!("datasets: {}", grid.datasets);
    println!("parameter_files: {}", grid.parameter_files);
    println!("sweeps: {}", grid.sweeps);
    println!("custom_runs: {}", grid.custom_runs);
    println!("total_jobs: {}", grid.total_jobs);
    println!("summarize_statistics: {}", exp.summarize.enabled);
}

fn print_summary(summary: &Summary, out: Option<&Path>) {
    println!("runs: {}", summary.runs);
    println!("datasets: {}", summary.datasets.len());
    println!("parameter_sets: {}", summary.parameter_sets.len());
    for (metric, by_set) in &summary.by_metric {
        println!("{}:", metric);
        for (parameter_set, s) in by_set {
            println!(
                "  {}: n={} mean={} stddev={}",
                parameter_set,
                s.count,
                fmt_opt(s.mean),
                fmt_opt(s.stddev)
            );
        }
    }
    for (base, family) in &summary.sweep_families {
        println!("sweep {} over {}: {} steps", base, family.variable, family.members.len());
    }
    if let Some(path) = out {
        println!("out: {}", path.display());
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.6}", v))
}
