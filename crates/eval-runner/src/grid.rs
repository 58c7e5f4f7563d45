//! Expansion of an experiment into one job per grid cell, and the job
//! folders the external executable consumes.

use crate::error::{EvalError, Result};
use crate::experiment::{CustomRun, Dataset, Experiment, ParameterMap, ParameterSource};
use crate::placeholder::{self, PlaceholderMap};
use crate::{atomic_write_yaml, ensure_dir, read_text};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Grid-builder metadata inside a parameter file; never forwarded to the
/// executable.
pub const PARAMETER_SWEEP_KEY: &str = "parameter_sweep";
pub const WRITE_STATISTICS_KEY: &str = "swe_write_statistics_to_file";
pub const MAX_SWEEP_STEPS: usize = 100;
pub const JOB_FILE: &str = "job.yaml";
pub const CONSOLE_COMMANDS_FILE: &str = "console_commands.yaml";

const LOG_DIR_KEY: &str = "log_dir";

// Keys owned by the job artifact itself; experiment metadata must not shadow them.
const ARTIFACT_KEYS: &[&str] = &[
    "experiment_name",
    "dataset",
    "parameter_file",
    "base_parameter_file",
    "parameters",
    "parameters_digest",
    "parameter_sweep",
    "repetition",
    "additional_dataset_parameters",
];

/// `parameter_sweep: {name, min, max, step_size}` as declared in a
/// parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepDeclaration {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step_size: f64,
    /// Set when `min` and `step_size` are both declared as integers; the
    /// swept values are then forwarded as integers too.
    #[serde(skip)]
    pub integral: bool,
}

impl SweepDeclaration {
    /// `min + k * step_size` for every k that stays within `max` (inclusive).
    /// Running past [`MAX_SWEEP_STEPS`] is a configuration error.
    pub fn values(&self, parameter_file: &str) -> Result<Vec<f64>> {
        let invalid = |reason: String| EvalError::InvalidSweep {
            parameter_file: parameter_file.to_string(),
            reason,
        };
        if !(self.min.is_finite() && self.max.is_finite() && self.step_size.is_finite()) {
            return Err(invalid("bounds and step_size must be finite".to_string()));
        }
        if self.step_size <= 0.0 {
            return Err(invalid(format!(
                "step_size must be positive, got {}",
                self.step_size
            )));
        }
        if self.min > self.max {
            return Err(invalid(format!(
                "min {} is greater than max {}",
                self.min, self.max
            )));
        }
        let tolerance = 1e-9 * self.max.abs().max(self.step_size).max(1.0);
        let mut values = Vec::new();
        for k in 0.. {
            let value = self.min + k as f64 * self.step_size;
            if value > self.max + tolerance {
                break;
            }
            if values.len() == MAX_SWEEP_STEPS {
                return Err(invalid(format!(
                    "sweep over {} needs more than {} steps",
                    self.name, MAX_SWEEP_STEPS
                )));
            }
            values.push(value);
        }
        Ok(values)
    }

    /// The swept value as it is written into the job's parameters.
    pub fn parameter_value(&self, value: f64) -> Value {
        if self.integral {
            json!(value.round() as i64)
        } else {
            json!(value)
        }
    }

    fn from_parameters(parameters: &ParameterMap, parameter_file: &str) -> Result<Option<Self>> {
        let raw = match parameters.get(PARAMETER_SWEEP_KEY) {
            None | Some(Value::Null) => return Ok(None),
            Some(raw) => raw,
        };
        let mut sweep: SweepDeclaration =
            serde_json::from_value(raw.clone()).map_err(|e| EvalError::InvalidSweep {
                parameter_file: parameter_file.to_string(),
                reason: e.to_string(),
            })?;
        let is_integer = |key: &str| raw.get(key).is_some_and(|v| v.is_i64() || v.is_u64());
        sweep.integral = is_integer("min") && is_integer("step_size");
        Ok(Some(sweep))
    }
}

// Label form of a sweep value, with accumulated rounding noise trimmed
// (0.30000000000000004 -> 0.3).
fn sweep_label_value(value: f64) -> String {
    let rounded = (value * 1e9).round() / 1e9;
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
}

/// One member of a sweep family, recorded in the job artifact so the
/// summary can order the family by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub name: String,
    pub value: f64,
    pub base_parameter_file: String,
}

/// A fully resolved grid cell.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    /// `<experiment basename>/<job name>`
    pub experiment_name: String,
    pub job_name: String,
    pub output_dir: PathBuf,
    pub dataset: Dataset,
    /// Label the job's statistics are grouped under.
    pub parameter_set: String,
    pub parameter_file: String,
    pub parameters: ParameterMap,
    pub sweep: Option<SweepPoint>,
    pub repetition: Option<usize>,
    pub write_statistics: bool,
    pub console_commands: Vec<String>,
}

/// The `job.yaml` written into every job folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArtifact {
    pub experiment_name: String,
    pub dataset: String,
    pub parameter_file: String,
    pub base_parameter_file: String,
    pub parameters: ParameterMap,
    #[serde(default)]
    pub parameters_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_sweep: Option<SweepPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_dataset_parameters: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct ConsoleBatch<'a> {
    vi_map_folder_paths: Vec<String>,
    commands: &'a [String],
}

fn parameters_digest(parameters: &ParameterMap) -> String {
    let bytes = serde_json::to_vec(parameters).unwrap_or_default();
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

impl JobSpec {
    pub fn artifact(&self, metadata: &Map<String, Value>) -> JobArtifact {
        let mut metadata = metadata.clone();
        for key in ARTIFACT_KEYS {
            metadata.remove(*key);
        }
        JobArtifact {
            experiment_name: self.experiment_name.clone(),
            dataset: self.dataset.id(),
            parameter_file: self.parameter_set.clone(),
            base_parameter_file: self.parameter_file.clone(),
            parameters: self.parameters.clone(),
            parameters_digest: Some(parameters_digest(&self.parameters)),
            parameter_sweep: self.sweep.clone(),
            repetition: self.repetition,
            additional_dataset_parameters: self.dataset.additional_parameters.clone(),
            metadata,
        }
    }

    fn map_folders(&self) -> Vec<String> {
        (0..self.dataset.files.len())
            .map(|i| {
                self.output_dir
                    .join(self.dataset.map_key(i))
                    .display()
                    .to_string()
            })
            .collect()
    }
}

impl JobArtifact {
    pub fn load(job_dir: &Path) -> Result<JobArtifact> {
        let path = job_dir.join(JOB_FILE);
        let raw = read_text(&path)?;
        serde_yaml::from_str(&raw).map_err(|e| EvalError::MalformedConfig {
            path,
            reason: e.to_string(),
        })
    }
}

fn strip_yaml(name: &str) -> &str {
    name.strip_suffix(".yaml")
        .or_else(|| name.strip_suffix(".yml"))
        .unwrap_or(name)
}

/// Expands datasets x parameter files (plus custom runs) into job specs.
#[derive(Debug, Clone, Default)]
pub struct GridBuilder {
    experiment_folder: PathBuf,
    basename: String,
    placeholders: BTreeMap<String, String>,
    write_statistics: bool,
    console_commands: Vec<String>,
}

impl GridBuilder {
    pub fn new(results_folder: &Path, basename: &str) -> Self {
        Self {
            experiment_folder: results_folder.join(basename),
            basename: basename.to_string(),
            ..Self::default()
        }
    }

    pub fn from_experiment(experiment: &Experiment) -> Self {
        let mut builder = Self::new(&experiment.results_folder, &experiment.basename)
            .write_statistics(experiment.summarize.enabled)
            .console_commands(experiment.config.console_commands.clone());
        let declared = [
            (placeholder::NCAM_CALIB_FILENAME, &experiment.ncamera_calibration_file),
            (
                placeholder::WHEEL_ODO_CALIB_FILENAME,
                &experiment.wheel_odometry_calibration_file,
            ),
            (placeholder::RT3K_CALIB_FILENAME, &experiment.rt3k_calibration_file),
            (placeholder::SENSORS_YAML, &experiment.sensors_file),
            (placeholder::LOCALIZATION_MAP, &experiment.localization_map),
        ];
        for (token, path) in declared {
            if let Some(path) = path {
                builder = builder.placeholder(token, path.display().to_string());
            }
        }
        builder
    }

    /// Adds an experiment-wide token, e.g. a calibration file.
    pub fn placeholder(mut self, name: &str, value: impl Into<String>) -> Self {
        self.placeholders.insert(name.to_string(), value.into());
        self
    }

    pub fn write_statistics(mut self, enabled: bool) -> Self {
        self.write_statistics = enabled;
        self
    }

    pub fn console_commands(mut self, commands: Vec<String>) -> Self {
        self.console_commands = commands;
        self
    }

    pub fn experiment_folder(&self) -> &Path {
        &self.experiment_folder
    }

    fn placeholder_map(&self, dataset: &Dataset, job_folder: &Path) -> PlaceholderMap {
        let folder = job_folder.display().to_string();
        let mut map = PlaceholderMap::new();
        for (name, value) in &self.placeholders {
            map.insert(name.clone(), value.clone());
        }
        map.insert(placeholder::LOG_DIR, folder.clone());
        map.insert(placeholder::OUTPUT_DIR, folder);
        for (i, file) in dataset.files.iter().enumerate() {
            let key = dataset.map_key(i);
            map.insert_indexed(placeholder::BAG_FILENAME, i, file.display().to_string());
            map.insert_indexed(
                placeholder::OUTPUT_MAP_FOLDER,
                i,
                job_folder.join(&key).display().to_string(),
            );
            map.insert_indexed(placeholder::OUTPUT_MAP_KEY, i, key);
        }
        map
    }

    pub fn build(
        &self,
        datasets: &[Dataset],
        parameter_files: &[String],
        custom_runs: &[CustomRun],
        source: &dyn ParameterSource,
    ) -> Result<Vec<JobSpec>> {
        let mut jobs = Vec::new();
        for dataset in datasets {
            for parameter_file in parameter_files {
                let base = source.load(parameter_file)?;
                self.expand_file(dataset, parameter_file, base, &mut jobs)?;
            }
        }
        for run in custom_runs {
            self.expand_custom_run(run, source, &mut jobs)?;
        }

        let mut seen = BTreeSet::new();
        for job in &jobs {
            if !seen.insert(job.output_dir.clone()) {
                return Err(EvalError::DuplicateOutputDirectory(job.output_dir.clone()));
            }
        }
        debug!(jobs = jobs.len(), "grid expanded");
        Ok(jobs)
    }

    fn expand_file(
        &self,
        dataset: &Dataset,
        parameter_file: &str,
        base: ParameterMap,
        jobs: &mut Vec<JobSpec>,
    ) -> Result<()> {
        let cell = format!("{}__{}", dataset.stem(), strip_yaml(parameter_file));
        let Some(sweep) = SweepDeclaration::from_parameters(&base, parameter_file)? else {
            jobs.push(self.job(
                dataset,
                parameter_file,
                parameter_file.to_string(),
                cell,
                base,
                None,
                None,
            )?);
            return Ok(());
        };
        for (step, value) in sweep.values(parameter_file)?.into_iter().enumerate() {
            let mut parameters = base.clone();
            parameters.insert(sweep.name.clone(), sweep.parameter_value(value));
            let point = SweepPoint {
                name: sweep.name.clone(),
                value,
                base_parameter_file: parameter_file.to_string(),
            };
            jobs.push(self.job(
                dataset,
                parameter_file,
                format!("{}_SWEEP_{}", parameter_file, sweep_label_value(value)),
                format!("{}__SWEEP_{}", cell, step),
                parameters,
                Some(point),
                None,
            )?);
        }
        Ok(())
    }

    fn expand_custom_run(
        &self,
        run: &CustomRun,
        source: &dyn ParameterSource,
        jobs: &mut Vec<JobSpec>,
    ) -> Result<()> {
        let mut parameters = source.load(&run.parameter_file)?;
        if let Some(sweep) = SweepDeclaration::from_parameters(&parameters, &run.parameter_file)? {
            if !run.overrides.contains_key(&sweep.name) {
                return Err(EvalError::MalformedRunSpec {
                    index: run.index,
                    reason: format!(
                        "{} sweeps {}; a custom run on it must set {} in its parameters",
                        run.parameter_file, sweep.name, sweep.name
                    ),
                });
            }
            debug!(
                custom_run = run.index,
                variable = %sweep.name,
                "custom run pins the swept variable; sweep not expanded"
            );
        }
        let mut overridden = false;
        for (key, value) in &run.overrides {
            if parameters.get(key) != Some(value) {
                overridden = true;
            }
            parameters.insert(key.clone(), value.clone());
        }
        let parameter_set = if overridden {
            let suffix = run
                .label
                .clone()
                .unwrap_or_else(|| format!("custom_{}", run.index));
            format!("{}+{}", run.parameter_file, suffix)
        } else {
            run.parameter_file.clone()
        };
        for repetition in 0..run.repetitions {
            let job_name = format!(
                "{}__{}__custom_{}__rep_{}",
                run.dataset.stem(),
                strip_yaml(&run.parameter_file),
                run.index,
                repetition
            );
            jobs.push(self.job(
                &run.dataset,
                &run.parameter_file,
                parameter_set.clone(),
                job_name,
                parameters.clone(),
                None,
                Some(repetition),
            )?);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn job(
        &self,
        dataset: &Dataset,
        parameter_file: &str,
        parameter_set: String,
        job_name: String,
        mut parameters: ParameterMap,
        sweep: Option<SweepPoint>,
        repetition: Option<usize>,
    ) -> Result<JobSpec> {
        let output_dir = self.experiment_folder.join(&job_name);
        parameters.remove(PARAMETER_SWEEP_KEY);
        parameters.insert(
            LOG_DIR_KEY.to_string(),
            Value::String(output_dir.display().to_string()),
        );

        let placeholders = self.placeholder_map(dataset, &output_dir);
        let mut resolved = ParameterMap::new();
        for (key, value) in &parameters {
            resolved.insert(key.clone(), placeholders.resolve_value(value)?);
        }
        if self.write_statistics {
            resolved.insert(WRITE_STATISTICS_KEY.to_string(), json!(1));
        }
        let console_commands = self
            .console_commands
            .iter()
            .map(|c| placeholders.resolve(c))
            .collect::<Result<Vec<_>>>()?;

        Ok(JobSpec {
            experiment_name: format!("{}/{}", self.basename, job_name),
            job_name,
            output_dir,
            dataset: dataset.clone(),
            parameter_set,
            parameter_file: parameter_file.to_string(),
            parameters: resolved,
            sweep,
            repetition,
            write_statistics: self.write_statistics,
            console_commands,
        })
    }
}

fn create_job_folder(folder: &Path) -> Result<()> {
    info!(folder = %folder.display(), "creating job folder");
    if folder.is_dir() {
        info!(folder = %folder.display(), "job folder already exists");
        return Ok(());
    }
    ensure_dir(folder)
}

/// Creates every job folder and writes its `job.yaml` (and the console
/// batch file when commands are declared). Existing folders are reused.
pub fn materialize_jobs(
    jobs: &[JobSpec],
    metadata: &Map<String, Value>,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut folders = Vec::with_capacity(jobs.len());
    for job in jobs {
        create_job_folder(&job.output_dir)?;

        if !job.console_commands.is_empty() {
            let batch_path = job.output_dir.join(CONSOLE_COMMANDS_FILE);
            let batch = ConsoleBatch {
                vi_map_folder_paths: job.map_folders(),
                commands: &job.console_commands,
            };
            atomic_write_yaml(&batch_path, &batch)?;
            info!(path = %batch_path.display(), "wrote console commands");
        }

        let job_path = job.output_dir.join(JOB_FILE);
        atomic_write_yaml(&job_path, &job.artifact(metadata))?;
        info!(path = %job_path.display(), "wrote job");
        folders.push(job.output_dir.clone());
    }
    Ok(folders)
}

/// Shape of an experiment's grid, computed without touching job folders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSummary {
    pub experiment: String,
    pub experiment_folder: PathBuf,
    pub datasets: usize,
    pub parameter_files: usize,
    pub sweeps: usize,
    pub custom_runs: usize,
    pub total_jobs: usize,
    pub parameter_sets: Vec<String>,
}

pub fn describe_grid(
    experiment: &Experiment,
    source: &dyn ParameterSource,
) -> Result<GridSummary> {
    let builder = GridBuilder::from_experiment(experiment);
    let jobs = builder.build(
        &experiment.datasets,
        &experiment.parameter_files,
        &experiment.custom_runs,
        source,
    )?;
    let mut sweeps = 0;
    for parameter_file in &experiment.parameter_files {
        let base = source.load(parameter_file)?;
        if SweepDeclaration::from_parameters(&base, parameter_file)?.is_some() {
            sweeps += 1;
        }
    }
    let parameter_sets: BTreeSet<String> = jobs.iter().map(|j| j.parameter_set.clone()).collect();
    Ok(GridSummary {
        experiment: experiment.basename.clone(),
        experiment_folder: builder.experiment_folder().to_path_buf(),
        datasets: experiment.datasets.len(),
        parameter_files: experiment.parameter_files.len(),
        sweeps,
        custom_runs: experiment.custom_runs.len(),
        total_jobs: jobs.len(),
        parameter_sets: parameter_sets.into_iter().collect(),
    })
}
