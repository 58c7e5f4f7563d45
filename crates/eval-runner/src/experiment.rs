//! Experiment files: the YAML that declares datasets, parameter files and
//! custom runs, resolved against the experiment root's directory layout
//! (`parameter_files/`, `calibrations/`, `maps/`, `results/`).

use crate::aggregate::MetricFilter;
use crate::error::{EvalError, Result};
use crate::{read_text, yaml_to_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Key/value mapping loaded from one parameter file.
pub type ParameterMap = Map<String, Value>;

/// Keys that describe the grid itself and are not copied into job artifacts.
const GRID_KEYS: &[&str] = &[
    "datasets",
    "parameter_files",
    "custom_runs",
    "console_commands",
];

const REQUIRED_KEYS: &[&str] = &[
    "app_package_name",
    "app_executable",
    "datasets",
    "parameter_files",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummarizeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub whitelisted_metrics: Vec<String>,
    #[serde(default)]
    pub blacklisted_metrics: Vec<String>,
}

impl SummarizeSettings {
    pub fn metric_filter(&self) -> MetricFilter {
        MetricFilter::new(
            self.whitelisted_metrics.iter().cloned(),
            self.blacklisted_metrics.iter().cloned(),
        )
    }
}

/// One `datasets:` entry. `name` declares a single recording, `names` a job
/// spanning several recordings (addressed as `<BAG_FILENAME_i>`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub additional_parameters: BTreeMap<String, Value>,
}

impl DatasetEntry {
    fn file_names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.name.iter().cloned().collect();
        out.extend(self.names.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub experiment_name: Option<String>,
    pub app_package_name: String,
    pub app_executable: String,
    pub datasets: Vec<DatasetEntry>,
    pub parameter_files: Vec<String>,
    #[serde(default)]
    pub custom_runs: Vec<Value>,
    #[serde(default)]
    pub dataset_folder: Option<String>,
    #[serde(default)]
    pub ncamera_calibration_file: Option<String>,
    #[serde(default)]
    pub wheel_odometry_calibration_file: Option<String>,
    #[serde(default)]
    pub rt3k_calibration_file: Option<String>,
    #[serde(default)]
    pub sensors_file: Option<String>,
    #[serde(default)]
    pub localization_map: Option<String>,
    #[serde(default)]
    pub console_commands: Vec<String>,
    #[serde(default)]
    pub summarize_statistics: Option<SummarizeSettings>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A resolved dataset: one or more recordings driving a single job.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub files: Vec<PathBuf>,
    pub additional_parameters: BTreeMap<String, Value>,
}

impl Dataset {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            additional_parameters: BTreeMap::new(),
        }
    }

    /// Identifier recorded in job artifacts and statistics files.
    pub fn id(&self) -> String {
        self.files
            .iter()
            .map(|f| f.display().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Map key for the i-th recording: its file name without `.bag`.
    pub fn map_key(&self, index: usize) -> String {
        self.files
            .get(index)
            .and_then(|f| f.file_name())
            .map(|n| n.to_string_lossy().trim_end_matches(".bag").to_string())
            .unwrap_or_default()
    }

    /// Short name used in job folder names.
    pub fn stem(&self) -> String {
        (0..self.files.len())
            .map(|i| self.map_key(i))
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// A job defined outside the Cartesian grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomRun {
    pub index: usize,
    pub dataset: Dataset,
    pub parameter_file: String,
    pub overrides: ParameterMap,
    pub repetitions: usize,
    pub label: Option<String>,
}

impl CustomRun {
    /// Parses one `custom_runs:` entry. `dataset` and `parameter_file` are
    /// required; `parameters`, `repetitions` (default 1) and `label` are not.
    pub fn parse(index: usize, raw: &Value, data_folder: &Path) -> Result<CustomRun> {
        let malformed = |reason: String| EvalError::MalformedRunSpec { index, reason };
        let obj = raw
            .as_object()
            .ok_or_else(|| malformed("entry must be a mapping".to_string()))?;

        let missing: Vec<&str> = ["dataset", "parameter_file"]
            .into_iter()
            .filter(|key| obj.get(*key).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(malformed(format!("missing keys: {}", missing.join(", "))));
        }

        let names: Vec<String> = match &obj["dataset"] {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| malformed("dataset list must contain strings".to_string()))?,
            _ => return Err(malformed("dataset must be a string or a list".to_string())),
        };
        if names.is_empty() {
            return Err(malformed("dataset list is empty".to_string()));
        }
        let parameter_file = obj["parameter_file"]
            .as_str()
            .ok_or_else(|| malformed("parameter_file must be a string".to_string()))?
            .to_string();
        let overrides = match obj.get("parameters") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(malformed("parameters must be a mapping".to_string())),
        };
        let repetitions = match obj.get("repetitions") {
            None | Some(Value::Null) => 1,
            Some(v) => v
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| malformed("repetitions must be a positive integer".to_string()))?
                as usize,
        };
        let label = obj
            .get("label")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(CustomRun {
            index,
            dataset: Dataset::new(
                names
                    .iter()
                    .map(|n| resolve_dataset_path(n, data_folder))
                    .collect(),
            ),
            parameter_file,
            overrides,
            repetitions,
            label,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub results_folder: Option<PathBuf>,
    pub data_folder: Option<PathBuf>,
    /// `%Y%m%d_%H%M%S` stamp prefixed to the experiment folder; defaults to
    /// the current local time.
    pub generated_time: Option<String>,
}

/// A loaded experiment with every path resolved and checked.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub config: ExperimentConfig,
    pub root: PathBuf,
    pub basename: String,
    pub results_folder: PathBuf,
    pub data_folder: PathBuf,
    pub parameter_folder: PathBuf,
    pub datasets: Vec<Dataset>,
    pub parameter_files: Vec<String>,
    pub custom_runs: Vec<CustomRun>,
    pub ncamera_calibration_file: Option<PathBuf>,
    pub wheel_odometry_calibration_file: Option<PathBuf>,
    pub rt3k_calibration_file: Option<PathBuf>,
    pub sensors_file: Option<PathBuf>,
    pub localization_map: Option<PathBuf>,
    pub summarize: SummarizeSettings,
    /// Experiment-level keys copied into every job artifact.
    pub metadata: Map<String, Value>,
}

/// The directory above `experiments/`, or the experiment file's own folder
/// when it does not live in one.
pub fn find_experiment_root(experiment_dir: &Path) -> PathBuf {
    if experiment_dir.file_name().and_then(|s| s.to_str()) == Some("experiments") {
        if let Some(parent) = experiment_dir.parent() {
            return parent.to_path_buf();
        }
    }
    experiment_dir.to_path_buf()
}

/// Bare names live in the data folder; anything with a directory component
/// is used as given.
pub fn resolve_dataset_path(name: &str, data_folder: &Path) -> PathBuf {
    let path = Path::new(name);
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => path.to_path_buf(),
        _ => data_folder.join(name),
    }
}

fn validate_required_fields(path: &Path, json_value: &Value) -> Result<()> {
    let mut missing = Vec::new();
    for key in REQUIRED_KEYS {
        let is_missing = match json_value.get(*key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*key);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EvalError::MalformedConfig {
            path: path.to_path_buf(),
            reason: format!(
                "missing required fields:\n{}",
                missing
                    .iter()
                    .map(|k| format!("  - {}", k))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        })
    }
}

fn resolve_existing_file(folder: &Path, name: &str) -> Result<PathBuf> {
    let path = folder.join(name);
    if !path.is_file() {
        return Err(EvalError::ConfigNotFound(path));
    }
    Ok(path)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Experiment {
    pub fn load(path: &Path, options: &LoadOptions) -> Result<Experiment> {
        let raw_yaml = read_text(path)?;
        let json_value = yaml_to_json(path, &raw_yaml)?;
        Self::from_value(path, json_value, options)
    }

    pub fn from_value(path: &Path, json_value: Value, options: &LoadOptions) -> Result<Experiment> {
        validate_required_fields(path, &json_value)?;
        let config: ExperimentConfig =
            serde_json::from_value(json_value.clone()).map_err(|e| EvalError::MalformedConfig {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let exp_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let root = find_experiment_root(&exp_dir);
        let file_stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "experiment".to_string());
        let generated_time = options
            .generated_time
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
        let basename = format!(
            "{}_{}",
            generated_time,
            non_empty(&config.experiment_name).unwrap_or(&file_stem)
        );

        let results_folder = options
            .results_folder
            .clone()
            .unwrap_or_else(|| root.join("results"));
        let data_folder = options
            .data_folder
            .clone()
            .or_else(|| non_empty(&config.dataset_folder).map(PathBuf::from))
            .unwrap_or_else(|| root.join("datasets"));
        let parameter_folder = root.join("parameter_files");
        let calibration_folder = root.join("calibrations");

        let calibration = |value: &Option<String>| -> Result<Option<PathBuf>> {
            non_empty(value)
                .map(|name| resolve_existing_file(&calibration_folder, name))
                .transpose()
        };
        let ncamera_calibration_file = calibration(&config.ncamera_calibration_file)?;
        let wheel_odometry_calibration_file = calibration(&config.wheel_odometry_calibration_file)?;
        let rt3k_calibration_file = calibration(&config.rt3k_calibration_file)?;
        let sensors_file = calibration(&config.sensors_file)?;
        let localization_map = match non_empty(&config.localization_map) {
            Some(name) => {
                let map = root.join("maps").join(name);
                if !map.is_dir() {
                    return Err(EvalError::ConfigNotFound(map));
                }
                info!(map = %map.display(), "localization map");
                Some(map)
            }
            None => None,
        };

        let mut datasets: Vec<Dataset> = Vec::new();
        for (idx, entry) in config.datasets.iter().enumerate() {
            let names = entry.file_names();
            if names.is_empty() {
                return Err(EvalError::MalformedConfig {
                    path: path.to_path_buf(),
                    reason: format!("datasets[{}] declares neither name nor names", idx),
                });
            }
            let dataset = Dataset {
                files: names
                    .iter()
                    .map(|n| resolve_dataset_path(n, &data_folder))
                    .collect(),
                additional_parameters: entry.additional_parameters.clone(),
            };
            if !datasets.contains(&dataset) {
                datasets.push(dataset);
            }
        }

        let mut parameter_files: Vec<String> = Vec::new();
        for name in &config.parameter_files {
            resolve_existing_file(&parameter_folder, name)?;
            if !parameter_files.contains(name) {
                parameter_files.push(name.clone());
            }
        }

        let custom_runs = config
            .custom_runs
            .iter()
            .enumerate()
            .map(|(idx, raw)| CustomRun::parse(idx, raw, &data_folder))
            .collect::<Result<Vec<_>>>()?;
        for run in &custom_runs {
            resolve_existing_file(&parameter_folder, &run.parameter_file)?;
        }

        let summarize = config.summarize_statistics.clone().unwrap_or_default();

        let mut metadata = match json_value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for key in GRID_KEYS {
            metadata.remove(*key);
        }
        let resolved_paths = [
            ("ncamera_calibration_file", &ncamera_calibration_file),
            ("wheel_odometry_calibration_file", &wheel_odometry_calibration_file),
            ("rt3k_calibration_file", &rt3k_calibration_file),
            ("sensors_file", &sensors_file),
            ("localization_map", &localization_map),
        ];
        for (key, resolved) in resolved_paths {
            if let Some(p) = resolved {
                metadata.insert(key.to_string(), Value::String(p.display().to_string()));
            }
        }
        metadata.insert(
            "experiment_generated_time".to_string(),
            Value::String(generated_time),
        );
        metadata.insert("experiment_filename".to_string(), Value::String(file_stem));

        Ok(Experiment {
            config,
            root,
            basename,
            results_folder,
            data_folder,
            parameter_folder,
            datasets,
            parameter_files,
            custom_runs,
            ncamera_calibration_file,
            wheel_odometry_calibration_file,
            rt3k_calibration_file,
            sensors_file,
            localization_map,
            summarize,
            metadata,
        })
    }

    /// Folder holding every job folder of this experiment.
    pub fn experiment_folder(&self) -> PathBuf {
        self.results_folder.join(&self.basename)
    }

    pub fn parameter_source(&self) -> ParameterDir {
        ParameterDir::new(&self.parameter_folder)
    }
}

/// Where parameter files come from.
pub trait ParameterSource {
    fn load(&self, name: &str) -> Result<ParameterMap>;
}

/// Parameter files stored as YAML mappings in one directory.
#[derive(Debug, Clone)]
pub struct ParameterDir {
    root: PathBuf,
}

impl ParameterDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ParameterSource for ParameterDir {
    fn load(&self, name: &str) -> Result<ParameterMap> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(EvalError::ConfigNotFound(path));
        }
        let raw = read_text(&path)?;
        match yaml_to_json(&path, &raw)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            _ => Err(EvalError::MalformedConfig {
                path,
                reason: "parameter file must be a mapping".to_string(),
            }),
        }
    }
}

impl ParameterSource for BTreeMap<String, ParameterMap> {
    fn load(&self, name: &str) -> Result<ParameterMap> {
        self.get(name)
            .cloned()
            .ok_or_else(|| EvalError::ConfigNotFound(PathBuf::from(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ensure_dir, temp_dir};
    use serde_json::json;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = temp_dir(tag);
        for sub in ["experiments", "parameter_files", "calibrations"] {
            ensure_dir(&root.join(sub)).expect("layout dir");
        }
        root
    }

    fn options() -> LoadOptions {
        LoadOptions {
            generated_time: Some("20240101_120000".to_string()),
            ..LoadOptions::default()
        }
    }

    #[test]
    fn load_resolves_layout_and_metadata() {
        let root = temp_root("load");
        fs::write(root.join("parameter_files/p1.yaml"), "rate: 10\n").expect("p1");
        fs::write(root.join("calibrations/cam.yaml"), "cam: 1\n").expect("calib");
        let exp_path = root.join("experiments/sample.yaml");
        fs::write(
            &exp_path,
            "\
app_package_name: rovio
app_executable: rovio_node
ncamera_calibration_file: cam.yaml
datasets:
  - name: bagA.bag
  - name: /abs/bagB.bag
  - name: bagA.bag
parameter_files: [p1.yaml, p1.yaml]
operator: alice
",
        )
        .expect("experiment");

        let exp = Experiment::load(&exp_path, &options()).expect("loads");
        assert_eq!(exp.root, root);
        assert_eq!(exp.basename, "20240101_120000_sample");
        assert_eq!(exp.datasets.len(), 2, "duplicate dataset collapsed");
        assert_eq!(exp.datasets[0].files[0], root.join("datasets/bagA.bag"));
        assert_eq!(exp.datasets[1].files[0], PathBuf::from("/abs/bagB.bag"));
        assert_eq!(exp.parameter_files, vec!["p1.yaml".to_string()]);
        assert_eq!(
            exp.ncamera_calibration_file,
            Some(root.join("calibrations/cam.yaml"))
        );
        assert_eq!(exp.metadata["operator"], "alice");
        assert_eq!(exp.metadata["experiment_filename"], "sample");
        assert!(exp.metadata.get("datasets").is_none());
        assert!(exp.metadata.get("parameter_files").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_parameter_file_is_configuration_not_found() {
        let root = temp_root("missing_param");
        let exp_path = root.join("experiments/e.yaml");
        let value = json!({
            "app_package_name": "pkg",
            "app_executable": "exe",
            "datasets": [{"name": "a.bag"}],
            "parameter_files": ["absent.yaml"]
        });
        let err = Experiment::from_value(&exp_path, value, &options()).expect_err("must fail");
        match err {
            EvalError::ConfigNotFound(p) => assert!(p.ends_with("parameter_files/absent.yaml")),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_calibration_file_is_configuration_not_found() {
        let root = temp_root("missing_calib");
        fs::write(root.join("parameter_files/p.yaml"), "a: 1\n").expect("p");
        let value = json!({
            "app_package_name": "pkg",
            "app_executable": "exe",
            "rt3k_calibration_file": "rt3k.yaml",
            "datasets": [{"name": "a.bag"}],
            "parameter_files": ["p.yaml"]
        });
        let err = Experiment::from_value(&root.join("experiments/e.yaml"), value, &options())
            .expect_err("must fail");
        assert!(matches!(err, EvalError::ConfigNotFound(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn required_fields_are_reported_together() {
        let err = Experiment::from_value(
            Path::new("/nowhere/experiments/e.yaml"),
            json!({ "app_executable": "exe", "datasets": [] }),
            &options(),
        )
        .expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("app_package_name"), "{}", msg);
        assert!(msg.contains("datasets"), "{}", msg);
        assert!(msg.contains("parameter_files"), "{}", msg);
        assert!(!msg.contains("app_executable"), "{}", msg);
    }

    #[test]
    fn custom_run_requires_dataset_and_parameter_file() {
        let err = CustomRun::parse(2, &json!({ "dataset": "a.bag" }), Path::new("/data"))
            .expect_err("must fail");
        match err {
            EvalError::MalformedRunSpec { index, reason } => {
                assert_eq!(index, 2);
                assert!(reason.contains("parameter_file"), "{}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn custom_run_parses_overrides_and_repetitions() {
        let run = CustomRun::parse(
            0,
            &json!({
                "dataset": "bagB.bag",
                "parameter_file": "p2.yaml",
                "parameters": { "rate": 20 },
                "repetitions": 3
            }),
            Path::new("/data"),
        )
        .expect("parses");
        assert_eq!(run.repetitions, 3);
        assert_eq!(run.overrides["rate"], 20);
        assert_eq!(run.dataset.files, vec![PathBuf::from("/data/bagB.bag")]);

        let err = CustomRun::parse(
            1,
            &json!({ "dataset": "b", "parameter_file": "p", "repetitions": 0 }),
            Path::new("/data"),
        )
        .expect_err("zero repetitions");
        assert!(matches!(err, EvalError::MalformedRunSpec { index: 1, .. }));
    }

    #[test]
    fn dataset_naming_helpers() {
        let ds = Dataset::new(vec![
            PathBuf::from("/data/run_1.bag"),
            PathBuf::from("/data/run_2.bag"),
        ]);
        assert_eq!(ds.map_key(1), "run_2");
        assert_eq!(ds.stem(), "run_1+run_2");
        assert_eq!(ds.id(), "/data/run_1.bag,/data/run_2.bag");
    }

    #[test]
    fn in_memory_parameter_source_reports_missing_files() {
        let mut files: BTreeMap<String, ParameterMap> = BTreeMap::new();
        files.insert("p1.yaml".to_string(), ParameterMap::new());
        assert!(files.load("p1.yaml").is_ok());
        assert!(matches!(
            files.load("p2.yaml"),
            Err(EvalError::ConfigNotFound(_))
        ));
    }
}
