//! Experiment grid planning and statistics aggregation.
//!
//! Jobs flow one way: an [`Experiment`] is expanded by the [`GridBuilder`]
//! into [`JobSpec`]s whose folders are written with [`materialize_jobs`];
//! an external executable fills each folder with statistics, and
//! [`summarize_files`] folds those back into an [`AggregationIndex`] and the
//! two report views of a [`Summary`].

mod aggregate;
mod error;
mod experiment;
mod grid;
mod metric;
pub mod placeholder;
mod summary;

pub use aggregate::{AggregationIndex, DatasetSelection, MetricFilter, MetricTable, RunKey};
pub use error::{EvalError, Result};
pub use experiment::{
    find_experiment_root, resolve_dataset_path, CustomRun, Dataset, DatasetEntry, Experiment,
    ExperimentConfig, LoadOptions, ParameterDir, ParameterMap, ParameterSource, SummarizeSettings,
};
pub use grid::{
    describe_grid, materialize_jobs, GridBuilder, GridSummary, JobArtifact, JobSpec,
    SweepDeclaration, SweepPoint, CONSOLE_COMMANDS_FILE, JOB_FILE, MAX_SWEEP_STEPS,
    PARAMETER_SWEEP_KEY, WRITE_STATISTICS_KEY,
};
pub use metric::{Metric, MetricSummary, SampleSummary};
pub use placeholder::{find_unresolved, PlaceholderMap};
pub use summary::{
    discover_statistics_files, format_job_statistics, load_statistics_record, summarize_files,
    summarize_records, RunSweep, StatisticsRecord, Summary, SweepFamily, SweepMember,
    FORMATTED_STATISTICS_FILE, RAW_STATISTICS_FILE,
};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

/// `create_dir_all` that reports the failing path.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| EvalError::io(path, e))
}

pub(crate) fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EvalError::ConfigNotFound(path.to_path_buf())
        } else {
            EvalError::io(path, e)
        }
    })
}

/// Parses YAML text into a JSON value so configuration can be handled with
/// one value type throughout.
pub(crate) fn yaml_to_json(path: &Path, raw_yaml: &str) -> Result<Value> {
    let malformed = |reason: String| EvalError::MalformedConfig {
        path: path.to_path_buf(),
        reason,
    };
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(raw_yaml).map_err(|e| malformed(e.to_string()))?;
    serde_json::to_value(yaml_value).map_err(|e| malformed(e.to_string()))
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EvalError::io(path, e)
    })
}

pub(crate) fn atomic_write_yaml<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let text = serde_yaml::to_string(value)?;
    atomic_write_bytes(path, text.as_bytes())?;
    Ok(())
}

pub(crate) fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "evalgrid_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("temp dir");
    dir
}
