//! Folding per-run statistics files into comparison views.

use crate::aggregate::{AggregationIndex, DatasetSelection, MetricFilter, MetricTable};
use crate::error::{EvalError, Result};
use crate::grid::JobArtifact;
use crate::metric::{MetricSummary, SampleSummary};
use crate::{atomic_write_json_pretty, atomic_write_yaml, read_text};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Metric summaries the executable writes into its job folder.
pub const RAW_STATISTICS_FILE: &str = "statistics.yaml";
/// Per-run record consumed by the summarizer.
pub const FORMATTED_STATISTICS_FILE: &str = "formatted_stats.yaml";

const SWEEP_LABEL_MARKER: &str = "_SWEEP_";

/// Sweep metadata attached to a run. Older records carry only the swept
/// variable's name; the value and base file are then recovered from the
/// `<base>_SWEEP_<value>` label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSweep")]
pub struct RunSweep {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_parameter_file: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSweep {
    Name(String),
    Point {
        name: String,
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        base_parameter_file: Option<String>,
    },
}

impl From<RawSweep> for RunSweep {
    fn from(raw: RawSweep) -> Self {
        match raw {
            RawSweep::Name(name) => RunSweep {
                name,
                value: None,
                base_parameter_file: None,
            },
            RawSweep::Point {
                name,
                value,
                base_parameter_file,
            } => RunSweep {
                name,
                value,
                base_parameter_file,
            },
        }
    }
}

impl RunSweep {
    /// (base parameter set, sweep value) for a run labelled `parameter_set`.
    pub fn position(&self, parameter_set: &str) -> Option<(String, f64)> {
        let from_label = parameter_set.rsplit_once(SWEEP_LABEL_MARKER);
        let base = self
            .base_parameter_file
            .clone()
            .or_else(|| from_label.map(|(base, _)| base.to_string()))?;
        let value = self
            .value
            .or_else(|| from_label.and_then(|(_, v)| v.parse().ok()))?;
        Some((base, value))
    }
}

/// One completed run as read from `formatted_stats.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub dataset: String,
    #[serde(alias = "param_label")]
    pub parameter_file: String,
    #[serde(alias = "results")]
    pub metrics: BTreeMap<String, SampleSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_sweep: Option<RunSweep>,
}

pub fn load_statistics_record(path: &Path) -> Result<StatisticsRecord> {
    let raw = read_text(path)?;
    serde_yaml::from_str(&raw).map_err(|e| EvalError::MalformedStatistics {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepMember {
    pub parameter_set: String,
    pub value: f64,
}

/// The parameter sets generated by one sweep, ordered by sweep value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFamily {
    pub variable: String,
    pub members: Vec<SweepMember>,
}

/// Both report views of one summarization pass, plus the sweep grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub runs: usize,
    pub datasets: Vec<String>,
    pub parameter_sets: Vec<String>,
    /// metric -> parameter set -> summary
    pub by_metric: BTreeMap<String, BTreeMap<String, MetricSummary>>,
    /// parameter set -> metric -> summary
    pub by_parameter_set: BTreeMap<String, BTreeMap<String, MetricSummary>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sweep_families: BTreeMap<String, SweepFamily>,
}

impl Summary {
    fn from_joined(
        runs: usize,
        index: &AggregationIndex,
        joined: &BTreeMap<String, MetricTable>,
        sweep_families: BTreeMap<String, SweepFamily>,
    ) -> Self {
        let mut by_metric: BTreeMap<String, BTreeMap<String, MetricSummary>> = BTreeMap::new();
        let mut by_parameter_set = BTreeMap::new();
        for (parameter_set, table) in joined {
            let mut row = BTreeMap::new();
            for (metric, merged) in table {
                let summary = merged.summary();
                row.insert(metric.clone(), summary);
                by_metric
                    .entry(metric.clone())
                    .or_default()
                    .insert(parameter_set.clone(), summary);
            }
            by_parameter_set.insert(parameter_set.clone(), row);
        }
        Summary {
            runs,
            datasets: index.datasets().iter().cloned().collect(),
            parameter_sets: index.parameter_sets().iter().cloned().collect(),
            by_metric,
            by_parameter_set,
            sweep_families,
        }
    }

    /// Writes YAML, or pretty JSON when `path` ends in `.json`.
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            atomic_write_json_pretty(path, self)?;
        } else {
            atomic_write_yaml(path, self)?;
        }
        info!(path = %path.display(), "wrote summary");
        Ok(())
    }
}

fn record_sweep(families: &mut BTreeMap<String, SweepFamily>, record: &StatisticsRecord) {
    let Some(sweep) = &record.parameter_sweep else {
        return;
    };
    let Some((base, value)) = sweep.position(&record.parameter_file) else {
        warn!(
            parameter_set = %record.parameter_file,
            variable = %sweep.name,
            "sweep value could not be determined; run left out of its sweep family"
        );
        return;
    };
    let family = families.entry(base).or_insert_with(|| SweepFamily {
        variable: sweep.name.clone(),
        members: Vec::new(),
    });
    if !family
        .members
        .iter()
        .any(|m| m.parameter_set == record.parameter_file)
    {
        family.members.push(SweepMember {
            parameter_set: record.parameter_file.clone(),
            value,
        });
    }
}

/// Aggregates already-parsed records over every dataset.
pub fn summarize_records(records: &[StatisticsRecord], filter: MetricFilter) -> Result<Summary> {
    let mut index = AggregationIndex::with_filter(filter);
    let mut families = BTreeMap::new();
    for record in records {
        index.register(&record.dataset, &record.parameter_file);
        for (metric, sample) in &record.metrics {
            index.record(&record.dataset, &record.parameter_file, metric, sample);
        }
        record_sweep(&mut families, record);
    }
    for family in families.values_mut() {
        family.members.sort_by(|a, b| a.value.total_cmp(&b.value));
    }
    let joined = index.join(&DatasetSelection::All)?;
    Ok(Summary::from_joined(records.len(), &index, &joined, families))
}

/// Loads every statistics file and aggregates them. The first malformed
/// file aborts the pass.
pub fn summarize_files(paths: &[PathBuf], filter: MetricFilter) -> Result<Summary> {
    let records = paths
        .iter()
        .map(|p| load_statistics_record(p))
        .collect::<Result<Vec<_>>>()?;
    let summary = summarize_records(&records, filter)?;
    info!(
        runs = summary.runs,
        datasets = summary.datasets.len(),
        parameter_sets = summary.parameter_sets.len(),
        "extracted statistics"
    );
    Ok(summary)
}

/// Every `formatted_stats.yaml` below `results_dir`, in path order.
pub fn discover_statistics_files(results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !results_dir.is_dir() {
        return Err(EvalError::ConfigNotFound(results_dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(results_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(results_dir).to_path_buf();
            EvalError::io(path, e.into())
        })?;
        if entry.file_type().is_file() && entry.file_name() == FORMATTED_STATISTICS_FILE {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Combines a job's `job.yaml` with the executable's raw statistics into
/// the record the summarizer reads. Returns the written path.
pub fn format_job_statistics(job_dir: &Path) -> anyhow::Result<PathBuf> {
    let artifact = JobArtifact::load(job_dir)?;
    let raw_path = job_dir.join(RAW_STATISTICS_FILE);
    let raw = read_text(&raw_path)?;
    let metrics: BTreeMap<String, SampleSummary> =
        serde_yaml::from_str(&raw).map_err(|e| EvalError::MalformedStatistics {
            path: raw_path.clone(),
            reason: e.to_string(),
        })?;
    let record = StatisticsRecord {
        dataset: artifact.dataset,
        parameter_file: artifact.parameter_file,
        metrics,
        parameter_sweep: artifact.parameter_sweep.map(|point| RunSweep {
            name: point.name,
            value: Some(point.value),
            base_parameter_file: Some(point.base_parameter_file),
        }),
    };
    let out = job_dir.join(FORMATTED_STATISTICS_FILE);
    atomic_write_yaml(&out, &record)?;
    info!(path = %out.display(), metrics = record.metrics.len(), "wrote formatted statistics");
    Ok(out)
}
