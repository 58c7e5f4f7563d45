use crate::error::{EvalError, Result};
use crate::metric::{Metric, SampleSummary};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// metric name -> merged metric
pub type MetricTable = BTreeMap<String, Metric>;

/// One cell of the (dataset x parameter-set) grid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunKey {
    pub dataset: String,
    pub parameter_set: String,
}

impl RunKey {
    pub fn new(dataset: impl Into<String>, parameter_set: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            parameter_set: parameter_set.into(),
        }
    }
}

/// Restricts which metric names take part in an aggregation pass.
/// A non-empty whitelist is exclusive and the blacklist is ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFilter {
    pub whitelist: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
}

impl MetricFilter {
    pub fn new<W, B>(whitelist: W, blacklist: B) -> Self
    where
        W: IntoIterator,
        W::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            blacklist: blacklist.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, metric: &str) -> bool {
        if !self.whitelist.is_empty() {
            self.whitelist.contains(metric)
        } else {
            !self.blacklist.contains(metric)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatasetSelection {
    All,
    Subset(Vec<String>),
}

/// Per-run metrics indexed by (dataset, parameter-set). Built fresh for every
/// summarization pass by a single writer and only queried afterwards.
#[derive(Debug, Clone, Default)]
pub struct AggregationIndex {
    filter: MetricFilter,
    datasets: BTreeSet<String>,
    parameter_sets: BTreeSet<String>,
    cells: BTreeMap<RunKey, MetricTable>,
}

impl AggregationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: MetricFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn filter(&self) -> &MetricFilter {
        &self.filter
    }

    pub fn datasets(&self) -> &BTreeSet<String> {
        &self.datasets
    }

    pub fn parameter_sets(&self) -> &BTreeSet<String> {
        &self.parameter_sets
    }

    /// Makes the (dataset, parameter-set) pair known even if none of its
    /// metrics pass the filter.
    pub fn register(&mut self, dataset: &str, parameter_set: &str) {
        self.datasets.insert(dataset.to_string());
        self.parameter_sets.insert(parameter_set.to_string());
        self.cells
            .entry(RunKey::new(dataset, parameter_set))
            .or_default();
    }

    /// Absorbs one run's summary for `metric`. Returns false when the
    /// filter rejected the metric.
    pub fn record(
        &mut self,
        dataset: &str,
        parameter_set: &str,
        metric: &str,
        summary: &SampleSummary,
    ) -> bool {
        self.register(dataset, parameter_set);
        if !self.filter.allows(metric) {
            debug!(metric, "metric filtered out");
            return false;
        }
        self.cells
            .entry(RunKey::new(dataset, parameter_set))
            .or_default()
            .entry(metric.to_string())
            .or_default()
            .absorb_sample(summary);
        true
    }

    pub fn cell(&self, dataset: &str, parameter_set: &str) -> Option<&MetricTable> {
        self.cells.get(&RunKey::new(dataset, parameter_set))
    }

    /// parameter set -> metrics, for every parameter set recorded on `dataset`.
    pub fn marginalize_by_dataset(&self, dataset: &str) -> Result<BTreeMap<String, MetricTable>> {
        if !self.datasets.contains(dataset) {
            return Err(EvalError::DatasetNotFound(dataset.to_string()));
        }
        Ok(self
            .cells
            .iter()
            .filter(|(key, _)| key.dataset == dataset)
            .map(|(key, table)| (key.parameter_set.clone(), table.clone()))
            .collect())
    }

    /// dataset -> metrics, for every dataset recorded with `parameter_set`.
    pub fn marginalize_by_parameter_set(
        &self,
        parameter_set: &str,
    ) -> Result<BTreeMap<String, MetricTable>> {
        if !self.parameter_sets.contains(parameter_set) {
            return Err(EvalError::ParameterSetNotFound(parameter_set.to_string()));
        }
        Ok(self
            .cells
            .iter()
            .filter(|(key, _)| key.parameter_set == parameter_set)
            .map(|(key, table)| (key.dataset.clone(), table.clone()))
            .collect())
    }

    /// Merges the selected datasets into one table per parameter set.
    pub fn join(&self, selection: &DatasetSelection) -> Result<BTreeMap<String, MetricTable>> {
        let selected: BTreeSet<&str> = match selection {
            DatasetSelection::All => self.datasets.iter().map(|d| d.as_str()).collect(),
            DatasetSelection::Subset(names) => {
                let missing: Vec<String> = names
                    .iter()
                    .filter(|name| !self.datasets.contains(name.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(EvalError::NotASubset { missing });
                }
                names.iter().map(|d| d.as_str()).collect()
            }
        };

        let mut joined: BTreeMap<String, MetricTable> = BTreeMap::new();
        for (key, table) in &self.cells {
            if !selected.contains(key.dataset.as_str()) {
                continue;
            }
            let target = joined.entry(key.parameter_set.clone()).or_default();
            for (name, metric) in table {
                target.entry(name.clone()).or_default().merge(metric);
            }
        }
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::approx_eq;

    fn s(samples: u64, mean: f64, stddev: f64, min: f64, max: f64) -> SampleSummary {
        SampleSummary {
            samples,
            mean,
            stddev: Some(stddev),
            min,
            max,
        }
    }

    fn populated() -> AggregationIndex {
        let mut index = AggregationIndex::new();
        index.record("bagA", "p1", "ate", &s(10, 0.5, 0.1, 0.3, 0.7));
        index.record("bagA", "p1", "ate", &s(5, 0.6, 0.05, 0.5, 0.65));
        index.record("bagA", "p2", "ate", &s(8, 0.9, 0.2, 0.4, 1.4));
        index.record("bagB", "p1", "ate", &s(4, 0.2, 0.02, 0.15, 0.25));
        index.record("bagB", "p1", "rpe", &s(4, 1.2, 0.3, 0.8, 1.6));
        index.record("bagC", "p2", "rpe", &s(6, 2.0, 0.5, 1.1, 2.9));
        index
    }

    #[test]
    fn record_merges_runs_of_the_same_cell() {
        let index = populated();
        let ate = index.cell("bagA", "p1").expect("cell")["ate"];
        assert_eq!(ate.count(), 15);
        assert_eq!(ate.min(), Some(0.3));
        assert_eq!(ate.max(), Some(0.7));
    }

    #[test]
    fn marginalize_by_dataset_lists_its_parameter_sets() {
        let index = populated();
        let view = index.marginalize_by_dataset("bagA").expect("known dataset");
        assert_eq!(view.keys().collect::<Vec<_>>(), vec!["p1", "p2"]);
        assert!(matches!(
            index.marginalize_by_dataset("nope"),
            Err(EvalError::DatasetNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn marginalize_by_parameter_set_lists_its_datasets() {
        let index = populated();
        let view = index.marginalize_by_parameter_set("p2").expect("known set");
        assert_eq!(view.keys().collect::<Vec<_>>(), vec!["bagA", "bagC"]);
        assert!(matches!(
            index.marginalize_by_parameter_set("p9"),
            Err(EvalError::ParameterSetNotFound(_))
        ));
    }

    #[test]
    fn join_all_equals_manual_merge_of_marginals() {
        let index = populated();
        let joined = index.join(&DatasetSelection::All).expect("join");
        for (parameter_set, metrics) in &joined {
            let per_dataset = index
                .marginalize_by_parameter_set(parameter_set)
                .expect("marginal");
            for (name, metric) in metrics {
                let mut manual = Metric::new();
                for table in per_dataset.values().rev() {
                    if let Some(m) = table.get(name) {
                        manual.merge(m);
                    }
                }
                assert_eq!(manual.count(), metric.count());
                for (x, y, what) in [
                    (manual.mean(), metric.mean(), "mean"),
                    (manual.stddev(), metric.stddev(), "stddev"),
                    (manual.min(), metric.min(), "min"),
                    (manual.max(), metric.max(), "max"),
                ] {
                    let (x, y) = (x.expect(what), y.expect(what));
                    assert!(
                        approx_eq(x, y),
                        "{}/{} {} differs: {} vs {}",
                        parameter_set,
                        name,
                        what,
                        x,
                        y
                    );
                }
            }
        }
        assert_eq!(joined["p1"]["ate"].count(), 19);
        assert_eq!(joined["p1"]["rpe"].count(), 4);
    }

    #[test]
    fn join_subset_only_uses_selected_datasets() {
        let index = populated();
        let joined = index
            .join(&DatasetSelection::Subset(vec!["bagB".to_string()]))
            .expect("join");
        assert_eq!(joined.keys().collect::<Vec<_>>(), vec!["p1"]);
        assert_eq!(joined["p1"]["ate"].count(), 4);
    }

    #[test]
    fn join_rejects_unknown_datasets() {
        let index = populated();
        let err = index
            .join(&DatasetSelection::Subset(vec![
                "bagA".to_string(),
                "bagZ".to_string(),
            ]))
            .expect_err("bagZ was never recorded");
        match err {
            EvalError::NotASubset { missing } => assert_eq!(missing, vec!["bagZ".to_string()]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn whitelist_is_exclusive_over_blacklist() {
        let filter = MetricFilter::new(["ate"], ["ate", "rpe"]);
        assert!(filter.allows("ate"));
        assert!(!filter.allows("rpe"));
        assert!(!filter.allows("time"));

        let deny_only = MetricFilter::new(Vec::<String>::new(), ["time"]);
        assert!(deny_only.allows("ate"));
        assert!(!deny_only.allows("time"));
    }

    #[test]
    fn filtered_metrics_still_register_the_cell() {
        let mut index = AggregationIndex::with_filter(MetricFilter::new(["ate"], Vec::<String>::new()));
        assert!(!index.record("bagA", "p1", "time", &s(3, 1.0, 0.1, 0.9, 1.1)));
        assert!(index.datasets().contains("bagA"));
        assert!(index.cell("bagA", "p1").expect("cell").is_empty());
    }
}
