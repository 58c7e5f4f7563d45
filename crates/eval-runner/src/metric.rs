use serde::{Deserialize, Serialize};

/// Pre-aggregated statistics one run reports for a single metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    #[serde(alias = "count")]
    pub samples: u64,
    pub mean: f64,
    #[serde(default)]
    pub stddev: Option<f64>,
    pub min: f64,
    pub max: f64,
}

/// Running summary of one numeric quantity, mergeable with other summaries
/// of disjoint sample sets.
///
/// The empty metric (`count == 0`) is the identity for [`Metric::merge`].
/// Mean is undefined below one sample and variance below two; the accessors
/// return `None` in those cases.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Metric {
    count: u64,
    mean: f64,
    variance: f64,
    min: f64,
    max: f64,
}

/// Plain snapshot of a [`Metric`] as presented to reporting consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: u64,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Metric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_summary(summary: &SampleSummary) -> Self {
        if summary.samples == 0 {
            return Self::default();
        }
        let variance = match summary.stddev {
            Some(sd) if summary.samples > 1 && sd.is_finite() => sd * sd,
            _ => 0.0,
        };
        Self {
            count: summary.samples,
            mean: summary.mean,
            variance,
            min: summary.min,
            max: summary.max,
        }
    }

    /// Summary of a single raw observation.
    pub fn single(value: f64) -> Self {
        Self {
            count: 1,
            mean: value,
            variance: 0.0,
            min: value,
            max: value,
        }
    }

    pub fn absorb_sample(&mut self, summary: &SampleSummary) {
        self.merge(&Self::from_summary(summary));
    }

    pub fn observe(&mut self, value: f64) {
        self.merge(&Self::single(value));
    }

    /// Combines two independent summaries with the parallel
    /// (Chan et al.) update. Both sides must already be internally
    /// consistent summaries.
    pub fn merge(&mut self, other: &Metric) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let delta = self.mean - other.mean;
        let mean = (self.mean * n1 + other.mean * n2) / n;
        let sum_sq = self.sum_sq() + other.sum_sq() + (n1 * n2 / n) * delta * delta;

        self.mean = mean;
        self.variance = sum_sq / (n - 1.0);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    pub fn merged(mut self, other: &Metric) -> Metric {
        self.merge(other);
        self
    }

    // (count - 1) * variance, with single-sample and NaN variances
    // contributing nothing.
    fn sum_sq(&self) -> f64 {
        if self.count < 2 || !self.variance.is_finite() {
            0.0
        } else {
            (self.count - 1) as f64 * self.variance
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn variance(&self) -> Option<f64> {
        (self.count > 1).then_some(self.variance)
    }

    pub fn stddev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn summary(&self) -> MetricSummary {
        MetricSummary {
            count: self.count,
            mean: self.mean(),
            stddev: self.stddev(),
            min: self.min(),
            max: self.max(),
        }
    }
}

#[cfg(test)]
pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1.0);
    (a - b).abs() <= 1e-9 * scale
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(samples: u64, mean: f64, stddev: f64, min: f64, max: f64) -> SampleSummary {
        SampleSummary {
            samples,
            mean,
            stddev: Some(stddev),
            min,
            max,
        }
    }

    fn from_values(values: &[f64]) -> Metric {
        let mut m = Metric::new();
        for v in values {
            m.observe(*v);
        }
        m
    }

    fn assert_close(a: &Metric, b: &Metric) {
        assert_eq!(a.count(), b.count());
        for (x, y, what) in [
            (a.mean(), b.mean(), "mean"),
            (a.stddev(), b.stddev(), "stddev"),
            (a.min(), b.min(), "min"),
            (a.max(), b.max(), "max"),
        ] {
            match (x, y) {
                (Some(x), Some(y)) => assert!(approx_eq(x, y), "{} differs: {} vs {}", what, x, y),
                (None, None) => {}
                _ => panic!("{} defined on one side only: {:?} vs {:?}", what, x, y),
            }
        }
    }

    #[test]
    fn absorbing_two_runs_matches_hand_computed_values() {
        let mut m = Metric::new();
        m.absorb_sample(&summary(10, 0.5, 0.1, 0.3, 0.7));
        m.absorb_sample(&summary(5, 0.6, 0.05, 0.5, 0.65));

        assert_eq!(m.count(), 15);
        assert!(approx_eq(m.mean().expect("mean"), (0.5 * 10.0 + 0.6 * 5.0) / 15.0));
        assert_eq!(m.min(), Some(0.3));
        assert_eq!(m.max(), Some(0.7));
        let expected_var = (9.0 * 0.01 + 4.0 * 0.0025 + (50.0 / 15.0) * 0.01) / 14.0;
        assert!(approx_eq(m.variance().expect("variance"), expected_var));
        // (0.09 + 0.01 + 0.0333..) / 14
        let sd = m.stddev().expect("stddev");
        assert!((sd - 0.09759).abs() < 1e-4, "stddev {}", sd);
    }

    #[test]
    fn empty_metric_is_merge_identity() {
        let a = Metric::from_summary(&summary(4, 1.5, 0.2, 1.0, 2.0));
        assert_eq!(a.merged(&Metric::new()), a);
        assert_eq!(Metric::new().merged(&a), a);
        let empty = Metric::new().merged(&Metric::new());
        assert_eq!(empty, Metric::new());
        assert_eq!(empty.count(), 0);
        assert!(empty.mean().is_none());
    }

    #[test]
    fn zero_sample_summary_is_a_no_op() {
        let mut m = Metric::from_summary(&summary(3, 2.0, 1.0, 1.0, 3.0));
        let before = m;
        m.absorb_sample(&summary(0, 99.0, 5.0, -10.0, 100.0));
        assert_eq!(m, before);
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let a = Metric::from_summary(&summary(10, 0.5, 0.1, 0.3, 0.7));
        let b = Metric::from_summary(&summary(5, 0.6, 0.05, 0.5, 0.65));
        let c = Metric::from_summary(&summary(7, -1.25, 2.5, -6.0, 3.0));

        let left = a.merged(&b).merged(&c);
        let right = a.merged(&b.merged(&c));
        assert_close(&left, &right);

        let swapped = c.merged(&a).merged(&b);
        assert_close(&left, &swapped);
    }

    #[test]
    fn two_single_samples_produce_defined_variance() {
        let mut m = Metric::from_summary(&SampleSummary {
            samples: 1,
            mean: 1.0,
            stddev: Some(f64::NAN),
            min: 1.0,
            max: 1.0,
        });
        assert!(m.variance().is_none());
        m.absorb_sample(&SampleSummary {
            samples: 1,
            mean: 3.0,
            stddev: None,
            min: 3.0,
            max: 3.0,
        });
        assert_eq!(m.count(), 2);
        assert!(approx_eq(m.mean().expect("mean"), 2.0));
        assert!(approx_eq(m.variance().expect("variance"), 2.0));
    }

    #[test]
    fn nan_stddev_on_larger_run_is_treated_as_zero_spread() {
        let mut m = Metric::from_summary(&summary(3, 1.0, f64::NAN, 1.0, 1.0));
        m.absorb_sample(&summary(3, 1.0, 0.0, 1.0, 1.0));
        assert_eq!(m.variance(), Some(0.0));
    }

    #[test]
    fn merging_partitions_matches_direct_computation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0, 1.5, -3.0];
        let whole = from_values(&values);
        let merged = from_values(&values[..3]).merged(&from_values(&values[3..]));
        assert_close(&whole, &merged);

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
        assert!(approx_eq(whole.mean().expect("mean"), mean));
        assert!(approx_eq(whole.variance().expect("variance"), var));
    }

    #[test]
    fn summary_parses_count_alias_and_missing_stddev() {
        let parsed: SampleSummary =
            serde_yaml::from_str("count: 1\nmean: 0.2\nmin: 0.2\nmax: 0.2\n").expect("parse");
        assert_eq!(parsed.samples, 1);
        assert!(parsed.stddev.is_none());
    }
}
