//! Rule statistics, quality gating and the overfitting check.
//!
//! [`RuleStats`] holds raw counters. [`Metrics`] are derived from them by
//! [`RuleStats::compute`], a pure function of the counters plus the
//! per-target [`StatsParams`]; nothing reads metrics before that.

use serde::{Deserialize, Serialize};

/// Which derived confidence ranks rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QualityMeasure {
    #[default]
    #[serde(rename = "smoothedConf")]
    SmoothedConf,
    #[serde(rename = "standardConf")]
    StandardConf,
    #[serde(rename = "pcaConf")]
    PcaConf,
    #[serde(rename = "apcaConf")]
    ApcaConf,
}

impl std::fmt::Display for QualityMeasure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QualityMeasure::SmoothedConf => "smoothedConf",
            QualityMeasure::StandardConf => "standardConf",
            QualityMeasure::PcaConf => "pcaConf",
            QualityMeasure::ApcaConf => "apcaConf",
        };
        f.write_str(name)
    }
}

/// Per-target inputs to [`RuleStats::compute`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsParams {
    /// Laplace offset added to the prediction count of smoothed confidence.
    pub confidence_offset: f64,
    /// Whether the target is functional; selects what apcaConf means.
    pub functional: bool,
}

impl Default for StatsParams {
    fn default() -> Self {
        Self {
            confidence_offset: 5.0,
            functional: false,
        }
    }
}

/// Metrics derived from a rule's counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub standard_conf: f64,
    pub smoothed_conf: f64,
    pub pca_conf: f64,
    pub apca_conf: f64,
    pub head_coverage: f64,
    pub valid_precision: f64,
}

impl Metrics {
    pub fn quality(&self, measure: QualityMeasure) -> f64 {
        match measure {
            QualityMeasure::SmoothedConf => self.smoothed_conf,
            QualityMeasure::StandardConf => self.standard_conf,
            QualityMeasure::PcaConf => self.pca_conf,
            QualityMeasure::ApcaConf => self.apca_conf,
        }
    }

    /// The six metrics in index-file order.
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.standard_conf,
            self.smoothed_conf,
            self.pca_conf,
            self.apca_conf,
            self.head_coverage,
            self.valid_precision,
        ]
    }

    pub fn from_array(values: [f64; 6]) -> Self {
        let [standard_conf, smoothed_conf, pca_conf, apca_conf, head_coverage, valid_precision] =
            values;
        Self {
            standard_conf,
            smoothed_conf,
            pca_conf,
            apca_conf,
            head_coverage,
            valid_precision,
        }
    }
}

/// Raw counters of a rule plus its metrics once computed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleStats {
    /// Predictions that are known true.
    pub support: u64,
    pub total_predictions: u64,
    /// Predictions whose anchor side has at least one known true pair.
    pub pca_total_predictions: u64,
    /// Size of the known true set the rule is measured against.
    pub ground_truth: u64,
    /// Predictions not known true (candidates for validation).
    pub valid_total_predictions: u64,
    /// Of those, predictions found in the validation split.
    pub valid_predictions: u64,
    metrics: Option<Metrics>,
}

impl RuleStats {
    /// Empty counters measured against a known true set of `ground_truth` pairs.
    pub fn against(ground_truth: u64) -> Self {
        Self {
            ground_truth,
            ..Default::default()
        }
    }

    /// Stats known only by their metrics, as read back from a rule file.
    pub fn from_metrics(metrics: Metrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Default::default()
        }
    }

    /// Derive metrics from the current counters.
    pub fn compute(&mut self, params: &StatsParams) -> Metrics {
        let support = self.support as f64;
        let total = self.total_predictions as f64;
        let pca_total = self.pca_total_predictions as f64;
        let ground_truth = self.ground_truth as f64;

        let smoothed_conf = support / (total + params.confidence_offset);
        let standard_conf = if self.total_predictions == 0 {
            0.0
        } else {
            support / total
        };
        let pca_conf = if self.pca_total_predictions == 0 {
            0.0
        } else {
            support / pca_total
        };
        let head_coverage = if self.ground_truth == 0 {
            0.0
        } else {
            support / ground_truth
        };
        let valid_precision = if self.valid_total_predictions == 0 {
            0.0
        } else {
            self.valid_predictions as f64 / self.valid_total_predictions as f64
        };
        let apca_conf = if params.functional {
            pca_conf
        } else {
            smoothed_conf
        };

        let metrics = Metrics {
            standard_conf,
            smoothed_conf,
            pca_conf,
            apca_conf,
            head_coverage,
            valid_precision,
        };
        self.metrics = Some(metrics);
        metrics
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Quality under `measure`; zero before [`compute`](Self::compute).
    pub fn quality(&self, measure: QualityMeasure) -> f64 {
        self.metrics.map_or(0.0, |m| m.quality(measure))
    }

    /// Add another rule's prediction counters to these.
    pub fn absorb(&mut self, other: &RuleStats) {
        self.support += other.support;
        self.total_predictions += other.total_predictions;
        self.pca_total_predictions += other.pca_total_predictions;
    }
}

/// Minimum support, quality and head coverage a rule must reach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_support: u64,
    pub min_confidence: f64,
    pub min_head_coverage: f64,
    pub measure: QualityMeasure,
}

impl QualityGate {
    pub fn passes(&self, stats: &RuleStats) -> bool {
        let Some(metrics) = stats.metrics() else {
            return false;
        };
        stats.support >= self.min_support
            && metrics.quality(self.measure) >= self.min_confidence
            && metrics.head_coverage >= self.min_head_coverage
    }
}

/// Flags rules whose validation precision lags their training quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverfittingCheck {
    /// Fixed threshold used when `use_sigmoid` is off.
    pub factor: f64,
    pub use_sigmoid: bool,
    pub measure: QualityMeasure,
}

impl OverfittingCheck {
    /// Threshold for a rule of `length` body atoms and complexity adjustment
    /// `type_adjustment` (1 for both-anchored instances, 0 otherwise).
    pub fn threshold(&self, length: usize, type_adjustment: u8) -> f64 {
        if self.use_sigmoid {
            sigmoid(length as f64 + f64::from(type_adjustment))
        } else {
            self.factor
        }
    }

    pub fn overfits(&self, metrics: &Metrics, length: usize, type_adjustment: u8) -> bool {
        metrics.quality(self.measure) * self.threshold(length, type_adjustment)
            > metrics.valid_precision
    }
}

/// Maps complexity in `[0, inf)` onto `[0, 1)`, rising with complexity.
fn sigmoid(complexity: f64) -> f64 {
    (1.0 / (1.0 + (-0.5 * complexity).exp()) - 0.5) * 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(support: u64, total: u64, pca_total: u64, ground_truth: u64) -> RuleStats {
        RuleStats {
            support,
            total_predictions: total,
            pca_total_predictions: pca_total,
            ground_truth,
            ..Default::default()
        }
    }

    #[test]
    fn derived_metrics_follow_counters() {
        let mut s = stats(3, 10, 6, 30);
        s.valid_total_predictions = 7;
        s.valid_predictions = 2;
        let m = s.compute(&StatsParams::default());

        assert!((m.smoothed_conf - 3.0 / 15.0).abs() < 1e-12);
        assert!((m.standard_conf - 0.3).abs() < 1e-12);
        assert!((m.pca_conf - 0.5).abs() < 1e-12);
        assert!((m.head_coverage - 0.1).abs() < 1e-12);
        assert!((m.valid_precision - 2.0 / 7.0).abs() < 1e-12);
        assert_eq!(m.apca_conf, m.smoothed_conf);
    }

    #[test]
    fn zero_denominators_yield_zero() {
        let mut s = stats(0, 0, 0, 0);
        let m = s.compute(&StatsParams::default());
        assert_eq!(m.standard_conf, 0.0);
        assert_eq!(m.pca_conf, 0.0);
        assert_eq!(m.head_coverage, 0.0);
        assert_eq!(m.valid_precision, 0.0);
        assert_eq!(m.smoothed_conf, 0.0);
    }

    #[test]
    fn apca_uses_pca_for_functional_targets() {
        let mut s = stats(2, 8, 4, 10);
        let m = s.compute(&StatsParams {
            confidence_offset: 5.0,
            functional: true,
        });
        assert_eq!(m.apca_conf, m.pca_conf);
    }

    #[test]
    fn quality_is_zero_before_compute() {
        let s = stats(5, 5, 5, 5);
        assert!(s.metrics().is_none());
        assert_eq!(s.quality(QualityMeasure::StandardConf), 0.0);
    }

    #[test]
    fn quality_gate() {
        let gate = QualityGate {
            min_support: 2,
            min_confidence: 0.1,
            min_head_coverage: 0.0,
            measure: QualityMeasure::StandardConf,
        };
        let mut good = stats(2, 4, 4, 10);
        good.compute(&StatsParams::default());
        assert!(gate.passes(&good));

        let mut weak = stats(1, 2, 2, 10);
        weak.compute(&StatsParams::default());
        assert!(!gate.passes(&weak));

        assert!(!gate.passes(&stats(9, 9, 9, 9)));
    }

    #[test]
    fn fixed_factor_zero_never_overfits() {
        let check = OverfittingCheck {
            factor: 0.0,
            use_sigmoid: false,
            measure: QualityMeasure::SmoothedConf,
        };
        let metrics = Metrics {
            smoothed_conf: 0.9,
            ..Default::default()
        };
        assert!(!check.overfits(&metrics, 3, 1));
    }

    #[test]
    fn sigmoid_threshold_rises_with_complexity() {
        let check = OverfittingCheck {
            factor: 0.0,
            use_sigmoid: true,
            measure: QualityMeasure::SmoothedConf,
        };
        let t1 = check.threshold(1, 0);
        let t2 = check.threshold(1, 1);
        let t3 = check.threshold(3, 1);
        assert!(t1 > 0.0 && t1 < t2 && t2 < t3 && t3 < 1.0);

        let metrics = Metrics {
            smoothed_conf: 0.8,
            valid_precision: 0.1,
            ..Default::default()
        };
        assert!(check.overfits(&metrics, 3, 1));
    }

    #[test]
    fn absorb_sums_prediction_counters() {
        let mut total = RuleStats::default();
        total.absorb(&stats(2, 5, 3, 9));
        total.absorb(&stats(1, 1, 1, 9));
        assert_eq!(total.support, 3);
        assert_eq!(total.total_predictions, 6);
        assert_eq!(total.pca_total_predictions, 4);
        assert_eq!(total.ground_truth, 0);
    }

    #[test]
    fn quality_measure_names() {
        let parsed: QualityMeasure = serde_json::from_str("\"apcaConf\"").unwrap();
        assert_eq!(parsed, QualityMeasure::ApcaConf);
        assert_eq!(QualityMeasure::PcaConf.to_string(), "pcaConf");
    }
}
