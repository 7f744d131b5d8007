//! Run configuration, persisted as TOML.
//!
//! One immutable [`Config`] is loaded at startup and handed by reference to
//! every phase. Sections mirror the pipeline: `[data]` says where the splits
//! live and which relations to learn, `[learn]` drives generalization and
//! specialization, `[apply]` drives application and evaluation. Every field
//! has a default, so a partial file (or none at all) is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::ApplicationConfig;
use crate::dispatch::converge::ConvergenceConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::evaluation::EvaluationConfig;
use crate::generalization::GeneralizationConfig;
use crate::rule::{OverfittingCheck, QualityGate, QualityMeasure, StatsParams};
use crate::specialization::SpecializationConfig;

/// How learned rules become ranked answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Apply every rule into the prediction map, then rank.
    #[default]
    Ranked,
    /// Apply rules in quality order until test-query coverage converges.
    Converge,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub learn: LearnConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
}

// ---------------------------------------------------------------------------
// [data]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Base directory the other paths are relative to.
    #[serde(default = "default_home")]
    pub home: PathBuf,
    #[serde(default = "default_train")]
    pub train: PathBuf,
    #[serde(default = "default_valid")]
    pub valid: PathBuf,
    #[serde(default = "default_test")]
    pub test: PathBuf,
    #[serde(default = "default_out")]
    pub out: PathBuf,
    /// Relations to learn; empty means every relation of the test split.
    #[serde(default)]
    pub targets: Vec<String>,
    /// 0 is no limit.
    #[serde(default)]
    pub max_targets: usize,
}

fn default_home() -> PathBuf {
    PathBuf::from(".")
}
fn default_train() -> PathBuf {
    PathBuf::from("train.txt")
}
fn default_valid() -> PathBuf {
    PathBuf::from("valid.txt")
}
fn default_test() -> PathBuf {
    PathBuf::from("test.txt")
}
fn default_out() -> PathBuf {
    PathBuf::from("out")
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            train: default_train(),
            valid: default_valid(),
            test: default_test(),
            out: default_out(),
            targets: Vec::new(),
            max_targets: 0,
        }
    }
}

impl DataConfig {
    pub fn train_path(&self) -> PathBuf {
        self.home.join(&self.train)
    }

    pub fn valid_path(&self) -> PathBuf {
        self.home.join(&self.valid)
    }

    pub fn test_path(&self) -> PathBuf {
        self.home.join(&self.test)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.home.join(&self.out)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.out_dir().join("index")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.out_dir().join("rules")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.out_dir().join("predictions.txt")
    }

    pub fn verifications_path(&self) -> PathBuf {
        self.out_dir().join("verifications.txt")
    }

    pub fn scores_path(&self) -> PathBuf {
        self.out_dir().join("scores.json")
    }
}

// ---------------------------------------------------------------------------
// [learn]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnConfig {
    /// Maximum closed template length.
    #[serde(default = "default_depth")]
    pub car_depth: usize,
    /// Maximum open template length.
    #[serde(default = "default_depth")]
    pub ins_depth: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_saturation")]
    pub saturation: f64,
    #[serde(default = "default_random_walkers")]
    pub random_walkers: usize,
    #[serde(default)]
    pub gen_time_secs: Option<u64>,
    #[serde(default)]
    pub spec_time_secs: Option<u64>,
    #[serde(default = "default_support")]
    pub support: u64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub head_coverage: f64,
    #[serde(default = "default_confidence_offset")]
    pub confidence_offset: f64,
    /// Groundings per template during scoring; 0 is unbounded.
    #[serde(default = "default_learn_groundings")]
    pub learn_groundings: usize,
    #[serde(default = "default_rule_cap")]
    pub ins_rule_cap: usize,
    #[serde(default)]
    pub overfitting_factor: f64,
    #[serde(default)]
    pub use_sigmoid: bool,
    #[serde(default)]
    pub allow_ins_reverse: bool,
    #[serde(default)]
    pub quality_measure: QualityMeasure,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub sequential: bool,
}

fn default_depth() -> usize {
    3
}
fn default_batch_size() -> usize {
    20_000
}
fn default_saturation() -> f64 {
    0.99
}
fn default_random_walkers() -> usize {
    10
}
fn default_support() -> u64 {
    2
}
fn default_confidence() -> f64 {
    0.0001
}
fn default_confidence_offset() -> f64 {
    5.0
}
fn default_learn_groundings() -> usize {
    100_000
}
fn default_rule_cap() -> usize {
    15_000_000
}
fn default_threads() -> usize {
    4
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            car_depth: default_depth(),
            ins_depth: default_depth(),
            batch_size: default_batch_size(),
            saturation: default_saturation(),
            random_walkers: default_random_walkers(),
            gen_time_secs: None,
            spec_time_secs: None,
            support: default_support(),
            confidence: default_confidence(),
            head_coverage: 0.0,
            confidence_offset: default_confidence_offset(),
            learn_groundings: default_learn_groundings(),
            ins_rule_cap: default_rule_cap(),
            overfitting_factor: 0.0,
            use_sigmoid: false,
            allow_ins_reverse: false,
            quality_measure: QualityMeasure::default(),
            threads: default_threads(),
            seed: None,
            sequential: false,
        }
    }
}

// ---------------------------------------------------------------------------
// [apply]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Groundings per rule during application; 0 is unbounded.
    #[serde(default)]
    pub apply_groundings: usize,
    #[serde(default = "default_rule_cap")]
    pub suggestion_cap: usize,
    #[serde(default = "default_prediction_rule_cap")]
    pub prediction_rule_cap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    #[serde(default = "default_prior_filtering")]
    pub prior_filtering: bool,
    #[serde(default = "default_verify_rule_size")]
    pub verify_rule_size: usize,
    #[serde(default = "default_verify_prediction_size")]
    pub verify_prediction_size: usize,
    #[serde(default = "default_cover_repeats")]
    pub cover_repeats: usize,
    #[serde(default = "default_top_rules")]
    pub top_rules: usize,
    #[serde(default)]
    pub mode: ApplyMode,
}

fn default_prediction_rule_cap() -> usize {
    20
}
fn default_top_k() -> usize {
    10
}
fn default_max_recursion_depth() -> usize {
    1000
}
fn default_prior_filtering() -> bool {
    true
}
fn default_verify_rule_size() -> usize {
    5
}
fn default_verify_prediction_size() -> usize {
    3
}
fn default_cover_repeats() -> usize {
    3000
}
fn default_top_rules() -> usize {
    1_000_000
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            apply_groundings: 0,
            suggestion_cap: default_rule_cap(),
            prediction_rule_cap: default_prediction_rule_cap(),
            top_k: default_top_k(),
            max_recursion_depth: default_max_recursion_depth(),
            prior_filtering: default_prior_filtering(),
            verify_rule_size: default_verify_rule_size(),
            verify_prediction_size: default_verify_prediction_size(),
            cover_repeats: default_cover_repeats(),
            top_rules: default_top_rules(),
            mode: ApplyMode::default(),
        }
    }
}

fn unbounded_if_zero(value: usize) -> Option<usize> {
    (value > 0).then_some(value)
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Reject settings no phase can run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let learn = &self.learn;
        let apply = &self.apply;
        if learn.car_depth < 1 {
            return Err(invalid("learn.car_depth", "must be at least 1"));
        }
        if learn.ins_depth < 1 {
            return Err(invalid("learn.ins_depth", "must be at least 1"));
        }
        if learn.batch_size < 1 {
            return Err(invalid("learn.batch_size", "must be at least 1"));
        }
        if !(learn.saturation > 0.0 && learn.saturation <= 1.0) {
            return Err(invalid("learn.saturation", "must lie in (0, 1]"));
        }
        if learn.threads < 1 {
            return Err(invalid("learn.threads", "must be at least 1"));
        }
        if learn.random_walkers < 1 {
            return Err(invalid("learn.random_walkers", "must be at least 1"));
        }
        for (field, value) in [
            ("learn.confidence", learn.confidence),
            ("learn.head_coverage", learn.head_coverage),
            ("learn.confidence_offset", learn.confidence_offset),
            ("learn.overfitting_factor", learn.overfitting_factor),
        ] {
            if !(value >= 0.0) {
                return Err(invalid(field, "must be a non-negative number"));
            }
        }
        if apply.top_k < 1 {
            return Err(invalid("apply.top_k", "must be at least 1"));
        }
        if apply.prediction_rule_cap < 1 {
            return Err(invalid("apply.prediction_rule_cap", "must be at least 1"));
        }
        if apply.max_recursion_depth < 1 {
            return Err(invalid("apply.max_recursion_depth", "must be at least 1"));
        }
        Ok(())
    }

    pub fn measure(&self) -> QualityMeasure {
        self.learn.quality_measure
    }

    pub fn generalization(&self) -> GeneralizationConfig {
        GeneralizationConfig {
            car_depth: self.learn.car_depth,
            ins_depth: self.learn.ins_depth,
            batch_size: self.learn.batch_size,
            saturation: self.learn.saturation,
            random_walkers: self.learn.random_walkers,
            threads: self.learn.threads,
            time_budget: self.learn.gen_time_secs.map(Duration::from_secs),
            seed: self.learn.seed,
            sequential: self.learn.sequential,
        }
    }

    pub fn overfitting(&self) -> OverfittingCheck {
        OverfittingCheck {
            factor: self.learn.overfitting_factor,
            use_sigmoid: self.learn.use_sigmoid,
            measure: self.measure(),
        }
    }

    /// Specialization settings for a target; `functional` selects apcaConf.
    pub fn specialization(&self, functional: bool) -> SpecializationConfig {
        SpecializationConfig {
            gate: QualityGate {
                min_support: self.learn.support,
                min_confidence: self.learn.confidence,
                min_head_coverage: self.learn.head_coverage,
                measure: self.measure(),
            },
            params: StatsParams {
                confidence_offset: self.learn.confidence_offset,
                functional,
            },
            overfitting: self.overfitting(),
            learn_groundings: unbounded_if_zero(self.learn.learn_groundings),
            ins_rule_cap: self.learn.ins_rule_cap,
            threads: self.learn.threads,
            time_budget: self.learn.spec_time_secs.map(Duration::from_secs),
            allow_ins_reverse: self.learn.allow_ins_reverse,
        }
    }

    pub fn application(&self) -> ApplicationConfig {
        ApplicationConfig {
            apply_groundings: unbounded_if_zero(self.apply.apply_groundings),
            suggestion_cap: self.apply.suggestion_cap,
            measure: self.measure(),
            threads: self.learn.threads,
        }
    }

    pub fn convergence(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            top_k: self.apply.top_k,
            cover_repeats: self.apply.cover_repeats,
            top_rules: self.apply.top_rules,
            apply_groundings: unbounded_if_zero(self.apply.apply_groundings),
            prediction_rule_cap: self.apply.prediction_rule_cap,
            measure: self.measure(),
            threads: self.learn.threads,
        }
    }

    pub fn evaluation(&self) -> EvaluationConfig {
        EvaluationConfig {
            top_k: self.apply.top_k,
            max_recursion_depth: self.apply.max_recursion_depth,
            prior_filtering: self.apply.prior_filtering,
            verify_rule_size: self.apply.verify_rule_size,
            verify_prediction_size: self.apply.verify_prediction_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.learn.batch_size, 20_000);
        assert_eq!(config.apply.mode, ApplyMode::Ranked);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [data]
            home = "/data/fb15k"
            targets = ["born_in"]

            [learn]
            quality_measure = "pcaConf"
            learn_groundings = 0

            [apply]
            mode = "converge"
            "#,
        )
        .unwrap();
        assert_eq!(config.data.train_path(), PathBuf::from("/data/fb15k/train.txt"));
        assert_eq!(config.data.targets, vec!["born_in".to_string()]);
        assert_eq!(config.measure(), QualityMeasure::PcaConf);
        assert_eq!(config.specialization(false).learn_groundings, None);
        assert_eq!(config.learn.ins_depth, 3);
        assert_eq!(config.apply.mode, ApplyMode::Converge);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gpfl.toml");
        let mut config = Config::default();
        config.learn.seed = Some(7);
        config.apply.top_k = 50;
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn validation_names_the_field() {
        let mut config = Config::default();
        config.learn.saturation = 1.5;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "learn.saturation"));

        let mut config = Config::default();
        config.apply.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.learn.confidence = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpfl.toml");
        std::fs::write(&path, "[learn]\nthreads = \"many\"\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
