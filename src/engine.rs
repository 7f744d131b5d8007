//! Miner facade: top-level API for a learning and evaluation run.
//!
//! The [`Miner`] owns the loaded dataset and the run configuration. For each
//! target relation it hides the target's validation and test facts, learns
//! templates and rules, reads the persisted rules back, applies them in the
//! configured mode and writes ranked answers for every test query.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::info;

use crate::application::apply_rules;
use crate::config::{ApplyMode, Config};
use crate::context::Context;
use crate::dispatch::converge::apply_until_converged;
use crate::error::{ConfigError, GpflResult, GraphError};
use crate::evaluation::{
    DirectionScores, PredictionWriter, RankedQuery, ScoreReport, quick_scores, rank_queries,
    score_predictions, unresolved,
};
use crate::generalization::generalize;
use crate::graph::load::{Dataset, TargetExamples, load_dataset};
use crate::graph::{EdgeHoldout, ReadScope};
use crate::persist::predictions::read_prediction_file;
use crate::persist::rule_index::read_rules;
use crate::persist::{target_file_name, write_json};
use crate::specialization::{RuleOutputs, specialize};
use crate::symbol::{RelationId, SymbolTable};

/// Which phases a run executes per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    pub learn: bool,
    pub apply: bool,
}

impl Phases {
    pub const LEARN: Phases = Phases {
        learn: true,
        apply: false,
    };
    pub const APPLY: Phases = Phases {
        learn: false,
        apply: true,
    };
    pub const ALL: Phases = Phases {
        learn: true,
        apply: true,
    };
}

/// Per-target outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct TargetSummary {
    pub relation: String,
    pub templates: usize,
    pub instantiated: usize,
    /// Rules read back from the index for application.
    pub rules: usize,
    pub queries: usize,
    /// Queries whose true answer is tied with other candidates.
    pub unresolved: usize,
    /// In-memory scores of the ranked queries; ties count as misses.
    pub scores: DirectionScores,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub targets: Vec<TargetSummary>,
    /// Filtered scores of the written prediction file, when applied.
    pub scores: Option<ScoreReport>,
    pub elapsed: Duration,
}

/// The rule miner.
pub struct Miner<'c> {
    config: &'c Config,
    dataset: Dataset,
}

impl<'c> Miner<'c> {
    /// Validate the config and load the three splits.
    pub fn load(config: &'c Config) -> GpflResult<Self> {
        config.validate()?;
        let data = &config.data;
        let dataset = load_dataset(&data.train_path(), &data.valid_path(), &data.test_path())?;
        Ok(Self { config, dataset })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.dataset.symbols
    }

    /// Target relations in name order.
    ///
    /// Configured targets must be relations of the test split; without any,
    /// every relation of the test split is a target.
    pub fn targets(&self) -> GpflResult<Vec<RelationId>> {
        let symbols = self.symbols();
        let in_test = self.dataset.splits.test_relations();

        let mut targets = if self.config.data.targets.is_empty() {
            in_test
        } else {
            let mut chosen = Vec::with_capacity(self.config.data.targets.len());
            for name in &self.config.data.targets {
                let relation = symbols
                    .relation(name)
                    .ok_or_else(|| GraphError::RelationNotFound { name: name.clone() })?;
                if !in_test.contains(&relation) {
                    return Err(ConfigError::UnknownTarget {
                        target: name.clone(),
                    }
                    .into());
                }
                if !chosen.contains(&relation) {
                    chosen.push(relation);
                }
            }
            chosen
        };

        targets.sort_by(|a, b| symbols.relation_label(*a).cmp(&symbols.relation_label(*b)));
        if self.config.data.max_targets > 0 {
            targets.truncate(self.config.data.max_targets);
        }
        Ok(targets)
    }

    fn outputs(&self, target: RelationId) -> RuleOutputs {
        let file = target_file_name(&self.symbols().relation_label(target));
        RuleOutputs {
            index: self.config.data.index_dir().join(&file),
            flat: self.config.data.rules_dir().join(&file),
        }
    }

    /// Index file the rules of `target` are read back from.
    pub fn index_path(&self, target: RelationId) -> PathBuf {
        self.outputs(target).index
    }

    fn learn_target(
        &self,
        view: &ReadScope<'_>,
        examples: &TargetExamples,
        summary: &mut TargetSummary,
    ) -> GpflResult<()> {
        let target = examples.target;
        let ctx = Context::new(target, self.config.apply.prediction_rule_cap);

        let generalized = generalize(
            view,
            &examples.train,
            target,
            &ctx,
            &self.config.generalization(),
        )?;
        let specialized = specialize(
            view,
            examples,
            self.symbols(),
            &ctx,
            &self.config.specialization(examples.is_functional()),
            &self.outputs(target),
        )?;

        summary.templates = generalized.templates;
        summary.instantiated = specialized.instantiated;
        Ok(())
    }

    fn apply_target(
        &self,
        view: &ReadScope<'_>,
        examples: &TargetExamples,
        summary: &mut TargetSummary,
    ) -> GpflResult<Vec<RankedQuery>> {
        let target = examples.target;
        let loaded = read_rules(
            &self.index_path(target),
            self.symbols(),
            target,
            &self.config.overfitting(),
        )?;
        info!(
            relation = %self.symbols().relation_label(target),
            rules = loaded.rules.len(),
            overfitting = loaded.overfitting,
            skipped = loaded.skipped,
            "read rules back"
        );
        summary.rules = loaded.rules.len();

        let ranked = match self.config.apply.mode {
            ApplyMode::Ranked => {
                let ctx = Context::new(target, self.config.apply.prediction_rule_cap);
                apply_rules(view, loaded.rules, &ctx, &self.config.application())?;
                rank_queries(&ctx.into_predictions(), examples, &self.config.evaluation())
            }
            ApplyMode::Converge => {
                let (ranked, _) = apply_until_converged(
                    view,
                    loaded.rules,
                    examples,
                    &self.config.convergence(),
                )?;
                ranked
            }
        };
        summary.queries = ranked.len();
        summary.unresolved = unresolved(&ranked);
        summary.scores = quick_scores(&ranked, self.config.apply.top_k);
        Ok(ranked)
    }

    /// Run `phases` for every target.
    ///
    /// Applying writes the prediction and verification files, then scores
    /// the prediction file into `scores.json`.
    pub fn run(&self, phases: Phases) -> GpflResult<RunSummary> {
        let start = Instant::now();
        let targets = self.targets()?;
        info!(targets = targets.len(), ?phases, "starting run");

        let data = &self.config.data;
        let mut writer = if phases.apply {
            Some(PredictionWriter::create(
                &data.predictions_path(),
                &data.verifications_path(),
            )?)
        } else {
            None
        };

        let mut summaries = Vec::with_capacity(targets.len());
        for target in targets {
            let target_start = Instant::now();
            let examples = self.dataset.splits.examples(target);
            let mut summary = TargetSummary {
                relation: self.symbols().relation_label(target).into_owned(),
                ..Default::default()
            };

            let held_out = examples.held_out_facts();
            let holdout = EdgeHoldout::new(&self.dataset.graph, &held_out);
            {
                let view = self.dataset.graph.read();
                if phases.learn {
                    self.learn_target(&view, &examples, &mut summary)?;
                }
                if let Some(writer) = writer.as_mut() {
                    let ranked = self.apply_target(&view, &examples, &mut summary)?;
                    writer.write_target(self.symbols(), target, &ranked, &self.config.evaluation())?;
                }
            }
            drop(holdout);

            info!(
                relation = %summary.relation,
                held_out = held_out.len(),
                templates = summary.templates,
                instantiated = summary.instantiated,
                rules = summary.rules,
                queries = summary.queries,
                unresolved = summary.unresolved,
                hits_at_1 = summary.scores.both.hits_at_1,
                mrr = summary.scores.both.mrr,
                elapsed_ms = target_start.elapsed().as_millis() as u64,
                "target finished"
            );
            summaries.push(summary);
        }

        let scores = match writer {
            Some(writer) => {
                let queries = writer.finish()?;
                info!(queries, path = %data.predictions_path().display(), "wrote predictions");
                Some(self.score()?)
            }
            None => None,
        };

        let summary = RunSummary {
            targets: summaries,
            scores,
            elapsed: start.elapsed(),
        };
        info!(
            targets = summary.targets.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    /// Score the prediction file of the output directory and write
    /// `scores.json` next to it.
    pub fn score(&self) -> GpflResult<ScoreReport> {
        let data = &self.config.data;
        let file = read_prediction_file(&data.predictions_path())?;
        let report = score_predictions(&file, self.symbols(), &self.dataset.splits);
        write_json(&data.scores_path(), &report)?;
        Ok(report)
    }
}
