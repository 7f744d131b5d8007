//! Convergence-mode application.
//!
//! Rules are applied in descending quality and every test query keeps an
//! incremental [`ScoreList`]. A query is covered once its answer is ranked
//! alone or has fallen beyond the top-k. Application stops when nearly all
//! queries are covered, or when coverage stops growing for a number of
//! consecutive rules.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::run_ordered;
use crate::application::{rule_predictions, sort_by_quality};
use crate::cancel::{CancelToken, StopReason};
use crate::context::ScoredRule;
use crate::error::GpflResult;
use crate::evaluation::{RankedAnswer, RankedQuery, TestQuery, test_queries};
use crate::graph::load::TargetExamples;
use crate::graph::{GraphView, Pair};
use crate::persist::predictions::QueryDirection;
use crate::ranking::{CoveragePolicy, ScoreList};
use crate::rule::{QualityMeasure, Rule};
use crate::symbol::EntityId;

/// Coverage above which the run counts as converged outright.
const FULL_COVERAGE: f64 = 0.999;
/// Coverage gain below which a rule counts as making no progress.
const MIN_GAIN: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct ConvergenceConfig {
    pub top_k: usize,
    /// Consecutive rules without coverage gain tolerated before stopping.
    pub cover_repeats: usize,
    /// Rules considered, best first.
    pub top_rules: usize,
    pub apply_groundings: Option<usize>,
    /// Supporting rules kept per answer.
    pub prediction_rule_cap: usize,
    pub measure: QualityMeasure,
    pub threads: usize,
}

#[derive(Debug, Clone)]
pub struct ConvergenceReport {
    pub rules: usize,
    pub applied: u64,
    pub queries: usize,
    pub covered: usize,
    pub stop: StopReason,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Coverage tracking
// ---------------------------------------------------------------------------

/// Decides convergence from the coverage observed after each rule.
#[derive(Debug, Clone)]
pub struct CoverageTracker {
    coverage: f64,
    repeats: usize,
    cover_repeats: usize,
}

impl CoverageTracker {
    pub fn new(cover_repeats: usize) -> Self {
        Self {
            coverage: 0.0,
            repeats: 0,
            cover_repeats,
        }
    }

    /// Last coverage that counted as progress.
    pub fn coverage(&self) -> f64 {
        self.coverage
    }

    /// Record the current coverage; returns whether the run has converged.
    pub fn observe(&mut self, current: f64) -> bool {
        if current > FULL_COVERAGE {
            return true;
        }
        if current - self.coverage < MIN_GAIN && self.coverage != 0.0 {
            self.repeats += 1;
            return self.repeats > self.cover_repeats;
        }
        self.repeats = 0;
        self.coverage = current;
        false
    }
}

// ---------------------------------------------------------------------------
// Query state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueryState {
    query: TestQuery,
    list: ScoreList<EntityId>,
    rules: HashMap<EntityId, Vec<ScoredRule>>,
    covered: bool,
}

/// Score lists of every test query of one target.
#[derive(Debug)]
pub struct ConvergenceState {
    queries: Vec<QueryState>,
    /// Subject to the tail queries still open for it.
    tail_index: HashMap<EntityId, Vec<usize>>,
    /// Object to the head queries still open for it.
    head_index: HashMap<EntityId, Vec<usize>>,
    test: HashSet<Pair>,
    covered: usize,
    tracker: CoverageTracker,
    policy: CoveragePolicy,
    rule_cap: usize,
}

impl ConvergenceState {
    pub fn new(test: &HashSet<Pair>, config: &ConvergenceConfig) -> Self {
        let queries: Vec<QueryState> = test_queries(test)
            .into_iter()
            .map(|query| QueryState {
                query,
                list: ScoreList::new(query.answer()),
                rules: HashMap::new(),
                covered: false,
            })
            .collect();

        let mut tail_index: HashMap<EntityId, Vec<usize>> = HashMap::new();
        let mut head_index: HashMap<EntityId, Vec<usize>> = HashMap::new();
        for (idx, state) in queries.iter().enumerate() {
            let index = match state.query.direction {
                QueryDirection::Tail => &mut tail_index,
                QueryDirection::Head => &mut head_index,
            };
            index.entry(state.query.fixed()).or_default().push(idx);
        }

        Self {
            queries,
            tail_index,
            head_index,
            test: test.clone(),
            covered: 0,
            tracker: CoverageTracker::new(config.cover_repeats),
            policy: CoveragePolicy::BeyondTopK {
                top_k: config.top_k,
            },
            rule_cap: config.prediction_rule_cap,
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.len()
    }

    pub fn covered(&self) -> usize {
        self.covered
    }

    /// Share of covered queries; an empty query set is fully covered.
    pub fn coverage(&self) -> f64 {
        if self.queries.is_empty() {
            1.0
        } else {
            self.covered as f64 / self.queries.len() as f64
        }
    }

    /// Feed the coverage after a rule to the tracker.
    pub fn converged(&mut self) -> bool {
        if self.queries.is_empty() {
            return true;
        }
        let current = self.coverage();
        self.tracker.observe(current)
    }

    fn touch(
        &self,
        index: &HashMap<EntityId, Vec<usize>>,
        key: EntityId,
        candidate: &Pair,
        answer: EntityId,
        touched: &mut HashMap<usize, Vec<EntityId>>,
    ) {
        for &idx in index.get(&key).into_iter().flatten() {
            // Other test facts stay hidden from a query.
            if self.test.contains(candidate) && *candidate != self.queries[idx].query.pair {
                continue;
            }
            touched.entry(idx).or_default().push(answer);
        }
    }

    /// Refine every query the candidates of `rule` touch.
    pub fn update(&mut self, rule: &Arc<Rule>, quality: f64, candidates: &[Pair]) {
        let mut touched: HashMap<usize, Vec<EntityId>> = HashMap::new();
        for candidate in candidates {
            self.touch(&self.tail_index, candidate.sub, candidate, candidate.obj, &mut touched);
            self.touch(&self.head_index, candidate.obj, candidate, candidate.sub, &mut touched);
        }

        let mut touched: Vec<(usize, Vec<EntityId>)> = touched.into_iter().collect();
        touched.sort_by_key(|(idx, _)| *idx);

        for (idx, answers) in touched {
            let state = &mut self.queries[idx];
            let relevant = state.list.relevant(&answers);
            if relevant.is_empty() {
                continue;
            }
            for answer in &relevant {
                let rules = state.rules.entry(*answer).or_default();
                if rules.len() < self.rule_cap {
                    rules.push(ScoredRule {
                        quality,
                        rule: Arc::clone(rule),
                    });
                }
            }
            state.list.refine(&relevant);

            if !state.covered && state.list.covered(self.policy) {
                state.covered = true;
                self.covered += 1;
                let fixed = state.query.fixed();
                let index = match state.query.direction {
                    QueryDirection::Tail => &mut self.tail_index,
                    QueryDirection::Head => &mut self.head_index,
                };
                if let Some(ids) = index.get_mut(&fixed) {
                    ids.retain(|&i| i != idx);
                    if ids.is_empty() {
                        index.remove(&fixed);
                    }
                }
            }
        }
    }

    /// Answers of every query in rank order.
    pub fn into_ranked(self) -> Vec<RankedQuery> {
        self.queries
            .into_iter()
            .map(|mut state| {
                let answers = state
                    .list
                    .groups()
                    .iter()
                    .flatten()
                    .map(|&entity| RankedAnswer {
                        entity,
                        rules: state.rules.remove(&entity).unwrap_or_default(),
                    })
                    .collect();
                RankedQuery {
                    query: state.query,
                    answers,
                    outcome: state.list.rank(),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Apply `rules` in quality order until test-query coverage converges.
pub fn apply_until_converged<G>(
    graph: &G,
    mut rules: Vec<Rule>,
    examples: &TargetExamples,
    config: &ConvergenceConfig,
) -> GpflResult<(Vec<RankedQuery>, ConvergenceReport)>
where
    G: GraphView + Sync + ?Sized,
{
    let start = Instant::now();
    sort_by_quality(&mut rules, config.measure);
    let truncated = rules.len() > config.top_rules;
    rules.truncate(config.top_rules);
    let rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();

    let subjects: HashSet<EntityId> = examples.test.iter().map(|p| p.sub).collect();
    let objects: HashSet<EntityId> = examples.test.iter().map(|p| p.obj).collect();
    let keep = |p: &Pair| {
        !examples.train.contains(p)
            && !examples.valid.contains(p)
            && (subjects.contains(&p.sub) || objects.contains(&p.obj))
    };

    let mut state = ConvergenceState::new(&examples.test, config);
    let token = CancelToken::new();
    let measure = config.measure;

    let run = run_ordered(
        (0..rules.len()).collect(),
        config.threads,
        &token,
        |&idx: &usize| {
            let mut candidates =
                rule_predictions(graph, &rules[idx], config.apply_groundings, &token);
            candidates.retain(|p| keep(p));
            candidates
        },
        |seq, candidates| {
            let rule = &rules[seq as usize];
            state.update(rule, rule.quality(measure), &candidates);
            debug!(
                candidates = candidates.len(),
                covered = state.covered(),
                "applied rule"
            );
            if state.converged() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        },
    )?;

    let report = ConvergenceReport {
        rules: rules.len(),
        applied: run.applied,
        queries: state.queries(),
        covered: state.covered(),
        stop: if run.stopped_early {
            StopReason::Converged
        } else if truncated {
            StopReason::CountCap
        } else {
            StopReason::Exhausted
        },
        elapsed: start.elapsed(),
    };
    info!(
        relation = %examples.target,
        rules = report.rules,
        applied = report.applied,
        queries = report.queries,
        covered = report.covered,
        stop = %report.stop,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "convergence application finished"
    );
    Ok((state.into_ranked(), report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Direction, KnowledgeGraph, Triple};
    use crate::rule::{BodyAtom, Metrics, RuleStats, Template};
    use crate::symbol::RelationId;

    fn e(id: u32) -> EntityId {
        EntityId::new(id)
    }

    const TARGET: u32 = 0;
    const LIVES_IN: u32 = 1;

    fn config() -> ConvergenceConfig {
        ConvergenceConfig {
            top_k: 10,
            cover_repeats: 2,
            top_rules: 100,
            apply_groundings: None,
            prediction_rule_cap: 5,
            measure: QualityMeasure::SmoothedConf,
            threads: 2,
        }
    }

    fn rule(relation: u32, direction: Direction, quality: f64) -> Rule {
        let template = Arc::new(Template {
            head: RelationId::new(TARGET),
            body: vec![BodyAtom {
                relation: RelationId::new(relation),
                direction,
            }],
            closed: true,
            from_subject: true,
        });
        let mut rule = Rule::from_template(template);
        rule.stats = RuleStats::from_metrics(Metrics {
            smoothed_conf: quality,
            ..Default::default()
        });
        rule
    }

    #[test]
    fn tracker_converges_on_full_coverage_or_stalls() {
        let mut tracker = CoverageTracker::new(2);
        assert!(!tracker.observe(0.0));
        assert!(!tracker.observe(0.0));
        assert!(!tracker.observe(0.5));
        assert!(!tracker.observe(0.505));
        assert!(!tracker.observe(0.505));
        assert!(tracker.observe(0.505));
        assert_eq!(tracker.coverage(), 0.5);

        let mut tracker = CoverageTracker::new(100);
        assert!(tracker.observe(1.0));
    }

    #[test]
    fn empty_query_set_is_converged() {
        let mut state = ConvergenceState::new(&HashSet::new(), &config());
        assert_eq!(state.coverage(), 1.0);
        assert!(state.converged());
    }

    #[test]
    fn update_hides_other_test_facts_and_covers_ranked_answers() {
        let test: HashSet<Pair> = [Pair::new(e(1), e(2)), Pair::new(e(1), e(3))]
            .into_iter()
            .collect();
        let mut state = ConvergenceState::new(&test, &config());
        assert_eq!(state.queries(), 4);

        let r = Arc::new(rule(LIVES_IN, Direction::Outgoing, 0.8));
        state.update(&r, 0.8, &[Pair::new(e(1), e(2)), Pair::new(e(1), e(3))]);
        assert_eq!(state.covered(), 4);

        let ranked = state.into_ranked();
        // Tail query (1, ?) for answer 2 does not see the other test fact (1, 3).
        let tail = ranked
            .iter()
            .find(|q| q.query.direction == QueryDirection::Tail && q.query.pair.obj == e(2))
            .unwrap();
        assert_eq!(tail.answers.len(), 1);
        assert_eq!(tail.position(), Some(1));
        assert_eq!(tail.answers[0].rules.len(), 1);
    }

    #[test]
    fn convergence_ranks_held_out_spouse() {
        let kg = KnowledgeGraph::new();
        // spouse(1, 2) is held out; the reverse edge is known.
        kg.insert(&Triple::new(e(2), RelationId::new(TARGET), e(1)));
        kg.insert(&Triple::new(e(3), RelationId::new(TARGET), e(4)));
        kg.insert(&Triple::new(e(4), RelationId::new(TARGET), e(3)));
        kg.insert(&Triple::new(e(1), RelationId::new(LIVES_IN), e(10)));
        let examples = TargetExamples {
            target: RelationId::new(TARGET),
            train: [
                Pair::new(e(2), e(1)),
                Pair::new(e(3), e(4)),
                Pair::new(e(4), e(3)),
            ]
            .into_iter()
            .collect(),
            valid: HashSet::new(),
            test: [Pair::new(e(1), e(2))].into_iter().collect(),
        };
        let rules = vec![
            rule(LIVES_IN, Direction::Outgoing, 0.1),
            rule(TARGET, Direction::Incoming, 0.9),
        ];

        let view = kg.read();
        let (ranked, report) =
            apply_until_converged(&view, rules, &examples, &config()).unwrap();
        assert_eq!(report.queries, 2);
        assert_eq!(report.covered, 2);
        assert_eq!(report.stop, StopReason::Converged);
        assert!(ranked.iter().all(|q| q.position() == Some(1)));
    }
}
