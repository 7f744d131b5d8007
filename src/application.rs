//! Rule application: grounding rules into candidate predictions.
//!
//! Rules are applied in parallel on a dedicated rayon pool, one template
//! body grounding per group of rules sharing that template. Each grounding
//! becomes a candidate pair oriented by the rule's head, and the capped
//! [`PredictionMap`](crate::context::PredictionMap) keeps the best rules per
//! pair. Application stops taking new rules once the map holds more than
//! `suggestion_cap` pairs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::cancel::{CancelToken, StopReason};
use crate::context::Context;
use crate::error::{GpflResult, PipelineError};
use crate::graph::{GraphView, Pair};
use crate::grounding::{GroundingRequest, Groundings, ground};
use crate::rule::{QualityMeasure, Rule, Template};

/// Application settings for one target.
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    /// Groundings per rule; `None` is unbounded.
    pub apply_groundings: Option<usize>,
    /// Distinct candidate pairs after which no further rule is applied.
    pub suggestion_cap: usize,
    pub measure: QualityMeasure,
    pub threads: usize,
}

/// What an application run did.
#[derive(Debug, Clone)]
pub struct ApplicationReport {
    pub rules: usize,
    pub applied: usize,
    pub predictions: usize,
    pub stop: StopReason,
    pub elapsed: Duration,
}

/// Candidate pairs `rule` predicts from body `groundings`, without self-loops.
///
/// A closed rule predicts each grounding, oriented from subject to object. An
/// anchored rule pairs every grounding origin with its anchor, restricted to
/// its tail when it has one. Unanchored open templates predict nothing.
fn predictions_from(groundings: &Groundings, rule: &Rule) -> Vec<Pair> {
    let anchor = rule.anchor();
    if !rule.closed() && anchor.is_none() {
        return Vec::new();
    }
    let tail = rule.tail();
    let from_subject = rule.from_subject();

    let mut predictions: Vec<Pair> = groundings
        .iter()
        .filter(|g| tail.is_none_or(|t| g.obj == t))
        .map(|&g| match (anchor, from_subject) {
            (None, true) => g,
            (None, false) => g.reversed(),
            (Some(anchor), true) => Pair::new(g.sub, anchor),
            (Some(anchor), false) => Pair::new(anchor, g.sub),
        })
        .filter(|p| !p.is_self_loop())
        .collect();
    predictions.sort_by_key(|p| (p.sub, p.obj));
    predictions.dedup();
    predictions
}

/// Candidate pairs predicted by `rule` alone.
pub fn rule_predictions<G>(
    graph: &G,
    rule: &Rule,
    cap: Option<usize>,
    token: &CancelToken,
) -> Vec<Pair>
where
    G: GraphView + ?Sized,
{
    if !rule.closed() && rule.anchor().is_none() {
        return Vec::new();
    }
    let groundings = ground(graph, &GroundingRequest::for_rule(rule, cap), token);
    predictions_from(&groundings, rule)
}

/// Rules sharing one template body, in the order they were first seen.
#[derive(Debug)]
struct TemplateGroup {
    template: Arc<Template>,
    rules: Vec<Arc<Rule>>,
}

fn group_by_template(rules: &[Arc<Rule>]) -> Vec<TemplateGroup> {
    let mut slots: HashMap<Arc<Template>, usize> = HashMap::new();
    let mut groups: Vec<TemplateGroup> = Vec::new();
    for rule in rules {
        let slot = *slots.entry(Arc::clone(&rule.template)).or_insert_with(|| {
            groups.push(TemplateGroup {
                template: Arc::clone(&rule.template),
                rules: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].rules.push(Arc::clone(rule));
    }
    groups
}

/// Predictions of every rule of `group`, grounding the shared body once.
fn group_predictions<G>(
    graph: &G,
    group: &TemplateGroup,
    cap: Option<usize>,
    token: &CancelToken,
) -> Vec<Vec<Pair>>
where
    G: GraphView + ?Sized,
{
    if let [rule] = group.rules.as_slice() {
        return vec![rule_predictions(graph, rule, cap, token)];
    }
    let request = GroundingRequest {
        template: &group.template,
        tail: None,
        cap,
    };
    let groundings = ground(graph, &request, token);
    group
        .rules
        .iter()
        .map(|rule| predictions_from(&groundings, rule))
        .collect()
}

/// Sort rules by descending quality; equal qualities keep their order.
pub fn sort_by_quality(rules: &mut [Rule], measure: QualityMeasure) {
    rules.sort_by(|a, b| b.quality(measure).total_cmp(&a.quality(measure)));
}

/// Apply `rules` into the prediction map of `ctx`.
///
/// Rules are grouped by template so that instances of one template share a
/// single grounding of its body. Groups are ordered by their best rule.
pub fn apply_rules<G>(
    graph: &G,
    mut rules: Vec<Rule>,
    ctx: &Context,
    config: &ApplicationConfig,
) -> GpflResult<ApplicationReport>
where
    G: GraphView + ?Sized,
{
    let start = Instant::now();
    sort_by_quality(&mut rules, config.measure);
    let rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();
    let groups = group_by_template(&rules);
    let token = CancelToken::new();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()
        .map_err(|e| PipelineError::ThreadPool {
            stage: "application",
            message: e.to_string(),
        })?;

    pool.install(|| {
        groups.par_iter().for_each(|group| {
            if token.is_cancelled() {
                return;
            }
            let predictions = group_predictions(graph, group, config.apply_groundings, &token);
            for (rule, pairs) in group.rules.iter().zip(&predictions) {
                let quality = rule.quality(config.measure);
                for pair in pairs {
                    ctx.predictions().insert(*pair, rule, quality);
                }
                ctx.record_applied();
                debug!(predictions = pairs.len(), quality, "applied rule");
                if ctx.predictions().len() > config.suggestion_cap {
                    token.cancel_with(StopReason::CountCap);
                    break;
                }
            }
        });
    });

    let report = ApplicationReport {
        rules: rules.len(),
        applied: ctx.applied(),
        predictions: ctx.predictions().len(),
        stop: token.reason().unwrap_or(StopReason::Exhausted),
        elapsed: start.elapsed(),
    };
    info!(
        relation = %ctx.target(),
        rules = report.rules,
        templates = groups.len(),
        applied = report.applied,
        predictions = report.predictions,
        stop = %report.stop,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "application finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Direction, KnowledgeGraph, Triple};
    use crate::rule::{BodyAtom, Metrics, RuleStats};
    use crate::symbol::{EntityId, RelationId};

    fn e(id: u32) -> EntityId {
        EntityId::new(id)
    }

    const TARGET: u32 = 0;
    const LIVES_IN: u32 = 1;

    fn graph() -> KnowledgeGraph {
        let kg = KnowledgeGraph::new();
        // 1 and 2 are married; 1, 2 and 3 live in 10.
        kg.insert(&Triple::new(e(1), RelationId::new(TARGET), e(2)));
        kg.insert(&Triple::new(e(2), RelationId::new(TARGET), e(1)));
        for person in [1, 2, 3] {
            kg.insert(&Triple::new(e(person), RelationId::new(LIVES_IN), e(10)));
        }
        kg
    }

    fn scored(mut rule: Rule, quality: f64) -> Rule {
        rule.stats = RuleStats::from_metrics(Metrics {
            smoothed_conf: quality,
            ..Default::default()
        });
        rule
    }

    fn template(relation: u32, direction: Direction, closed: bool, from_subject: bool) -> Arc<Template> {
        Arc::new(Template {
            head: RelationId::new(TARGET),
            body: vec![BodyAtom {
                relation: RelationId::new(relation),
                direction,
            }],
            closed,
            from_subject,
        })
    }

    fn config() -> ApplicationConfig {
        ApplicationConfig {
            apply_groundings: None,
            suggestion_cap: 1000,
            measure: QualityMeasure::SmoothedConf,
            threads: 2,
        }
    }

    #[test]
    fn closed_rule_predicts_oriented_pairs() {
        let kg = graph();
        let view = kg.read();
        let rule = Rule::from_template(template(TARGET, Direction::Incoming, true, true));
        let predictions = rule_predictions(&view, &rule, None, &CancelToken::new());
        assert_eq!(predictions, vec![Pair::new(e(1), e(2)), Pair::new(e(2), e(1))]);
    }

    #[test]
    fn anchored_rule_pairs_origins_with_anchor() {
        let kg = graph();
        let view = kg.read();
        let t = template(LIVES_IN, Direction::Outgoing, false, true);
        // target(X, 2) <- lives_in(X, V1): origin 2 itself is a self-loop.
        let har = Rule::head_anchored(Arc::clone(&t), e(2));
        let predictions = rule_predictions(&view, &har, None, &CancelToken::new());
        assert_eq!(predictions, vec![Pair::new(e(1), e(2)), Pair::new(e(3), e(2))]);

        // Anchored on the subject side the anchor comes first.
        let t = template(LIVES_IN, Direction::Outgoing, false, false);
        let har = Rule::head_anchored(t, e(1));
        let predictions = rule_predictions(&view, &har, None, &CancelToken::new());
        assert_eq!(predictions, vec![Pair::new(e(1), e(2)), Pair::new(e(1), e(3))]);
    }

    #[test]
    fn unanchored_open_template_predicts_nothing() {
        let kg = graph();
        let view = kg.read();
        let rule = Rule::from_template(template(LIVES_IN, Direction::Outgoing, false, true));
        assert!(rule_predictions(&view, &rule, None, &CancelToken::new()).is_empty());
    }

    #[test]
    fn map_keeps_best_rule_first_and_no_self_loops() {
        let kg = graph();
        let view = kg.read();
        let ctx = Context::new(RelationId::new(TARGET), 5);
        let t = template(LIVES_IN, Direction::Outgoing, false, true);
        let weak = scored(Rule::head_anchored(Arc::clone(&t), e(2)), 0.2);
        let strong = scored(
            Rule::from_template(template(TARGET, Direction::Incoming, true, true)),
            0.9,
        );

        let report = apply_rules(&view, vec![weak, strong], &ctx, &config()).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.stop, StopReason::Exhausted);

        let map = ctx.into_predictions();
        assert!(map.keys().all(|p| !p.is_self_loop()));
        let best = &map[&Pair::new(e(1), e(2))];
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].quality, 0.9);
    }

    #[test]
    fn suggestion_cap_stops_application() {
        let kg = graph();
        let view = kg.read();
        let ctx = Context::new(RelationId::new(TARGET), 5);
        let t = template(LIVES_IN, Direction::Outgoing, false, true);
        let rules = (1..=3)
            .map(|anchor| scored(Rule::head_anchored(Arc::clone(&t), e(anchor)), 0.5))
            .collect();
        let cfg = ApplicationConfig {
            suggestion_cap: 0,
            threads: 1,
            ..config()
        };
        let report = apply_rules(&view, rules, &ctx, &cfg).unwrap();
        assert_eq!(report.stop, StopReason::CountCap);
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn instances_of_one_template_share_a_grounding() {
        let kg = graph();
        let view = kg.read();
        let t = template(LIVES_IN, Direction::Outgoing, false, true);
        let rules: Vec<Arc<Rule>> = vec![
            Arc::new(Rule::head_anchored(Arc::clone(&t), e(1))),
            Arc::new(Rule::from_template(template(TARGET, Direction::Incoming, true, true))),
            Arc::new(Rule::both_anchored(Arc::clone(&t), e(2), e(10))),
            Arc::new(Rule::head_anchored(Arc::clone(&t), e(3))),
        ];

        let groups = group_by_template(&rules);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].rules.len(), 3);
        assert_eq!(groups[1].rules.len(), 1);

        // Shared grounding gives each rule what grounding it alone gives.
        let token = CancelToken::new();
        for group in &groups {
            let shared = group_predictions(&view, group, None, &token);
            for (rule, pairs) in group.rules.iter().zip(&shared) {
                assert_eq!(pairs, &rule_predictions(&view, rule, None, &token));
            }
        }
    }
}
