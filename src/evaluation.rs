//! Evaluation: ranking test queries, writing predictions, scoring them.
//!
//! Every test fact `target(s, o)` yields a tail query `(s, ?)` and a head
//! query `(?, o)`. Ranked mode reads candidates for a query from the
//! prediction map, optionally filters known facts, and orders them with
//! [`TieGroups`]. Convergence mode produces the same [`RankedQuery`] values
//! from its incremental score lists. A query counts as answered only when its
//! true answer sits alone in its tie group ([`CoveragePolicy::Strict`]); an
//! answer tied with others is unresolved, whatever its written position.
//!
//! Scoring reads a prediction file back and computes hits@1/3/10 and MRR per
//! relation and overall, for head queries, tail queries and both.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::context::ScoredRule;
use crate::error::PersistResult;
use crate::graph::load::{Splits, TargetExamples};
use crate::graph::{Pair, Triple};
use crate::persist::predictions::{
    ExplainedAnswer, PredictionFile, QueryDirection, format_prediction_block,
    format_verification_block, query_string, verification_string,
};
use crate::persist::{create, flush, write_str};
use crate::ranking::{CoveragePolicy, RankOutcome, TieGroups};
use crate::symbol::{EntityId, RelationId, SymbolTable};

/// Evaluation settings.
#[derive(Debug, Clone)]
pub struct EvaluationConfig {
    /// Answers written per query.
    pub top_k: usize,
    pub max_recursion_depth: usize,
    /// Drop candidates that are known facts other than the query's own.
    pub prior_filtering: bool,
    /// Supporting rules listed per answer in the verification file.
    pub verify_rule_size: usize,
    /// Answers explained per query in the verification file.
    pub verify_prediction_size: usize,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// One direction of one test fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TestQuery {
    pub direction: QueryDirection,
    pub pair: Pair,
}

impl TestQuery {
    /// The endpoint the query keeps.
    pub fn fixed(&self) -> EntityId {
        self.direction.fixed(&self.pair)
    }

    /// The endpoint the query asks for.
    pub fn answer(&self) -> EntityId {
        self.direction.sought(&self.pair)
    }

    /// The full fact a candidate answer stands for.
    pub fn candidate(&self, entity: EntityId) -> Pair {
        match self.direction {
            QueryDirection::Tail => Pair::new(self.pair.sub, entity),
            QueryDirection::Head => Pair::new(entity, self.pair.obj),
        }
    }
}

/// A tail and a head query per test pair, in pair order.
pub fn test_queries(test: &HashSet<Pair>) -> Vec<TestQuery> {
    let mut pairs: Vec<Pair> = test.iter().copied().collect();
    pairs.sort_by_key(|p| (p.sub, p.obj));
    pairs
        .into_iter()
        .flat_map(|pair| {
            [QueryDirection::Tail, QueryDirection::Head]
                .map(|direction| TestQuery { direction, pair })
        })
        .collect()
}

/// A candidate answer with the rules behind it, best first.
#[derive(Debug, Clone)]
pub struct RankedAnswer {
    pub entity: EntityId,
    pub rules: Vec<ScoredRule>,
}

impl RankedAnswer {
    /// Quality of the best supporting rule.
    pub fn score(&self) -> f64 {
        self.rules.first().map_or(0.0, |r| r.quality)
    }
}

/// A query with its answers in rank order.
#[derive(Debug, Clone)]
pub struct RankedQuery {
    pub query: TestQuery,
    /// Written order; members of a tie group appear by entity id.
    pub answers: Vec<RankedAnswer>,
    /// Where the true answer landed among the tie groups.
    pub outcome: RankOutcome,
}

impl RankedQuery {
    /// Whether the true answer has a rank of its own.
    pub fn resolved(&self) -> bool {
        CoveragePolicy::Strict.covers(self.outcome)
    }

    /// One-based position of the true answer, if present.
    pub fn position(&self) -> Option<usize> {
        let answer = self.query.answer();
        self.answers
            .iter()
            .position(|a| a.entity == answer)
            .map(|i| i + 1)
    }
}

/// Rank every test query of a target from its prediction map.
pub fn rank_queries(
    predictions: &HashMap<Pair, Vec<ScoredRule>>,
    examples: &TargetExamples,
    config: &EvaluationConfig,
) -> Vec<RankedQuery> {
    let mut by_subject: HashMap<EntityId, Vec<Pair>> = HashMap::new();
    let mut by_object: HashMap<EntityId, Vec<Pair>> = HashMap::new();
    for pair in predictions.keys() {
        by_subject.entry(pair.sub).or_default().push(*pair);
        by_object.entry(pair.obj).or_default().push(*pair);
    }

    test_queries(&examples.test)
        .into_iter()
        .map(|query| {
            let index = match query.direction {
                QueryDirection::Tail => &by_subject,
                QueryDirection::Head => &by_object,
            };
            let mut candidates: Vec<(EntityId, Vec<f64>)> = index
                .get(&query.fixed())
                .into_iter()
                .flatten()
                .filter(|pair| {
                    !config.prior_filtering || **pair == query.pair || !examples.is_known(pair)
                })
                .map(|pair| {
                    let entity = query.direction.sought(pair);
                    let scores = predictions
                        .get(pair)
                        .map(|rules| rules.iter().map(|r| r.quality).collect())
                        .unwrap_or_default();
                    (entity, scores)
                })
                .collect();
            candidates.sort_by_key(|(entity, _)| *entity);

            let groups = TieGroups::build(candidates, config.max_recursion_depth);
            let outcome = groups.rank_of(query.answer());
            let answers = groups
                .flatten()
                .into_iter()
                .map(|entity| RankedAnswer {
                    entity,
                    rules: predictions
                        .get(&query.candidate(entity))
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect();
            RankedQuery {
                query,
                answers,
                outcome,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Appends prediction and verification blocks for every target of a run.
pub struct PredictionWriter {
    predictions: BufWriter<File>,
    verifications: BufWriter<File>,
    prediction_path: PathBuf,
    verification_path: PathBuf,
    queries: usize,
}

impl PredictionWriter {
    pub fn create(prediction_path: &Path, verification_path: &Path) -> PersistResult<Self> {
        Ok(Self {
            predictions: create(prediction_path)?,
            verifications: create(verification_path)?,
            prediction_path: prediction_path.to_path_buf(),
            verification_path: verification_path.to_path_buf(),
            queries: 0,
        })
    }

    fn explain(
        query: &RankedQuery,
        index: usize,
        symbols: &SymbolTable,
        target: RelationId,
        config: &EvaluationConfig,
    ) -> Option<ExplainedAnswer> {
        let answer = query.answers.get(index)?;
        Some(ExplainedAnswer {
            position: index + 1,
            fact: verification_string(symbols, target, &query.query.candidate(answer.entity)),
            rules: answer
                .rules
                .iter()
                .take(config.verify_rule_size)
                .map(|r| (r.rule.render(symbols), r.quality))
                .collect(),
        })
    }

    /// Write the blocks of one target's queries.
    pub fn write_target(
        &mut self,
        symbols: &SymbolTable,
        target: RelationId,
        queries: &[RankedQuery],
        config: &EvaluationConfig,
    ) -> PersistResult<()> {
        for ranked in queries {
            let direction = ranked.query.direction;

            let answers: Vec<(String, f64)> = ranked
                .answers
                .iter()
                .take(config.top_k)
                .map(|a| {
                    (
                        query_string(symbols, target, &ranked.query.candidate(a.entity)),
                        a.score(),
                    )
                })
                .collect();
            let block = format_prediction_block(
                direction,
                &query_string(symbols, target, &ranked.query.pair),
                answers.iter().map(|(text, score)| (text.as_str(), *score)),
            );
            write_str(&mut self.predictions, &block, &self.prediction_path)?;

            let top: Vec<ExplainedAnswer> = (0..config.verify_prediction_size)
                .filter_map(|i| Self::explain(ranked, i, symbols, target, config))
                .collect();
            let correct = ranked
                .position()
                .and_then(|p| Self::explain(ranked, p - 1, symbols, target, config));
            let block = format_verification_block(
                direction,
                &verification_string(symbols, target, &ranked.query.pair),
                !ranked.answers.is_empty(),
                &top,
                correct.as_ref(),
            );
            write_str(&mut self.verifications, &block, &self.verification_path)?;
            self.queries += 1;
        }
        Ok(())
    }

    /// Flush both files and return the number of queries written.
    pub fn finish(mut self) -> PersistResult<usize> {
        flush(&mut self.predictions, &self.prediction_path)?;
        flush(&mut self.verifications, &self.verification_path)?;
        Ok(self.queries)
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Hits@k and MRR over a set of ranks. Rank 0 means not found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Hits {
    pub queries: usize,
    pub hits_at_1: f64,
    pub hits_at_3: f64,
    pub hits_at_10: f64,
    pub mrr: f64,
}

impl Hits {
    pub fn from_ranks(ranks: &[usize]) -> Self {
        if ranks.is_empty() {
            return Self::default();
        }
        let n = ranks.len() as f64;
        let hits = |k: usize| ranks.iter().filter(|&&r| r != 0 && r <= k).count() as f64 / n;
        let reciprocal: f64 = ranks
            .iter()
            .filter(|&&r| r != 0)
            .map(|&r| 1.0 / r as f64)
            .sum();
        Self {
            queries: ranks.len(),
            hits_at_1: hits(1),
            hits_at_3: hits(3),
            hits_at_10: hits(10),
            mrr: reciprocal / n,
        }
    }
}

/// Scores for head queries, tail queries and both.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DirectionScores {
    pub head: Hits,
    pub tail: Hits,
    pub both: Hits,
}

#[derive(Debug, Default)]
struct RankLists {
    head: Vec<usize>,
    tail: Vec<usize>,
}

impl RankLists {
    fn push(&mut self, direction: QueryDirection, rank: usize) {
        match direction {
            QueryDirection::Head => self.head.push(rank),
            QueryDirection::Tail => self.tail.push(rank),
        }
    }

    fn scores(&self) -> DirectionScores {
        let both: Vec<usize> = self.head.iter().chain(&self.tail).copied().collect();
        DirectionScores {
            head: Hits::from_ranks(&self.head),
            tail: Hits::from_ranks(&self.tail),
            both: Hits::from_ranks(&both),
        }
    }
}

/// Scores of a prediction file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreReport {
    pub overall: DirectionScores,
    pub relations: BTreeMap<String, DirectionScores>,
    /// Malformed lines and queries of unknown relations.
    pub skipped: usize,
}

/// Filtered rank of the true answer: its position among the answers after
/// discounting earlier answers that are other known facts. 0 if absent.
pub fn filtered_rank(
    query: Pair,
    answers: impl IntoIterator<Item = Pair>,
    is_known: impl Fn(&Pair) -> bool,
) -> usize {
    let mut filtered = 0;
    for (index, answer) in answers.into_iter().enumerate() {
        if answer == query {
            return index - filtered + 1;
        }
        if is_known(&answer) {
            filtered += 1;
        }
    }
    0
}

/// Score a parsed prediction file against the known facts of every split.
pub fn score_predictions(file: &PredictionFile, symbols: &SymbolTable, splits: &Splits) -> ScoreReport {
    let known: HashSet<Triple> = splits
        .train
        .iter()
        .chain(&splits.valid)
        .chain(&splits.test)
        .copied()
        .collect();

    let mut overall = RankLists::default();
    let mut per_relation: BTreeMap<String, RankLists> = BTreeMap::new();
    let mut skipped = file.skipped;

    for query in &file.queries {
        let Some(relation) = symbols.relation(&query.relation) else {
            warn!(relation = %query.relation, "skipping query of an unknown relation");
            skipped += 1;
            continue;
        };
        let rank = filtered_rank(
            query.pair,
            query.answers.iter().map(|a| a.pair),
            |p| known.contains(&Triple::new(p.sub, relation, p.obj)),
        );
        overall.push(query.direction, rank);
        per_relation
            .entry(query.relation.clone())
            .or_default()
            .push(query.direction, rank);
    }

    let report = ScoreReport {
        overall: overall.scores(),
        relations: per_relation
            .into_iter()
            .map(|(name, ranks)| (name, ranks.scores()))
            .collect(),
        skipped,
    };
    info!(
        queries = report.overall.both.queries,
        hits_at_1 = report.overall.both.hits_at_1,
        hits_at_3 = report.overall.both.hits_at_3,
        hits_at_10 = report.overall.both.hits_at_10,
        mrr = report.overall.both.mrr,
        skipped = report.skipped,
        "scored predictions"
    );
    report
}

/// In-memory scores of ranked queries, for run summaries. Only resolved
/// answers within `top_k` count as found.
pub fn quick_scores(queries: &[RankedQuery], top_k: usize) -> DirectionScores {
    let mut ranks = RankLists::default();
    for ranked in queries {
        let rank = match ranked.outcome {
            RankOutcome::Ranked(rank) if rank <= top_k => rank,
            _ => 0,
        };
        ranks.push(ranked.query.direction, rank);
    }
    ranks.scores()
}

/// Queries whose true answer is tied with other candidates.
pub fn unresolved(queries: &[RankedQuery]) -> usize {
    queries
        .iter()
        .filter(|q| matches!(q.outcome, RankOutcome::Unresolved { .. }))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::graph::Direction;
    use crate::persist::predictions::read_prediction_file;
    use crate::rule::{BodyAtom, Rule, Template};

    fn e(id: u32) -> EntityId {
        EntityId::new(id)
    }

    fn scored(quality: f64) -> ScoredRule {
        let template = Arc::new(Template {
            head: RelationId::new(0),
            body: vec![BodyAtom {
                relation: RelationId::new(0),
                direction: Direction::Incoming,
            }],
            closed: true,
            from_subject: true,
        });
        ScoredRule {
            quality,
            rule: Arc::new(Rule::from_template(template)),
        }
    }

    fn config() -> EvaluationConfig {
        EvaluationConfig {
            top_k: 10,
            max_recursion_depth: 1000,
            prior_filtering: true,
            verify_rule_size: 5,
            verify_prediction_size: 3,
        }
    }

    fn examples(train: &[(u32, u32)], test: &[(u32, u32)]) -> TargetExamples {
        let set = |pairs: &[(u32, u32)]| pairs.iter().map(|&(s, o)| Pair::new(e(s), e(o))).collect();
        TargetExamples {
            target: RelationId::new(0),
            train: set(train),
            valid: HashSet::new(),
            test: set(test),
        }
    }

    #[test]
    fn queries_come_in_tail_head_pairs() {
        let ex = examples(&[], &[(2, 3), (1, 5)]);
        let queries = test_queries(&ex.test);
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0].direction, QueryDirection::Tail);
        assert_eq!(queries[0].pair, Pair::new(e(1), e(5)));
        assert_eq!(queries[1].direction, QueryDirection::Head);
        assert_eq!(queries[1].answer(), e(1));
        assert_eq!(queries[1].candidate(e(9)), Pair::new(e(9), e(5)));
    }

    #[test]
    fn ranking_filters_known_facts() {
        let ex = examples(&[(1, 4)], &[(1, 5)]);
        let mut predictions = HashMap::new();
        predictions.insert(Pair::new(e(1), e(4)), vec![scored(0.9)]);
        predictions.insert(Pair::new(e(1), e(5)), vec![scored(0.5)]);
        predictions.insert(Pair::new(e(1), e(6)), vec![scored(0.4)]);

        let ranked = rank_queries(&predictions, &ex, &config());
        let tail = &ranked[0];
        let entities: Vec<EntityId> = tail.answers.iter().map(|a| a.entity).collect();
        assert_eq!(entities, vec![e(5), e(6)]);
        assert_eq!(tail.position(), Some(1));

        let unfiltered = rank_queries(
            &predictions,
            &ex,
            &EvaluationConfig {
                prior_filtering: false,
                ..config()
            },
        );
        assert_eq!(unfiltered[0].position(), Some(2));
        // The head query (?, 5) only sees subject 1.
        assert_eq!(unfiltered[1].answers.len(), 1);
    }

    #[test]
    fn tied_answers_stay_unresolved() {
        let ex = examples(&[], &[(1, 5)]);
        let mut predictions = HashMap::new();
        predictions.insert(Pair::new(e(1), e(5)), vec![scored(0.7)]);
        predictions.insert(Pair::new(e(1), e(6)), vec![scored(0.7)]);
        predictions.insert(Pair::new(e(1), e(7)), vec![scored(0.2)]);

        let ranked = rank_queries(&predictions, &ex, &config());
        let tail = &ranked[0];
        // Written first by entity id, but tied with 6.
        assert_eq!(tail.position(), Some(1));
        assert_eq!(
            tail.outcome,
            RankOutcome::Unresolved {
                ahead: 0,
                group_size: 2
            }
        );
        assert!(!tail.resolved());
        assert_eq!(unresolved(&ranked), 1);
        assert_eq!(quick_scores(&ranked, 10).tail.hits_at_1, 0.0);

        // The head query (?, 5) has the true answer alone.
        assert_eq!(ranked[1].outcome, RankOutcome::Ranked(1));
        assert_eq!(quick_scores(&ranked, 10).head.hits_at_1, 1.0);
    }

    #[test]
    fn hits_and_mrr() {
        let hits = Hits::from_ranks(&[1, 2, 0, 11]);
        assert_eq!(hits.queries, 4);
        assert_eq!(hits.hits_at_1, 0.25);
        assert_eq!(hits.hits_at_3, 0.5);
        assert_eq!(hits.hits_at_10, 0.5);
        assert!((hits.mrr - (1.0 + 0.5 + 1.0 / 11.0) / 4.0).abs() < 1e-12);
        assert_eq!(Hits::from_ranks(&[]), Hits::default());
    }

    #[test]
    fn filtered_rank_discounts_known_answers() {
        let query = Pair::new(e(1), e(5));
        let answers = [Pair::new(e(1), e(4)), Pair::new(e(1), e(6)), query];
        let known = |p: &Pair| *p == Pair::new(e(1), e(4));
        assert_eq!(filtered_rank(query, answers, known), 2);
        assert_eq!(filtered_rank(query, [Pair::new(e(1), e(4))], known), 0);
    }

    #[test]
    fn written_predictions_score_back() {
        let mut symbols = SymbolTable::new();
        let r = symbols.intern_relation("r");
        for name in ["a", "b", "c"] {
            symbols.intern_entity(name);
        }
        let ex = TargetExamples {
            target: r,
            train: HashSet::new(),
            valid: HashSet::new(),
            test: [Pair::new(e(0), e(1))].into_iter().collect(),
        };
        let mut predictions = HashMap::new();
        predictions.insert(Pair::new(e(0), e(1)), vec![scored(0.8)]);
        predictions.insert(Pair::new(e(2), e(1)), vec![scored(0.9)]);
        let ranked = rank_queries(&predictions, &ex, &config());

        let dir = tempfile::tempdir().unwrap();
        let pred_path = dir.path().join("predictions.txt");
        let verify_path = dir.path().join("verifications.txt");
        let mut writer = PredictionWriter::create(&pred_path, &verify_path).unwrap();
        writer.write_target(&symbols, r, &ranked, &config()).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let verification = std::fs::read_to_string(&verify_path).unwrap();
        assert!(verification.contains("Correct Answer: 2\ta\tr\tb"));

        let splits = Splits {
            train: vec![],
            valid: vec![],
            test: vec![Triple::new(e(0), r, e(1))],
        };
        let file = read_prediction_file(&pred_path).unwrap();
        let report = score_predictions(&file, &symbols, &splits);
        assert_eq!(report.overall.tail.hits_at_1, 1.0);
        assert_eq!(report.overall.head.hits_at_1, 0.0);
        assert_eq!(report.overall.head.mrr, 0.5);
        assert_eq!(report.overall.both.queries, 2);
        assert!(report.relations.contains_key("r"));
    }
}
