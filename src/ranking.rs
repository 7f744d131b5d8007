//! Tie-aware ranking of candidate answers.
//!
//! Every candidate carries a score vector: the qualities of its supporting
//! rules, best first. Candidates are ordered by the first score, ties are
//! broken by the second, and so on. Candidates whose vectors agree on every
//! compared position stay tied, as do all candidates still tied once the
//! recursion depth limit is reached.
//!
//! [`ScoreList`] builds the same partition incrementally, one rule at a time,
//! for convergence-mode application.

use std::collections::HashSet;
use std::hash::Hash;

/// Score vector entry used for a missing position; below every quality.
const MISSING: f64 = -1.0;

/// Candidates partitioned into ordered tie groups, best group first.
#[derive(Debug, Clone, PartialEq)]
pub struct TieGroups<T> {
    groups: Vec<Vec<T>>,
}

impl<T: Copy + PartialEq> TieGroups<T> {
    /// Partition `candidates` by their score vectors.
    pub fn build(candidates: Vec<(T, Vec<f64>)>, max_depth: usize) -> Self {
        let mut groups = Vec::new();
        split(candidates, 0, max_depth, &mut groups);
        Self { groups }
    }

    pub fn groups(&self) -> &[Vec<T>] {
        &self.groups
    }

    /// All candidates in rank order.
    pub fn flatten(&self) -> Vec<T> {
        self.groups.iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn rank_of(&self, answer: T) -> RankOutcome {
        rank_in(&self.groups, answer)
    }

    pub fn covers(&self, answer: T, policy: CoveragePolicy) -> bool {
        policy.covers(self.rank_of(answer))
    }
}

fn score_at(scores: &[f64], level: usize) -> Option<f64> {
    scores.get(level).copied()
}

fn split<T>(mut candidates: Vec<(T, Vec<f64>)>, level: usize, max_depth: usize, out: &mut Vec<Vec<T>>) {
    if candidates.is_empty() {
        return;
    }
    if level > max_depth {
        out.push(candidates.into_iter().map(|(c, _)| c).collect());
        return;
    }

    candidates.sort_by(|a, b| {
        let a = score_at(&a.1, level).unwrap_or(MISSING);
        let b = score_at(&b.1, level).unwrap_or(MISSING);
        b.total_cmp(&a)
    });

    let mut rest = candidates.into_iter().peekable();
    while let Some(first) = rest.next() {
        let key = score_at(&first.1, level);
        let mut run = vec![first];
        while let Some(next) = rest.peek() {
            if score_at(&next.1, level) != key {
                break;
            }
            if let Some(next) = rest.next() {
                run.push(next);
            }
        }

        if run.len() == 1 || key.is_none() {
            // A singleton, or vectors exhausted together: nothing left to compare.
            out.push(run.into_iter().map(|(c, _)| c).collect());
        } else {
            split(run, level + 1, max_depth, out);
        }
    }
}

/// Where an answer landed among ranked candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankOutcome {
    /// Alone in its group, at this one-based rank.
    Ranked(usize),
    /// Tied with others; `ahead` candidates sit in better groups.
    Unresolved { ahead: usize, group_size: usize },
    /// Not among the candidates at all.
    Missing { candidates: usize },
}

fn rank_in<T: PartialEq>(groups: &[Vec<T>], answer: T) -> RankOutcome {
    let mut ahead = 0;
    for group in groups {
        if group.contains(&answer) {
            return if group.len() == 1 {
                RankOutcome::Ranked(ahead + 1)
            } else {
                RankOutcome::Unresolved {
                    ahead,
                    group_size: group.len(),
                }
            };
        }
        ahead += group.len();
    }
    RankOutcome::Missing { candidates: ahead }
}

/// When a query counts as settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoveragePolicy {
    /// The answer sits alone in its group.
    Strict,
    /// The answer sits alone in its group, or more than `top_k` candidates
    /// already rank ahead of it (including when it has not appeared yet).
    BeyondTopK { top_k: usize },
}

impl CoveragePolicy {
    pub fn covers(self, outcome: RankOutcome) -> bool {
        match (self, outcome) {
            (_, RankOutcome::Ranked(_)) => true,
            (CoveragePolicy::Strict, _) => false,
            (CoveragePolicy::BeyondTopK { top_k }, RankOutcome::Unresolved { ahead, .. }) => {
                ahead > top_k
            }
            (CoveragePolicy::BeyondTopK { top_k }, RankOutcome::Missing { candidates }) => {
                candidates > top_k
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Incremental score list
// ---------------------------------------------------------------------------

/// Tie groups of one query, refined rule by rule in descending quality.
///
/// Applying a rule splits every existing group into the members the rule
/// predicts and the rest, and appends the candidates seen for the first time
/// as a new lowest group.
#[derive(Debug, Clone)]
pub struct ScoreList<T> {
    answer: T,
    groups: Vec<Vec<T>>,
    seen: HashSet<T>,
}

impl<T: Copy + Eq + Hash + Ord> ScoreList<T> {
    pub fn new(answer: T) -> Self {
        Self {
            answer,
            groups: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn answer(&self) -> T {
        self.answer
    }

    pub fn groups(&self) -> &[Vec<T>] {
        &self.groups
    }

    /// The group currently holding the answer.
    pub fn answer_group(&self) -> Option<&[T]> {
        self.groups
            .iter()
            .find(|g| g.contains(&self.answer))
            .map(Vec::as_slice)
    }

    /// Narrow a rule's candidates to the ones that can still move the answer:
    /// once the answer is tied, only its own group matters.
    pub fn relevant(&self, candidates: &[T]) -> Vec<T> {
        match self.answer_group() {
            Some(group) if group.len() > 1 => candidates
                .iter()
                .filter(|c| group.contains(c))
                .copied()
                .collect(),
            _ => candidates.to_vec(),
        }
    }

    /// Refine the groups with the candidates of the next rule.
    pub fn refine(&mut self, candidates: &[T]) {
        let predicted: HashSet<T> = candidates.iter().copied().collect();
        let mut refined = Vec::with_capacity(self.groups.len() + 1);
        for group in self.groups.drain(..) {
            let (hit, miss): (Vec<T>, Vec<T>) =
                group.into_iter().partition(|c| predicted.contains(c));
            if !hit.is_empty() {
                refined.push(hit);
            }
            if !miss.is_empty() {
                refined.push(miss);
            }
        }

        let mut fresh: Vec<T> = predicted
            .into_iter()
            .filter(|c| !self.seen.contains(c))
            .collect();
        if !fresh.is_empty() {
            fresh.sort();
            self.seen.extend(fresh.iter().copied());
            refined.push(fresh);
        }
        self.groups = refined;
    }

    pub fn rank(&self) -> RankOutcome {
        rank_in(&self.groups, self.answer)
    }

    pub fn covered(&self, policy: CoveragePolicy) -> bool {
        policy.covers(self.rank())
    }
}
