//! Random-walk path sampling around a known pair.
//!
//! Paths are expanded breadth-first from both endpoints of a pair. At every
//! expansion at most `random_walkers` adjacent edges (of any relation) are
//! sampled, and a path never revisits one of its own nodes. A depth/closure
//! evaluator decides which paths are reported and which are expanded further.

use std::collections::VecDeque;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::symbol::{EntityId, RelationId};

use super::{Direction, GraphView, Pair, Step};

/// Configuration for path sampling.
#[derive(Debug, Clone, Copy)]
pub struct SamplingConfig {
    /// Maximum number of edges in a reported path.
    pub max_depth: usize,
    /// Edges sampled per expansion; 0 takes every edge.
    pub random_walkers: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            random_walkers: 10,
        }
    }
}

/// A node-simple walk through the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPath {
    nodes: Vec<EntityId>,
    steps: Vec<(RelationId, Direction)>,
}

impl LocalPath {
    /// A zero-length path sitting on `start`.
    pub fn new(start: EntityId) -> Self {
        Self {
            nodes: vec![start],
            steps: Vec::new(),
        }
    }

    /// A one-edge path.
    #[cfg(test)]
    pub(crate) fn from_edge(start: EntityId, relation: RelationId, direction: Direction, end: EntityId) -> Self {
        Self {
            nodes: vec![start, end],
            steps: vec![(relation, direction)],
        }
    }

    /// This path extended by one step.
    pub fn extend(&self, step: Step) -> Self {
        let mut next = self.clone();
        next.nodes.push(step.node);
        next.steps.push((step.relation, step.direction));
        next
    }

    pub fn start(&self) -> EntityId {
        self.nodes[0]
    }

    pub fn end(&self) -> EntityId {
        self.nodes[self.nodes.len() - 1]
    }

    /// Number of edges.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, node: EntityId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn nodes(&self) -> &[EntityId] {
        &self.nodes
    }

    pub fn steps(&self) -> &[(RelationId, Direction)] {
        &self.steps
    }

    /// Source and target of the last edge, in the edge's own orientation.
    fn last_edge(&self) -> Option<(EntityId, RelationId, EntityId)> {
        let &(relation, direction) = self.steps.last()?;
        let to = self.end();
        let from = self.nodes[self.nodes.len() - 2];
        Some(match direction {
            Direction::Outgoing => (from, relation, to),
            Direction::Incoming => (to, relation, from),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Verdict {
    include: bool,
    expand: bool,
}

impl Verdict {
    const INCLUDE_AND_PRUNE: Verdict = Verdict {
        include: true,
        expand: false,
    };
    const EXCLUDE_AND_PRUNE: Verdict = Verdict {
        include: false,
        expand: false,
    };
    const EXCLUDE_AND_CONTINUE: Verdict = Verdict {
        include: false,
        expand: true,
    };
}

/// Decide whether a path around `pair` is reported and whether it grows.
///
/// The trivial one-hop path over the target fact itself is never reported.
/// A path leaving the subject stops at the first edge that closes it on the
/// object; a path leaving the object that closes on the subject is dropped,
/// except for the one-hop reverse edge `target(Y, X)`.
fn evaluate(path: &LocalPath, pair: Pair, target: RelationId, depth: usize) -> Verdict {
    let length = path.len();
    let from_source = path.start() == pair.sub;
    let closed = if from_source {
        path.end() == pair.obj
    } else {
        path.end() == pair.sub
    };

    let mut has_target_relation = false;
    if let Some((from, relation, to)) = path.last_edge() {
        has_target_relation = relation == target;
        if length == 1 && has_target_relation && from == pair.obj && to == pair.sub {
            return Verdict::INCLUDE_AND_PRUNE;
        }
    }

    if length == 0 {
        return Verdict::EXCLUDE_AND_CONTINUE;
    }
    if length == 1 && has_target_relation && closed {
        return Verdict::EXCLUDE_AND_PRUNE;
    }
    if closed {
        return if from_source {
            Verdict::INCLUDE_AND_PRUNE
        } else {
            Verdict::EXCLUDE_AND_PRUNE
        };
    }
    if path.start() == path.end() {
        return Verdict::EXCLUDE_AND_PRUNE;
    }
    Verdict {
        include: length <= depth,
        expand: length < depth,
    }
}

/// Pick the edges a walker follows out of one node.
fn sample_steps<R: Rng + ?Sized>(mut candidates: Vec<Step>, walkers: usize, rng: &mut R) -> Vec<Step> {
    if walkers == 0 || candidates.len() < walkers {
        return candidates;
    }
    candidates.shuffle(rng);
    candidates.truncate(walkers);
    candidates
}

/// Sample paths of length `1..=max_depth` around a known `pair` of `target`.
///
/// Expansion starts from the subject, then from the object, in breadth-first
/// order.
pub fn sample_paths<G, R>(
    graph: &G,
    pair: Pair,
    target: RelationId,
    config: &SamplingConfig,
    rng: &mut R,
) -> Vec<LocalPath>
where
    G: GraphView + ?Sized,
    R: Rng + ?Sized,
{
    let mut found = Vec::new();
    let mut queue: VecDeque<LocalPath> = VecDeque::new();
    queue.push_back(LocalPath::new(pair.sub));
    if pair.obj != pair.sub {
        queue.push_back(LocalPath::new(pair.obj));
    }

    while let Some(path) = queue.pop_front() {
        let verdict = evaluate(&path, pair, target, config.max_depth);
        if verdict.expand {
            let candidates = graph.steps(path.end());
            for step in sample_steps(candidates, config.random_walkers, rng) {
                if !path.contains(step.node) {
                    queue.push_back(path.extend(step));
                }
            }
        }
        if verdict.include {
            found.push(path);
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{KnowledgeGraph, Triple};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn e(id: u32) -> EntityId {
        EntityId::new(id)
    }

    fn r(id: u32) -> RelationId {
        RelationId::new(id)
    }

    const TARGET: u32 = 0;
    const OTHER: u32 = 1;

    /// 1 -target-> 2, 1 -other-> 3 -other-> 2, 2 -target-> 1 (reverse).
    fn build_graph() -> KnowledgeGraph {
        let kg = KnowledgeGraph::new();
        kg.insert(&Triple::new(e(1), r(TARGET), e(2)));
        kg.insert(&Triple::new(e(1), r(OTHER), e(3)));
        kg.insert(&Triple::new(e(3), r(OTHER), e(2)));
        kg.insert(&Triple::new(e(2), r(TARGET), e(1)));
        kg
    }

    fn config(depth: usize) -> SamplingConfig {
        SamplingConfig {
            max_depth: depth,
            random_walkers: 0,
        }
    }

    #[test]
    fn trivial_edge_is_never_reported() {
        let kg = build_graph();
        let view = kg.read();
        let mut rng = StdRng::seed_from_u64(0);
        let pair = Pair::new(e(1), e(2));
        let paths = sample_paths(&view, pair, r(TARGET), &config(3), &mut rng);

        let trivial = paths.iter().any(|p| {
            p.len() == 1 && p.start() == e(1) && p.steps()[0] == (r(TARGET), Direction::Outgoing)
        });
        assert!(!trivial);
    }

    #[test]
    fn closing_path_from_subject_is_reported_and_pruned() {
        let kg = build_graph();
        let view = kg.read();
        let mut rng = StdRng::seed_from_u64(0);
        let pair = Pair::new(e(1), e(2));
        let paths = sample_paths(&view, pair, r(TARGET), &config(3), &mut rng);

        let closed: Vec<_> = paths
            .iter()
            .filter(|p| p.start() == e(1) && p.end() == e(2))
            .collect();
        assert!(closed.iter().any(|p| p.nodes() == [e(1), e(3), e(2)]));
        // Nothing continues past the object once closed.
        for p in paths.iter().filter(|p| p.start() == e(1)) {
            let inner = &p.nodes()[..p.nodes().len() - 1];
            assert!(!inner.contains(&e(2)));
        }
    }

    #[test]
    fn reverse_edge_is_reported_from_both_ends() {
        let kg = build_graph();
        let view = kg.read();
        let mut rng = StdRng::seed_from_u64(0);
        let pair = Pair::new(e(1), e(2));
        let paths = sample_paths(&view, pair, r(TARGET), &config(1), &mut rng);

        let reverse: Vec<_> = paths
            .iter()
            .filter(|p| p.len() == 1 && p.steps()[0].0 == r(TARGET))
            .collect();
        assert_eq!(reverse.len(), 2);
    }

    #[test]
    fn paths_are_node_simple_and_bounded() {
        let kg = build_graph();
        let view = kg.read();
        let mut rng = StdRng::seed_from_u64(7);
        let pair = Pair::new(e(1), e(2));
        for path in sample_paths(&view, pair, r(TARGET), &config(2), &mut rng) {
            assert!(path.len() >= 1 && path.len() <= 2);
            let mut nodes = path.nodes().to_vec();
            nodes.sort();
            nodes.dedup();
            assert_eq!(nodes.len(), path.nodes().len());
        }
    }

    #[test]
    fn walkers_limit_fan_out() {
        let kg = KnowledgeGraph::new();
        for i in 10..30 {
            kg.insert(&Triple::new(e(1), r(OTHER), e(i)));
        }
        kg.insert(&Triple::new(e(1), r(TARGET), e(2)));
        let view = kg.read();
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = SamplingConfig {
            max_depth: 1,
            random_walkers: 5,
        };
        let paths = sample_paths(&view, Pair::new(e(1), e(2)), r(TARGET), &cfg, &mut rng);
        let from_subject = paths.iter().filter(|p| p.start() == e(1)).count();
        assert!(from_subject <= 5);
    }
}
