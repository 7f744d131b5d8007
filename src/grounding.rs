//! Rule body grounding: a typed, directed, node-simple depth-first matcher.
//!
//! Grounding a rule body yields every `(path start, path end)` pair reachable
//! by walking the body atoms in order. It is the hot loop of both
//! specialization (scoring candidate rules) and application (producing
//! predictions), with different caps and cancellation tokens.

use std::collections::HashMap;
use std::ops::ControlFlow;

use crate::cancel::{CancelToken, StopReason};
use crate::graph::{Direction, GraphView, Pair};
use crate::rule::{Rule, Template};
use crate::symbol::EntityId;

/// What to ground.
#[derive(Debug, Clone, Copy)]
pub struct GroundingRequest<'a> {
    pub template: &'a Template,
    /// When set, only paths ending on this entity count.
    pub tail: Option<EntityId>,
    /// Keep at most this many distinct groundings; `None` is unbounded.
    pub cap: Option<usize>,
}

impl<'a> GroundingRequest<'a> {
    /// Ground a rule's body, honoring its tail anchor if it has one.
    pub fn for_rule(rule: &'a Rule, cap: Option<usize>) -> Self {
        Self {
            template: &rule.template,
            tail: rule.tail(),
            cap,
        }
    }
}

/// Distinct body groundings with the number of paths behind each.
#[derive(Debug, Clone, Default)]
pub struct Groundings {
    counts: HashMap<Pair, u32>,
    /// Set when grounding ended before the search space was exhausted.
    pub stopped: Option<StopReason>,
}

impl Groundings {
    fn add(&mut self, pair: Pair) {
        *self.counts.entry(pair).or_insert(0) += 1;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn contains(&self, pair: &Pair) -> bool {
        self.counts.contains_key(pair)
    }

    /// Number of distinct paths that produced `pair`.
    pub fn paths(&self, pair: &Pair) -> u32 {
        self.counts.get(pair).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pair> {
        self.counts.keys()
    }

    pub fn into_pairs(self) -> impl Iterator<Item = Pair> {
        self.counts.into_keys()
    }
}

/// Ground `request` against `graph`, polling `token` at every step.
pub fn ground<G>(graph: &G, request: &GroundingRequest<'_>, token: &CancelToken) -> Groundings
where
    G: GraphView + ?Sized,
{
    let mut out = Groundings::default();
    let Some(first) = request.template.body.first() else {
        return out;
    };

    let mut path: Vec<EntityId> = Vec::with_capacity(request.template.len() + 1);
    for (subject, object) in graph.relation_edges(first.relation) {
        let (start, end) = match first.direction {
            Direction::Outgoing => (subject, object),
            Direction::Incoming => (object, subject),
        };
        if start == end {
            continue;
        }
        path.clear();
        path.push(start);
        path.push(end);
        if descend(graph, request, &mut path, &mut out, token).is_break() {
            break;
        }
    }

    tracing::trace!(
        groundings = out.len(),
        stopped = ?out.stopped,
        "grounded rule body"
    );
    out
}

fn descend<G>(
    graph: &G,
    request: &GroundingRequest<'_>,
    path: &mut Vec<EntityId>,
    out: &mut Groundings,
    token: &CancelToken,
) -> ControlFlow<()>
where
    G: GraphView + ?Sized,
{
    if let Some(reason) = token.reason() {
        out.stopped = Some(reason);
        return ControlFlow::Break(());
    }

    let length = path.len() - 1;
    let end = path[length];
    if length >= request.template.len() {
        if request.tail.is_some_and(|tail| tail != end) {
            return ControlFlow::Continue(());
        }
        let pair = Pair::new(path[0], end);
        // Only a grounding beyond the cap marks the set as cut off.
        if !out.contains(&pair) && request.cap.is_some_and(|cap| out.len() >= cap) {
            out.stopped = Some(StopReason::CountCap);
            return ControlFlow::Break(());
        }
        out.add(pair);
        return ControlFlow::Continue(());
    }

    let atom = request.template.body[length];
    for next in graph.neighbors(end, atom.relation, atom.direction) {
        if path.contains(&next) {
            continue;
        }
        path.push(next);
        let flow = descend(graph, request, path, out, token);
        path.pop();
        flow?;
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{KnowledgeGraph, Triple};
    use crate::rule::BodyAtom;
    use crate::symbol::RelationId;

    fn e(id: u32) -> EntityId {
        EntityId::new(id)
    }

    fn r(id: u32) -> RelationId {
        RelationId::new(id)
    }

    fn template(body: &[(u32, Direction)], closed: bool) -> Template {
        Template {
            head: r(0),
            body: body
                .iter()
                .map(|&(rel, direction)| BodyAtom {
                    relation: r(rel),
                    direction,
                })
                .collect(),
            closed,
            from_subject: true,
        }
    }

    /// 1 -p-> 2 -q-> 3, 1 -p-> 4 -q-> 3, 4 -q-> 5, 2 -p-> 1
    fn build_graph() -> KnowledgeGraph {
        let kg = KnowledgeGraph::new();
        kg.insert(&Triple::new(e(1), r(1), e(2)));
        kg.insert(&Triple::new(e(2), r(2), e(3)));
        kg.insert(&Triple::new(e(1), r(1), e(4)));
        kg.insert(&Triple::new(e(4), r(2), e(3)));
        kg.insert(&Triple::new(e(4), r(2), e(5)));
        kg.insert(&Triple::new(e(2), r(1), e(1)));
        kg
    }

    fn request(t: &Template) -> GroundingRequest<'_> {
        GroundingRequest {
            template: t,
            tail: None,
            cap: None,
        }
    }

    #[test]
    fn grounds_two_hop_paths() {
        let kg = build_graph();
        let view = kg.read();
        let t = template(&[(1, Direction::Outgoing), (2, Direction::Outgoing)], false);
        let g = ground(&view, &request(&t), &CancelToken::new());

        assert_eq!(g.len(), 2);
        assert!(g.contains(&Pair::new(e(1), e(3))));
        assert!(g.contains(&Pair::new(e(1), e(5))));
        assert_eq!(g.paths(&Pair::new(e(1), e(3))), 2);
        assert!(g.stopped.is_none());
    }

    #[test]
    fn incoming_atoms_walk_backwards() {
        let kg = build_graph();
        let view = kg.read();
        let t = template(&[(2, Direction::Incoming)], false);
        let g = ground(&view, &request(&t), &CancelToken::new());
        assert!(g.contains(&Pair::new(e(3), e(2))));
        assert!(g.contains(&Pair::new(e(5), e(4))));
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn paths_are_node_simple() {
        let kg = build_graph();
        let view = kg.read();
        // p then p back: 1 -> 2 -> 1 would revisit 1.
        let t = template(&[(1, Direction::Outgoing), (1, Direction::Outgoing)], false);
        let g = ground(&view, &request(&t), &CancelToken::new());
        assert!(g.iter().all(|p| !p.is_self_loop()));
        assert!(g.contains(&Pair::new(e(2), e(4))));
    }

    #[test]
    fn tail_anchor_filters_terminus() {
        let kg = build_graph();
        let view = kg.read();
        let t = template(&[(1, Direction::Outgoing), (2, Direction::Outgoing)], false);
        let req = GroundingRequest {
            template: &t,
            tail: Some(e(5)),
            cap: None,
        };
        let g = ground(&view, &req, &CancelToken::new());
        assert_eq!(g.len(), 1);
        assert!(g.iter().all(|p| p.obj == e(5) && p.sub != p.obj));
    }

    #[test]
    fn cap_stops_search() {
        let kg = build_graph();
        let view = kg.read();
        let t = template(&[(2, Direction::Outgoing)], false);
        let req = GroundingRequest {
            template: &t,
            tail: None,
            cap: Some(2),
        };
        let g = ground(&view, &req, &CancelToken::new());
        assert_eq!(g.len(), 2);
        assert_eq!(g.stopped, Some(StopReason::CountCap));
    }

    #[test]
    fn cap_equal_to_grounding_count_is_complete() {
        let kg = build_graph();
        let view = kg.read();
        let t = template(&[(2, Direction::Outgoing)], false);
        let req = GroundingRequest {
            template: &t,
            tail: None,
            cap: Some(3),
        };
        let g = ground(&view, &req, &CancelToken::new());
        assert_eq!(g.len(), 3);
        assert!(g.stopped.is_none());
    }

    #[test]
    fn cancelled_token_aborts() {
        let kg = build_graph();
        let view = kg.read();
        let t = template(&[(1, Direction::Outgoing), (2, Direction::Outgoing)], false);
        let token = CancelToken::new();
        token.cancel_with(StopReason::CountCap);
        let g = ground(&view, &request(&t), &token);
        assert!(g.is_empty());
        assert_eq!(g.stopped, Some(StopReason::CountCap));

        let expired = CancelToken::with_budget(Some(std::time::Duration::ZERO));
        let g = ground(&view, &request(&t), &expired);
        assert_eq!(g.stopped, Some(StopReason::TimeBudget));
    }
}
