//! In-memory knowledge graph with dual-indexing.
//!
//! Uses a `petgraph` stable graph for adjacency and `DashMap` for lookups by
//! entity and by relation. Stable indices let held-out edges be removed and
//! restored without invalidating node handles.

use std::sync::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::symbol::{EntityId, RelationId};

use super::{Direction, GraphView, Step, Triple};

/// In-memory knowledge graph backed by petgraph with dual-indexing.
pub struct KnowledgeGraph {
    /// Nodes are entities, edges carry their relation.
    graph: RwLock<StableDiGraph<EntityId, RelationId>>,
    /// EntityId → NodeIndex mapping for O(1) node lookups.
    node_index: DashMap<EntityId, NodeIndex>,
    /// Relation → list of (subject, object) pairs.
    relation_index: DashMap<RelationId, Vec<(EntityId, EntityId)>>,
    edge_count: AtomicUsize,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(StableDiGraph::new()),
            node_index: DashMap::new(),
            relation_index: DashMap::new(),
            edge_count: AtomicUsize::new(0),
        }
    }

    fn node(&self, entity: EntityId) -> Option<NodeIndex> {
        self.node_index.get(&entity).map(|idx| *idx.value())
    }

    /// Ensure a node exists for the given entity, returning its NodeIndex.
    pub fn ensure_node(&self, entity: EntityId) -> NodeIndex {
        if let Some(idx) = self.node(entity) {
            return idx;
        }
        let mut graph = self.graph.write().expect("graph lock poisoned");
        // Double-check after acquiring write lock
        if let Some(idx) = self.node(entity) {
            return idx;
        }
        let idx = graph.add_node(entity);
        self.node_index.insert(entity, idx);
        idx
    }

    /// Insert a fact. Returns `false` if the identical fact was already present.
    pub fn insert(&self, triple: &Triple) -> bool {
        let subj = self.ensure_node(triple.subject);
        let obj = self.ensure_node(triple.object);

        let mut graph = self.graph.write().expect("graph lock poisoned");
        let exists = graph
            .edges_connecting(subj, obj)
            .any(|e| *e.weight() == triple.relation);
        if exists {
            return false;
        }
        graph.add_edge(subj, obj, triple.relation);
        self.relation_index
            .entry(triple.relation)
            .or_default()
            .push((triple.subject, triple.object));
        self.edge_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove a fact. Returns `false` if it was not present.
    pub fn remove(&self, triple: &Triple) -> bool {
        let (Some(subj), Some(obj)) = (self.node(triple.subject), self.node(triple.object)) else {
            return false;
        };

        let mut graph = self.graph.write().expect("graph lock poisoned");
        let edge = graph
            .edges_connecting(subj, obj)
            .find(|e| *e.weight() == triple.relation)
            .map(|e| e.id());
        let Some(edge) = edge else {
            return false;
        };
        graph.remove_edge(edge);

        if let Some(mut pairs) = self.relation_index.get_mut(&triple.relation) {
            if let Some(pos) = pairs
                .iter()
                .position(|&(s, o)| s == triple.subject && o == triple.object)
            {
                pairs.swap_remove(pos);
            }
        }
        self.edge_count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Open a shared read scope. Must not be held across [`insert`](Self::insert)
    /// or [`remove`](Self::remove) on the same thread.
    pub fn read(&self) -> ReadScope<'_> {
        ReadScope {
            graph: self.graph.read().expect("graph lock poisoned"),
            node_index: &self.node_index,
            relation_index: &self.relation_index,
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count.load(Ordering::Relaxed)
    }

    /// Number of edges of one relation.
    pub fn relation_size(&self, relation: RelationId) -> usize {
        self.relation_index
            .get(&relation)
            .map(|v| v.len())
            .unwrap_or_default()
    }
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KnowledgeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

/// A shared read scope over a [`KnowledgeGraph`].
///
/// Holds the graph's read lock; many threads may share one scope by reference.
pub struct ReadScope<'g> {
    graph: RwLockReadGuard<'g, StableDiGraph<EntityId, RelationId>>,
    node_index: &'g DashMap<EntityId, NodeIndex>,
    relation_index: &'g DashMap<RelationId, Vec<(EntityId, EntityId)>>,
}

impl ReadScope<'_> {
    fn node(&self, entity: EntityId) -> Option<NodeIndex> {
        self.node_index.get(&entity).map(|idx| *idx.value())
    }
}

impl GraphView for ReadScope<'_> {
    fn relation_edges(&self, relation: RelationId) -> Vec<(EntityId, EntityId)> {
        self.relation_index
            .get(&relation)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    fn neighbors(
        &self,
        node: EntityId,
        relation: RelationId,
        direction: Direction,
    ) -> Vec<EntityId> {
        let Some(idx) = self.node(node) else {
            return vec![];
        };
        self.graph
            .edges_directed(idx, direction.to_petgraph())
            .filter(|e| *e.weight() == relation)
            .filter_map(|e| {
                let other = match direction {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                self.graph.node_weight(other).copied()
            })
            .collect()
    }

    fn steps(&self, node: EntityId) -> Vec<Step> {
        let Some(idx) = self.node(node) else {
            return vec![];
        };
        let outgoing = self
            .graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .filter_map(|e| {
                Some(Step {
                    relation: *e.weight(),
                    direction: Direction::Outgoing,
                    node: *self.graph.node_weight(e.target())?,
                })
            });
        let incoming = self
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .filter_map(|e| {
                Some(Step {
                    relation: *e.weight(),
                    direction: Direction::Incoming,
                    node: *self.graph.node_weight(e.source())?,
                })
            });
        outgoing.chain(incoming).collect()
    }

    fn contains(&self, triple: &Triple) -> bool {
        let (Some(subj), Some(obj)) = (self.node(triple.subject), self.node(triple.object)) else {
            return false;
        };
        self.graph
            .edges_connecting(subj, obj)
            .any(|e| *e.weight() == triple.relation)
    }
}

/// Temporarily removes facts from a graph, restoring them on drop.
///
/// Used to hide validation and test facts of the current target while rules
/// are learned. Creation and drop must happen outside any [`ReadScope`].
pub struct EdgeHoldout<'g> {
    graph: &'g KnowledgeGraph,
    removed: Vec<Triple>,
}

impl<'g> EdgeHoldout<'g> {
    pub fn new<'t>(graph: &'g KnowledgeGraph, facts: impl IntoIterator<Item = &'t Triple>) -> Self {
        let removed = facts
            .into_iter()
            .filter(|t| graph.remove(t))
            .copied()
            .collect::<Vec<_>>();
        tracing::debug!(removed = removed.len(), "held out facts");
        Self { graph, removed }
    }

    /// Number of facts actually removed.
    pub fn len(&self) -> usize {
        self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

impl Drop for EdgeHoldout<'_> {
    fn drop(&mut self) {
        for triple in &self.removed {
            self.graph.insert(triple);
        }
        tracing::debug!(restored = self.removed.len(), "restored held-out facts");
    }
}
