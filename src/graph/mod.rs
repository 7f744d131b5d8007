//! Knowledge graph: typed, directed entity–relation–entity edges.
//!
//! - [`GraphView`] is the read contract every mining phase is written against.
//! - [`KnowledgeGraph`] is the in-memory backend (petgraph + DashMap). Reads go
//!   through a [`ReadScope`] held for the duration of a phase; edge removal and
//!   reinsertion happen only outside of read scopes.
//! - [`load`] builds a graph and symbol table from the split files.

pub mod index;
pub mod load;
pub mod traverse;

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::symbol::{EntityId, RelationId};

pub use index::{EdgeHoldout, KnowledgeGraph, ReadScope};

/// A fact (subject, relation, object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: EntityId,
    pub relation: RelationId,
    pub object: EntityId,
}

impl Triple {
    pub fn new(subject: EntityId, relation: RelationId, object: EntityId) -> Self {
        Self {
            subject,
            relation,
            object,
        }
    }

    /// The endpoint pair of this fact, carrying the relation as its edge.
    pub fn pair(&self) -> Pair {
        Pair::new(self.subject, self.object).with_edge(self.relation)
    }
}

/// Direction in which an edge is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the edge's subject to its object.
    Outgoing,
    /// From the edge's object back to its subject.
    Incoming,
}

impl Direction {
    /// Flag used in the rule index format: `0` outgoing, `1` incoming.
    pub fn flag(self) -> u8 {
        match self {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "0" => Some(Direction::Outgoing),
            "1" => Some(Direction::Incoming),
            _ => None,
        }
    }

    pub(crate) fn to_petgraph(self) -> petgraph::Direction {
        match self {
            Direction::Outgoing => petgraph::Direction::Outgoing,
            Direction::Incoming => petgraph::Direction::Incoming,
        }
    }
}

/// An (origin, terminus) entity pair: a known fact of the target relation or
/// a candidate prediction.
///
/// Equality and hashing use the endpoints only; the optional backing edge
/// relation is informational, so a pair set stays valid while the edge it
/// names is removed and reinserted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pair {
    pub sub: EntityId,
    pub obj: EntityId,
    pub edge: Option<RelationId>,
}

impl Pair {
    pub fn new(sub: EntityId, obj: EntityId) -> Self {
        Self {
            sub,
            obj,
            edge: None,
        }
    }

    pub fn with_edge(mut self, relation: RelationId) -> Self {
        self.edge = Some(relation);
        self
    }

    /// The same pair with subject and object swapped.
    pub fn reversed(&self) -> Self {
        Self {
            sub: self.obj,
            obj: self.sub,
            edge: self.edge,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.sub == self.obj
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.sub == other.sub && self.obj == other.obj
    }
}

impl Eq for Pair {}

impl Hash for Pair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sub.hash(state);
        self.obj.hash(state);
    }
}

/// One edge as seen from a node: the relation, the walking direction, and the
/// node on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Step {
    pub relation: RelationId,
    pub direction: Direction,
    pub node: EntityId,
}

/// Read access to a graph backend.
///
/// Implementations must be shareable across worker threads; every method is a
/// pure read.
pub trait GraphView: Sync {
    /// All `(subject, object)` pairs connected by an edge of `relation`.
    fn relation_edges(&self, relation: RelationId) -> Vec<(EntityId, EntityId)>;

    /// Nodes reachable from `node` over one `relation` edge walked in `direction`.
    fn neighbors(&self, node: EntityId, relation: RelationId, direction: Direction)
    -> Vec<EntityId>;

    /// Every edge touching `node`, of any relation, in both directions.
    fn steps(&self, node: EntityId) -> Vec<Step>;

    /// Whether the fact is present.
    fn contains(&self, triple: &Triple) -> bool;
}
