//! Entity and relation identifiers.
//!
//! Every entity and relation name read from the split files is interned once
//! into a [`SymbolTable`] and referred to by a dense integer id afterwards.
//! Rules, pairs and groundings only ever carry ids; names are resolved when
//! something is written for humans.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Dense identifier of a graph entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(u32);

impl EntityId {
    pub fn new(raw: u32) -> Self {
        EntityId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense identifier of a relation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RelationId(u32);

impl RelationId {
    pub fn new(raw: u32) -> Self {
        RelationId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for RelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rel:{}", self.0)
    }
}

/// One direction of name interning: `name -> id` and `id -> name`.
#[derive(Debug, Default, Clone)]
struct Interner {
    by_name: HashMap<String, u32>,
    names: Vec<String>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }
}

/// Bidirectional name table for entities and relations.
///
/// Populated single-threaded while the graph is loaded, then shared
/// read-only by every worker.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    entities: Interner,
    relations: Interner,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an entity name, returning the existing id if already known.
    pub fn intern_entity(&mut self, name: &str) -> EntityId {
        EntityId(self.entities.intern(name))
    }

    /// Intern a relation name, returning the existing id if already known.
    pub fn intern_relation(&mut self, name: &str) -> RelationId {
        RelationId(self.relations.intern(name))
    }

    pub fn entity(&self, name: &str) -> Option<EntityId> {
        self.entities.lookup(name).map(EntityId)
    }

    pub fn relation(&self, name: &str) -> Option<RelationId> {
        self.relations.lookup(name).map(RelationId)
    }

    pub fn entity_name(&self, id: EntityId) -> Option<&str> {
        self.entities.name(id.0)
    }

    pub fn relation_name(&self, id: RelationId) -> Option<&str> {
        self.relations.name(id.0)
    }

    /// Name of an entity, falling back to its numeric id when unknown.
    pub fn entity_label(&self, id: EntityId) -> Cow<'_, str> {
        match self.entity_name(id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(id.to_string()),
        }
    }

    /// Name of a relation, falling back to its numeric id when unknown.
    pub fn relation_label(&self, id: RelationId) -> Cow<'_, str> {
        match self.relation_name(id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(id.to_string()),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.names.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.names.len()
    }

    /// All relation ids in interning order.
    pub fn relations(&self) -> impl Iterator<Item = RelationId> + '_ {
        (0..self.relations.names.len() as u32).map(RelationId)
    }
}
