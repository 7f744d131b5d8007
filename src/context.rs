//! Per-target mining state.
//!
//! A [`Context`] lives for one target relation. It owns the template arena
//! filled by generalization, the capped prediction map filled by application,
//! and the run counters. It is dropped once the target's output is flushed.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;

use crate::error::{RuleError, RuleResult};
use crate::graph::Pair;
use crate::rule::{Rule, Template};
use crate::symbol::RelationId;

// ---------------------------------------------------------------------------
// Template arena
// ---------------------------------------------------------------------------

/// Stable index of a template, assigned on first sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateHandle(usize);

impl TemplateHandle {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TemplateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of recording one template sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub handle: TemplateHandle,
    /// The template had not been seen before.
    pub first: bool,
}

#[derive(Debug, Default)]
struct Arena {
    templates: Vec<Arc<Template>>,
    frequencies: Vec<u64>,
    handles: HashMap<Arc<Template>, TemplateHandle>,
}

// ---------------------------------------------------------------------------
// Prediction map
// ---------------------------------------------------------------------------

/// A rule supporting a prediction, with its quality at insertion time.
#[derive(Debug, Clone)]
pub struct ScoredRule {
    pub quality: f64,
    pub rule: Arc<Rule>,
}

/// Candidate pair → its best supporting rules, highest quality first.
///
/// Each list holds at most `cap` rules. Updates lock only the pair's shard.
#[derive(Debug)]
pub struct PredictionMap {
    cap: usize,
    entries: DashMap<Pair, Vec<ScoredRule>>,
}

impl PredictionMap {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: DashMap::new(),
        }
    }

    /// Offer `rule` as support for `pair`.
    ///
    /// Below the cap the rule is appended; at the cap it replaces the current
    /// worst entry only when strictly better. Returns whether the list changed.
    pub fn insert(&self, pair: Pair, rule: &Arc<Rule>, quality: f64) -> bool {
        let mut rules = self.entries.entry(pair).or_default();
        if rules.len() >= self.cap {
            let worst = rules.last().map_or(f64::INFINITY, |w| w.quality);
            if worst >= quality {
                return false;
            }
            rules.pop();
        }
        rules.push(ScoredRule {
            quality,
            rule: Arc::clone(rule),
        });
        rules.sort_by(|a, b| b.quality.total_cmp(&a.quality));
        true
    }

    /// Number of distinct candidate pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pair: &Pair) -> Option<Vec<ScoredRule>> {
        self.entries.get(pair).map(|rules| rules.clone())
    }

    /// Take the map out for ranking.
    pub fn into_inner(self) -> HashMap<Pair, Vec<ScoredRule>> {
        self.entries.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Composition summary
// ---------------------------------------------------------------------------

/// Counts of templates by shape, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Composition {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    /// Open templates per body length.
    pub open_by_length: BTreeMap<usize, usize>,
}

impl Composition {
    pub fn of<'a>(templates: impl IntoIterator<Item = &'a Template>) -> Self {
        let mut c = Composition::default();
        for t in templates {
            c.total += 1;
            if t.closed {
                c.closed += 1;
            } else {
                c.open += 1;
                *c.open_by_length.entry(t.len()).or_insert(0) += 1;
            }
        }
        c
    }

    /// `"<header>: N | closed: a | open: b | len=1: x | ..."`
    pub fn summary(&self, header: &str) -> String {
        let mut line = format!(
            "{header}: {} | closed: {} | open: {}",
            self.total, self.closed, self.open
        );
        for (length, count) in &self.open_by_length {
            line.push_str(&format!(" | len={length}: {count}"));
        }
        line
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Mining state for one target relation.
#[derive(Debug)]
pub struct Context {
    target: RelationId,
    arena: RwLock<Arena>,
    specialized: Mutex<Vec<TemplateHandle>>,
    predictions: PredictionMap,
    instantiated: AtomicUsize,
    applied: AtomicUsize,
}

impl Context {
    pub fn new(target: RelationId, prediction_rule_cap: usize) -> Self {
        Self {
            target,
            arena: RwLock::new(Arena::default()),
            specialized: Mutex::new(Vec::new()),
            predictions: PredictionMap::new(prediction_rule_cap),
            instantiated: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
        }
    }

    pub fn target(&self) -> RelationId {
        self.target
    }

    // -- templates ----------------------------------------------------------

    /// Count one sighting of `template`, assigning a handle the first time.
    pub fn record_template(&self, template: Template) -> Sighting {
        self.record_sightings(template, 1)
    }

    /// Count `count` sightings of `template` at once.
    pub fn record_sightings(&self, template: Template, count: u64) -> Sighting {
        let mut arena = self.arena.write().expect("template arena lock poisoned");
        let existing = arena.handles.get(&template).copied();
        if let Some(handle) = existing {
            arena.frequencies[handle.0] += count;
            return Sighting {
                handle,
                first: false,
            };
        }
        let handle = TemplateHandle(arena.templates.len());
        let template = Arc::new(template);
        arena.templates.push(Arc::clone(&template));
        arena.frequencies.push(count);
        arena.handles.insert(template, handle);
        Sighting {
            handle,
            first: true,
        }
    }

    pub fn contains_template(&self, template: &Template) -> bool {
        self.arena
            .read()
            .expect("template arena lock poisoned")
            .handles
            .contains_key(template)
    }

    pub fn handle_of(&self, template: &Template) -> Option<TemplateHandle> {
        self.arena
            .read()
            .expect("template arena lock poisoned")
            .handles
            .get(template)
            .copied()
    }

    /// The template behind `handle`. A miss means the arena is corrupt.
    pub fn template(&self, handle: TemplateHandle) -> RuleResult<Arc<Template>> {
        self.arena
            .read()
            .expect("template arena lock poisoned")
            .templates
            .get(handle.0)
            .cloned()
            .ok_or(RuleError::MissingHandle { handle: handle.0 })
    }

    pub fn frequency(&self, handle: TemplateHandle) -> RuleResult<u64> {
        self.arena
            .read()
            .expect("template arena lock poisoned")
            .frequencies
            .get(handle.0)
            .copied()
            .ok_or(RuleError::MissingHandle { handle: handle.0 })
    }

    pub fn template_count(&self) -> usize {
        self.arena
            .read()
            .expect("template arena lock poisoned")
            .templates
            .len()
    }

    /// Handles in specialization order: closed templates by descending
    /// frequency, then open templates by ascending length and descending
    /// frequency. Equal keys fall back to handle order.
    pub fn sorted_templates(&self) -> Vec<TemplateHandle> {
        let arena = self.arena.read().expect("template arena lock poisoned");
        let mut handles: Vec<TemplateHandle> =
            (0..arena.templates.len()).map(TemplateHandle).collect();
        handles.sort_by_key(|h| {
            let t = &arena.templates[h.0];
            let group = if t.closed { (0, 0) } else { (1, t.len()) };
            (group, Reverse(arena.frequencies[h.0]), *h)
        });
        handles
    }

    pub fn composition(&self) -> Composition {
        let arena = self.arena.read().expect("template arena lock poisoned");
        Composition::of(arena.templates.iter().map(|t| t.as_ref()))
    }

    // -- specialization -----------------------------------------------------

    /// Note that `handle` produced at least one surviving rule.
    pub fn mark_specialized(&self, handle: TemplateHandle) {
        self.specialized
            .lock()
            .expect("specialized list lock poisoned")
            .push(handle);
    }

    pub fn specialized(&self) -> Vec<TemplateHandle> {
        let mut handles = self
            .specialized
            .lock()
            .expect("specialized list lock poisoned")
            .clone();
        handles.sort();
        handles
    }

    pub fn specialized_composition(&self) -> RuleResult<Composition> {
        let templates = self
            .specialized()
            .into_iter()
            .map(|h| self.template(h))
            .collect::<RuleResult<Vec<_>>>()?;
        Ok(Composition::of(templates.iter().map(|t| t.as_ref())))
    }

    /// Count one scored instance; returns the new total.
    pub fn record_instantiated(&self) -> usize {
        self.instantiated.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn instantiated(&self) -> usize {
        self.instantiated.load(Ordering::Relaxed)
    }

    // -- application --------------------------------------------------------

    pub fn record_applied(&self) -> usize {
        self.applied.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn predictions(&self) -> &PredictionMap {
        &self.predictions
    }

    /// Consume the context, keeping only the prediction map.
    pub fn into_predictions(self) -> HashMap<Pair, Vec<ScoredRule>> {
        self.predictions.into_inner()
    }
}
