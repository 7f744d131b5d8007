//! Path rules: templates and their anchored instances.
//!
//! A rule predicts `target(X, Y)` from a directed path of body atoms. The head
//! variables are `X` (subject) and `Y` (object); intermediate path nodes are
//! `V1..Vn`. A [`Template`] is the abstract path shape found by generalization;
//! a [`Rule`] pairs a shared template with a [`RuleKind`] tag and statistics.
//!
//! ```text
//! CAR  r(X,Y) <- p(X,V1), q(V1,Y)          closed template
//! OAR  r(X,Y) <- p(X,V1)                   open template
//! HAR  r(X,paris) <- p(X,V1)               head-anchored instance
//! BAR  r(X,paris) <- p(X,france)           both-anchored instance
//! ```

pub mod stats;

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{RuleError, RuleResult};
use crate::graph::traverse::LocalPath;
use crate::graph::{Direction, Pair};
use crate::symbol::{EntityId, RelationId, SymbolTable};

pub use stats::{Metrics, OverfittingCheck, QualityGate, QualityMeasure, RuleStats, StatsParams};

static RE_HEAD_ATOM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\(([^,()]+),([^,()]+)\)$").unwrap());
static RE_BODY_ATOM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\(([^,()]+),([^,()]+),([01])\)$").unwrap());

/// One step of a rule body: a relation walked in a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BodyAtom {
    pub relation: RelationId,
    pub direction: Direction,
}

/// An abstract path pattern for a target relation.
///
/// Equality and hashing are structural, which coincides with equality of the
/// rendered rule strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Template {
    pub head: RelationId,
    pub body: Vec<BodyAtom>,
    /// The path ends on the other head variable.
    pub closed: bool,
    /// The path starts at the head subject `X` (otherwise at `Y`).
    pub from_subject: bool,
}

/// Terms of one atom in walking order.
struct Terms {
    subject: String,
    object: String,
}

impl Template {
    /// Abstract a sampled path around a known `pair` of `target`.
    ///
    /// Returns `None` for an empty path.
    pub fn from_path(path: &LocalPath, pair: Pair, target: RelationId) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        let from_subject = path.start() == pair.sub;
        let closed = path.end() == pair.sub || path.end() == pair.obj;
        let body = path
            .steps()
            .iter()
            .map(|&(relation, direction)| BodyAtom {
                relation,
                direction,
            })
            .collect();
        Some(Self {
            head: target,
            body,
            closed,
            from_subject,
        })
    }

    /// Number of body atoms.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn tag(&self) -> &'static str {
        if self.closed { "CAR" } else { "OAR" }
    }

    /// Head terms and body terms, with optional anchor and tail constants.
    fn terms(&self, anchor: Option<&str>, tail: Option<&str>) -> (String, String, Vec<Terms>) {
        let start = if self.from_subject { "X" } else { "Y" };
        let end = if self.from_subject { "Y" } else { "X" };
        let last = self.body.len().saturating_sub(1);

        let body = (0..self.body.len())
            .map(|i| {
                let subject = if i == 0 {
                    start.to_string()
                } else {
                    format!("V{i}")
                };
                let object = if i == last {
                    match (self.closed, tail) {
                        (true, _) => end.to_string(),
                        (false, Some(tail)) => tail.to_string(),
                        (false, None) => format!("V{}", i + 1),
                    }
                } else {
                    format!("V{}", i + 1)
                };
                Terms { subject, object }
            })
            .collect();

        let (head_subject, head_object) = match (anchor, self.from_subject) {
            (Some(anchor), true) => ("X".to_string(), anchor.to_string()),
            (Some(anchor), false) => (anchor.to_string(), "Y".to_string()),
            (None, _) => ("X".to_string(), "Y".to_string()),
        };
        (head_subject, head_object, body)
    }

    fn render_with(
        &self,
        symbols: &SymbolTable,
        anchor: Option<&str>,
        tail: Option<&str>,
        indexed: bool,
    ) -> String {
        let (hs, ho, terms) = self.terms(anchor, tail);
        let atoms = self
            .body
            .iter()
            .zip(terms)
            .map(|(atom, t)| {
                let name = symbols.relation_label(atom.relation);
                let (first, second) = match atom.direction {
                    Direction::Outgoing => (t.subject, t.object),
                    Direction::Incoming => (t.object, t.subject),
                };
                if indexed {
                    format!("{name}({first},{second},{})", atom.direction.flag())
                } else {
                    format!("{name}({first},{second})")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({hs},{ho}) <- {atoms}", symbols.relation_label(self.head))
    }

    /// Human-readable form, e.g. `r(X,Y) <- p(X,V1), q(Y,V1)`.
    pub fn render(&self, symbols: &SymbolTable) -> String {
        self.render_with(symbols, None, None, false)
    }

    /// Index-file form with explicit direction flags, e.g. `r(X,Y) <- p(X,V1,0)`.
    pub fn index_string(&self, symbols: &SymbolTable) -> String {
        self.render_with(symbols, None, None, true)
    }

    /// Parse the index-file form produced by [`index_string`](Self::index_string).
    pub fn parse_index(tag: &str, text: &str, symbols: &SymbolTable) -> RuleResult<Self> {
        let closed = match tag {
            "CAR" => true,
            "OAR" => false,
            other => {
                return Err(RuleError::Parse {
                    message: format!("unknown template tag `{other}`"),
                });
            }
        };
        let (head_text, body_text) = text.split_once(" <- ").ok_or_else(|| RuleError::Parse {
            message: format!("missing ` <- ` in `{text}`"),
        })?;

        let head_caps = RE_HEAD_ATOM
            .captures(head_text)
            .ok_or_else(|| RuleError::Parse {
                message: format!("malformed head atom `{head_text}`"),
            })?;
        let head = lookup_relation(&head_caps[1], symbols)?;

        let mut body = Vec::new();
        let mut first_subject = None;
        for atom_text in body_text.split(", ") {
            let caps = RE_BODY_ATOM
                .captures(atom_text)
                .ok_or_else(|| RuleError::Parse {
                    message: format!("malformed body atom `{atom_text}`"),
                })?;
            let relation = lookup_relation(&caps[1], symbols)?;
            let direction = Direction::from_flag(&caps[4]).ok_or_else(|| RuleError::Parse {
                message: format!("bad direction flag in `{atom_text}`"),
            })?;
            if first_subject.is_none() {
                let walk_subject = match direction {
                    Direction::Outgoing => &caps[2],
                    Direction::Incoming => &caps[3],
                };
                first_subject = Some(walk_subject.to_string());
            }
            body.push(BodyAtom {
                relation,
                direction,
            });
        }
        if body.is_empty() {
            return Err(RuleError::EmptyBody);
        }

        Ok(Self {
            head,
            body,
            closed,
            from_subject: first_subject.as_deref() == Some("X"),
        })
    }
}

fn lookup_relation(name: &str, symbols: &SymbolTable) -> RuleResult<RelationId> {
    symbols.relation(name).ok_or_else(|| RuleError::Parse {
        message: format!("unknown relation `{name}`"),
    })
}

/// An instance read back from a rule index: anchor ids and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompactInstance {
    pub anchor: EntityId,
    pub tail: Option<EntityId>,
}

/// Which rule a [`Rule`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    ClosedTemplate,
    OpenTemplate,
    HeadAnchored { anchor: EntityId },
    BothAnchored { anchor: EntityId, tail: EntityId },
    Compact(CompactInstance),
}

/// A scorable rule: a shared template, a kind, and statistics.
#[derive(Debug, Clone)]
pub struct Rule {
    pub template: Arc<Template>,
    pub kind: RuleKind,
    pub stats: RuleStats,
}

impl Rule {
    /// The template itself as a rule.
    pub fn from_template(template: Arc<Template>) -> Self {
        let kind = if template.closed {
            RuleKind::ClosedTemplate
        } else {
            RuleKind::OpenTemplate
        };
        Self {
            template,
            kind,
            stats: RuleStats::default(),
        }
    }

    pub fn head_anchored(template: Arc<Template>, anchor: EntityId) -> Self {
        Self {
            template,
            kind: RuleKind::HeadAnchored { anchor },
            stats: RuleStats::default(),
        }
    }

    pub fn both_anchored(template: Arc<Template>, anchor: EntityId, tail: EntityId) -> Self {
        Self {
            template,
            kind: RuleKind::BothAnchored { anchor, tail },
            stats: RuleStats::default(),
        }
    }

    pub fn compact(template: Arc<Template>, instance: CompactInstance, metrics: Metrics) -> Self {
        Self {
            template,
            kind: RuleKind::Compact(instance),
            stats: RuleStats::from_metrics(metrics),
        }
    }

    pub fn len(&self) -> usize {
        self.template.len()
    }

    pub fn is_empty(&self) -> bool {
        self.template.is_empty()
    }

    pub fn closed(&self) -> bool {
        self.template.closed
    }

    pub fn from_subject(&self) -> bool {
        self.template.from_subject
    }

    /// The bound head entity, for instances.
    pub fn anchor(&self) -> Option<EntityId> {
        match self.kind {
            RuleKind::HeadAnchored { anchor } | RuleKind::BothAnchored { anchor, .. } => {
                Some(anchor)
            }
            RuleKind::Compact(c) => Some(c.anchor),
            RuleKind::ClosedTemplate | RuleKind::OpenTemplate => None,
        }
    }

    /// The bound path terminus, for both-anchored instances.
    pub fn tail(&self) -> Option<EntityId> {
        match self.kind {
            RuleKind::BothAnchored { tail, .. } => Some(tail),
            RuleKind::Compact(c) => c.tail,
            _ => None,
        }
    }

    /// Index-file instance code: 0 head-anchored, 2 both-anchored.
    pub fn instance_code(&self) -> Option<u8> {
        match (self.anchor(), self.tail()) {
            (Some(_), Some(_)) => Some(2),
            (Some(_), None) => Some(0),
            _ => None,
        }
    }

    /// Complexity adjustment used by the overfitting sigmoid.
    pub fn type_adjustment(&self) -> u8 {
        u8::from(self.tail().is_some())
    }

    pub fn tag(&self) -> &'static str {
        match self.instance_code() {
            Some(2) => "BAR",
            Some(_) => "HAR",
            None => self.template.tag(),
        }
    }

    pub fn quality(&self, measure: QualityMeasure) -> f64 {
        self.stats.quality(measure)
    }

    /// Whether this rule should be kept out of application.
    pub fn overfits(&self, check: &OverfittingCheck) -> bool {
        self.stats
            .metrics()
            .is_some_and(|m| check.overfits(m, self.len(), self.type_adjustment()))
    }

    /// Tagged human-readable form, e.g. `HAR\tr(X,paris) <- p(X,V1)`.
    pub fn render(&self, symbols: &SymbolTable) -> String {
        let anchor = self.anchor().map(|a| symbols.entity_label(a).into_owned());
        let tail = self.tail().map(|t| symbols.entity_label(t).into_owned());
        format!(
            "{}\t{}",
            self.tag(),
            self.template
                .render_with(symbols, anchor.as_deref(), tail.as_deref(), false)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> SymbolTable {
        let mut s = SymbolTable::new();
        s.intern_relation("r");
        s.intern_relation("p");
        s.intern_relation("q");
        s.intern_entity("a");
        s.intern_entity("b");
        s.intern_entity("paris");
        s
    }

    fn atom(symbols: &SymbolTable, name: &str, direction: Direction) -> BodyAtom {
        BodyAtom {
            relation: symbols.relation(name).unwrap(),
            direction,
        }
    }

    fn closed_template(s: &SymbolTable) -> Template {
        Template {
            head: s.relation("r").unwrap(),
            body: vec![
                atom(s, "p", Direction::Outgoing),
                atom(s, "q", Direction::Incoming),
            ],
            closed: true,
            from_subject: true,
        }
    }

    #[test]
    fn renders_closed_template() {
        let s = symbols();
        let t = closed_template(&s);
        assert_eq!(t.render(&s), "r(X,Y) <- p(X,V1), q(Y,V1)");
        assert_eq!(t.index_string(&s), "r(X,Y) <- p(X,V1,0), q(Y,V1,1)");
        assert_eq!(t.tag(), "CAR");
    }

    #[test]
    fn renders_open_template_from_object_side() {
        let s = symbols();
        let t = Template {
            head: s.relation("r").unwrap(),
            body: vec![atom(&s, "p", Direction::Outgoing)],
            closed: false,
            from_subject: false,
        };
        assert_eq!(t.render(&s), "r(X,Y) <- p(Y,V1)");
    }

    #[test]
    fn renders_instances() {
        let s = symbols();
        let t = Arc::new(Template {
            head: s.relation("r").unwrap(),
            body: vec![atom(&s, "p", Direction::Outgoing)],
            closed: false,
            from_subject: true,
        });
        let paris = s.entity("paris").unwrap();
        let b = s.entity("b").unwrap();

        let har = Rule::head_anchored(t.clone(), paris);
        assert_eq!(har.render(&s), "HAR\tr(X,paris) <- p(X,V1)");
        assert_eq!(har.instance_code(), Some(0));

        let bar = Rule::both_anchored(t, paris, b);
        assert_eq!(bar.render(&s), "BAR\tr(X,paris) <- p(X,b)");
        assert_eq!(bar.type_adjustment(), 1);
    }

    #[test]
    fn index_string_parses_back() {
        let s = symbols();
        let t = closed_template(&s);
        let parsed = Template::parse_index("CAR", &t.index_string(&s), &s).unwrap();
        assert_eq!(parsed, t);

        let open = Template {
            head: s.relation("r").unwrap(),
            body: vec![atom(&s, "q", Direction::Incoming), atom(&s, "p", Direction::Outgoing)],
            closed: false,
            from_subject: false,
        };
        let parsed = Template::parse_index("OAR", &open.index_string(&s), &s).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn parse_rejects_bad_input() {
        let s = symbols();
        assert!(Template::parse_index("XAR", "r(X,Y) <- p(X,Y,0)", &s).is_err());
        assert!(Template::parse_index("CAR", "r(X,Y) p(X,Y,0)", &s).is_err());
        assert!(Template::parse_index("CAR", "r(X,Y) <- nope(X,Y,0)", &s).is_err());
        assert!(Template::parse_index("CAR", "r(X,Y) <- p(X,Y,7)", &s).is_err());
    }

    #[test]
    fn abstraction_from_path() {
        let s = symbols();
        let a = s.entity("a").unwrap();
        let b = s.entity("b").unwrap();
        let c = EntityId::new(9);
        let p = s.relation("p").unwrap();
        let q = s.relation("q").unwrap();
        let r = s.relation("r").unwrap();

        let path = LocalPath::from_edge(a, p, Direction::Outgoing, c).extend(crate::graph::Step {
            relation: q,
            direction: Direction::Incoming,
            node: b,
        });
        let t = Template::from_path(&path, Pair::new(a, b), r).unwrap();
        assert!(t.closed);
        assert!(t.from_subject);
        assert_eq!(t, closed_template(&s));

        let open = Template::from_path(&LocalPath::from_edge(b, p, Direction::Outgoing, c), Pair::new(a, b), r)
            .unwrap();
        assert!(!open.closed);
        assert!(!open.from_subject);
    }

    #[test]
    fn rule_kinds() {
        let s = symbols();
        let t = Arc::new(closed_template(&s));
        let rule = Rule::from_template(t.clone());
        assert_eq!(rule.kind, RuleKind::ClosedTemplate);
        assert_eq!(rule.anchor(), None);
        assert_eq!(rule.tag(), "CAR");

        let compact = Rule::compact(
            t,
            CompactInstance {
                anchor: EntityId::new(1),
                tail: None,
            },
            Metrics {
                smoothed_conf: 0.4,
                ..Default::default()
            },
        );
        assert_eq!(compact.tag(), "HAR");
        assert_eq!(compact.quality(QualityMeasure::SmoothedConf), 0.4);
    }
}
