//! Loading split files into a graph.
//!
//! Each split file holds one `subject<TAB>relation<TAB>object` fact per line.
//! The graph is the union of all three splits; the validation and test facts
//! of a target are hidden with an [`EdgeHoldout`](super::EdgeHoldout) while
//! rules for that target are learned.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::error::{GpflResult, GraphError, PersistError};
use crate::symbol::{EntityId, RelationId, SymbolTable};

use super::{KnowledgeGraph, Pair, Triple};

/// Share of single-object subjects above which a relation counts as functional.
const FUNCTIONAL_RATIO: f64 = 0.9;

/// The three fact splits, as read.
#[derive(Debug, Default, Clone)]
pub struct Splits {
    pub train: Vec<Triple>,
    pub valid: Vec<Triple>,
    pub test: Vec<Triple>,
}

impl Splits {
    /// Distinct relations occurring in the test split, in id order.
    pub fn test_relations(&self) -> Vec<RelationId> {
        self.test
            .iter()
            .map(|t| t.relation)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Known pairs of one target relation, per split.
    pub fn examples(&self, target: RelationId) -> TargetExamples {
        let of = |facts: &[Triple]| -> HashSet<Pair> {
            facts
                .iter()
                .filter(|t| t.relation == target)
                .map(Triple::pair)
                .collect()
        };
        TargetExamples {
            target,
            train: of(&self.train),
            valid: of(&self.valid),
            test: of(&self.test),
        }
    }
}

/// Known pairs of a single target relation.
#[derive(Debug, Clone)]
pub struct TargetExamples {
    pub target: RelationId,
    pub train: HashSet<Pair>,
    pub valid: HashSet<Pair>,
    pub test: HashSet<Pair>,
}

impl TargetExamples {
    /// Whether at least 90% of training subjects have exactly one object.
    pub fn is_functional(&self) -> bool {
        let mut objects: HashMap<EntityId, HashSet<EntityId>> = HashMap::new();
        for pair in &self.train {
            objects.entry(pair.sub).or_default().insert(pair.obj);
        }
        if objects.is_empty() {
            return false;
        }
        let single = objects.values().filter(|objs| objs.len() == 1).count();
        single as f64 / objects.len() as f64 >= FUNCTIONAL_RATIO
    }

    /// Whether the pair is a known fact in any split.
    pub fn is_known(&self, pair: &Pair) -> bool {
        self.train.contains(pair) || self.valid.contains(pair) || self.test.contains(pair)
    }

    /// Validation and test facts, the ones hidden while learning.
    pub fn held_out_facts(&self) -> Vec<Triple> {
        self.valid
            .iter()
            .chain(self.test.iter())
            .map(|p| Triple::new(p.sub, self.target, p.obj))
            .collect()
    }
}

/// Everything loaded from the split files.
#[derive(Debug)]
pub struct Dataset {
    pub symbols: SymbolTable,
    pub graph: KnowledgeGraph,
    pub splits: Splits,
}

/// Read the three split files and build the graph from their union.
pub fn load_dataset(train: &Path, valid: &Path, test: &Path) -> GpflResult<Dataset> {
    let mut symbols = SymbolTable::new();
    let splits = Splits {
        train: read_triples(train, &mut symbols)?,
        valid: read_triples(valid, &mut symbols)?,
        test: read_triples(test, &mut symbols)?,
    };

    let graph = KnowledgeGraph::new();
    for triple in splits
        .train
        .iter()
        .chain(splits.valid.iter())
        .chain(splits.test.iter())
    {
        graph.insert(triple);
    }

    tracing::info!(
        entities = symbols.entity_count(),
        relations = symbols.relation_count(),
        edges = graph.edge_count(),
        train = splits.train.len(),
        valid = splits.valid.len(),
        test = splits.test.len(),
        "loaded dataset"
    );

    Ok(Dataset {
        symbols,
        graph,
        splits,
    })
}

/// Read one split file, interning every name.
pub fn read_triples(path: &Path, symbols: &mut SymbolTable) -> GpflResult<Vec<Triple>> {
    let content = std::fs::read_to_string(path).map_err(|e| PersistError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_triples(&content, &path.display().to_string(), symbols)
}

fn parse_triples(content: &str, origin: &str, symbols: &mut SymbolTable) -> GpflResult<Vec<Triple>> {
    let mut triples = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            return Err(GraphError::MalformedTriple {
                path: origin.to_string(),
                line: number + 1,
                message: format!("expected 3 tab-separated fields, found {}", fields.len()),
            }
            .into());
        }
        let subject = symbols.intern_entity(fields[0]);
        let relation = symbols.intern_relation(fields[1]);
        let object = symbols.intern_entity(fields[2]);
        triples.push(Triple::new(subject, relation, object));
    }
    Ok(triples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpflError;

    #[test]
    fn parses_tab_separated_facts() {
        let mut symbols = SymbolTable::new();
        let triples =
            parse_triples("a\tknows\tb\n\nb\tknows\tc\r\n", "mem", &mut symbols).unwrap();
        assert_eq!(triples.len(), 2);
        assert_eq!(symbols.entity_count(), 3);
        assert_eq!(symbols.relation_count(), 1);
    }

    #[test]
    fn malformed_line_is_fatal() {
        let mut symbols = SymbolTable::new();
        let err = parse_triples("a\tknows\n", "mem", &mut symbols).unwrap_err();
        assert!(matches!(
            err,
            GpflError::Graph(GraphError::MalformedTriple { line: 1, .. })
        ));
    }

    #[test]
    fn functional_detection() {
        let mut symbols = SymbolTable::new();
        let facts = parse_triples(
            "a\tborn_in\tx\nb\tborn_in\tx\nc\tborn_in\ty\n",
            "mem",
            &mut symbols,
        )
        .unwrap();
        let splits = Splits {
            train: facts,
            ..Default::default()
        };
        let target = symbols.relation("born_in").unwrap();
        assert!(splits.examples(target).is_functional());

        let facts = parse_triples("a\tlikes\tx\na\tlikes\ty\n", "mem", &mut symbols).unwrap();
        let splits = Splits {
            train: facts,
            ..Default::default()
        };
        let target = symbols.relation("likes").unwrap();
        assert!(!splits.examples(target).is_functional());
    }

    #[test]
    fn examples_split_by_target() {
        let mut symbols = SymbolTable::new();
        let train = parse_triples("a\tr\tb\na\ts\tb\n", "mem", &mut symbols).unwrap();
        let test = parse_triples("c\tr\td\n", "mem", &mut symbols).unwrap();
        let splits = Splits {
            train,
            valid: vec![],
            test,
        };
        let r = symbols.relation("r").unwrap();
        let examples = splits.examples(r);
        assert_eq!(examples.train.len(), 1);
        assert_eq!(examples.test.len(), 1);
        assert_eq!(examples.held_out_facts().len(), 1);
        assert_eq!(splits.test_relations(), vec![r]);
    }
}
