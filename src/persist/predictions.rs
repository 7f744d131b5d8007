//! Prediction and verification files.
//!
//! A prediction file is a sequence of query blocks:
//!
//! ```text
//! Tail Query: (3|alice, spouse, 7|bob)
//! (3|alice, spouse, 7|bob)\t0.8
//! (3|alice, spouse, 9|carol)\t0.4
//!
//! ```
//!
//! A tail query fixes the subject and ranks objects; a head query fixes the
//! object and ranks subjects. Each answer is the full candidate fact and the
//! quality of its best supporting rule.

use std::path::Path;

use tracing::warn;

use crate::error::PersistResult;
use crate::graph::Pair;
use crate::symbol::{EntityId, RelationId, SymbolTable};

use super::{format_number, read_to_string};

/// Which endpoint of a test fact a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryDirection {
    /// Object fixed, subject sought.
    Head,
    /// Subject fixed, object sought.
    Tail,
}

impl QueryDirection {
    pub fn label(self) -> &'static str {
        match self {
            QueryDirection::Head => "Head Query: ",
            QueryDirection::Tail => "Tail Query: ",
        }
    }

    /// The endpoint a candidate of this query is ranked by.
    pub fn sought(self, pair: &Pair) -> EntityId {
        match self {
            QueryDirection::Head => pair.sub,
            QueryDirection::Tail => pair.obj,
        }
    }

    /// The endpoint this query keeps fixed.
    pub fn fixed(self, pair: &Pair) -> EntityId {
        match self {
            QueryDirection::Head => pair.obj,
            QueryDirection::Tail => pair.sub,
        }
    }
}

/// `(<id>|<name>, <target>, <id>|<name>)`
pub fn query_string(symbols: &SymbolTable, target: RelationId, pair: &Pair) -> String {
    format!(
        "({}|{}, {}, {}|{})",
        pair.sub,
        symbols.entity_label(pair.sub),
        symbols.relation_label(target),
        pair.obj,
        symbols.entity_label(pair.obj)
    )
}

/// `<subject>\t<target>\t<object>`
pub fn verification_string(symbols: &SymbolTable, target: RelationId, pair: &Pair) -> String {
    format!(
        "{}\t{}\t{}",
        symbols.entity_label(pair.sub),
        symbols.relation_label(target),
        symbols.entity_label(pair.obj)
    )
}

/// One prediction block, newline-terminated and followed by a blank line.
pub fn format_prediction_block<'a>(
    direction: QueryDirection,
    query: &str,
    answers: impl IntoIterator<Item = (&'a str, f64)>,
) -> String {
    let mut out = format!("{}{query}\n", direction.label());
    for (answer, score) in answers {
        out.push_str(answer);
        out.push('\t');
        out.push_str(&format_number(score));
        out.push('\n');
    }
    out.push('\n');
    out
}

/// An answer in the verification file with the rules behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainedAnswer {
    /// One-based position among the ranked answers.
    pub position: usize,
    pub fact: String,
    /// Rendered rule and its quality, best first.
    pub rules: Vec<(String, f64)>,
}

impl ExplainedAnswer {
    fn write_to(&self, heading: &str, out: &mut String) {
        out.push_str(&format!("{heading}: {}\t{}\n", self.position, self.fact));
        for (rule, quality) in &self.rules {
            out.push_str(&format!("{rule}\t{}\n", format_number(*quality)));
        }
        out.push('\n');
    }
}

/// One verification block.
///
/// `answered` is false when the query had no candidates at all; the block is
/// then just its header and a blank line.
pub fn format_verification_block(
    direction: QueryDirection,
    test_fact: &str,
    answered: bool,
    top: &[ExplainedAnswer],
    correct: Option<&ExplainedAnswer>,
) -> String {
    let mut out = format!("{}{test_fact}\n", direction.label());
    if !answered {
        out.push('\n');
        return out;
    }
    for answer in top {
        answer.write_to("Top Answer", &mut out);
    }
    match correct {
        Some(answer) => answer.write_to("Correct Answer", &mut out),
        None => out.push_str("No Correct Answer\n\n"),
    }
    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A ranked answer read back from a prediction file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedAnswer {
    pub pair: Pair,
    pub score: f64,
}

/// A query block read back from a prediction file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub direction: QueryDirection,
    pub relation: String,
    pub pair: Pair,
    pub answers: Vec<ParsedAnswer>,
}

/// All query blocks of a prediction file.
#[derive(Debug, Default)]
pub struct PredictionFile {
    pub queries: Vec<ParsedQuery>,
    pub skipped: usize,
}

/// Parse `(<id>|<name>, <relation>, <id>|<name>)` into ids and the relation.
fn parse_fact(text: &str) -> Option<(Pair, String)> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (subject, rest) = inner.split_once(", ")?;
    let (relation, object) = rest.rsplit_once(", ")?;
    let id = |field: &str| -> Option<EntityId> {
        let (raw, _) = field.split_once('|')?;
        raw.parse::<u32>().ok().map(EntityId::new)
    };
    Some((Pair::new(id(subject)?, id(object)?), relation.to_string()))
}

fn parse_answer(line: &str) -> Option<ParsedAnswer> {
    let (fact, score) = line.rsplit_once('\t')?;
    let (pair, _) = parse_fact(fact)?;
    Some(ParsedAnswer {
        pair,
        score: score.parse().ok()?,
    })
}

/// Read every query block of a prediction file. Malformed headers drop
/// their whole block; malformed answers drop only that line.
pub fn read_prediction_file(path: &Path) -> PersistResult<PredictionFile> {
    let text = read_to_string(path)?;
    let origin = path.display().to_string();
    let mut file = PredictionFile::default();
    let mut current: Option<ParsedQuery> = None;
    let mut in_bad_block = false;

    for (number, line) in text.lines().enumerate() {
        if line.is_empty() {
            if let Some(query) = current.take() {
                file.queries.push(query);
            }
            in_bad_block = false;
            continue;
        }

        let header = [QueryDirection::Head, QueryDirection::Tail]
            .into_iter()
            .find_map(|d| line.strip_prefix(d.label()).map(|rest| (d, rest)));
        if let Some((direction, rest)) = header {
            if let Some(query) = current.take() {
                file.queries.push(query);
            }
            match parse_fact(rest) {
                Some((pair, relation)) => {
                    current = Some(ParsedQuery {
                        direction,
                        relation,
                        pair,
                        answers: Vec::new(),
                    });
                    in_bad_block = false;
                }
                None => {
                    warn!(file = %origin, line = number + 1, "skipping malformed query header");
                    file.skipped += 1;
                    in_bad_block = true;
                }
            }
            continue;
        }

        if in_bad_block {
            continue;
        }
        match (current.as_mut(), parse_answer(line)) {
            (Some(query), Some(answer)) => query.answers.push(answer),
            _ => {
                warn!(file = %origin, line = number + 1, "skipping malformed answer line");
                file.skipped += 1;
            }
        }
    }
    if let Some(query) = current.take() {
        file.queries.push(query);
    }
    Ok(file)
}
