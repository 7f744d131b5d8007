//! The per-target rule index.
//!
//! ```text
//! ABS: 0\tCAR\tr(X,Y) <- p(X,Y,0)\t0.5\t0.3\t0.5\t0.3\t0.2\t0.1
//! ABS: 3\tOAR\tr(X,Y) <- p(X,V1,0)\t...
//! 0,17,0.5,0.3,0.5,0.3,0.2,0.1\t2,17,42,0.6,...
//! ```
//!
//! Every `ABS:` line carries a template handle, its tag, its index string and
//! six metrics (standard, smoothed, PCA, APCA confidence, head coverage,
//! validation precision). An open template is followed by one line of
//! tab-separated instance records: `0,<anchor>,<metrics>` for head-anchored
//! and `2,<anchor>,<tail>,<metrics>` for both-anchored instances.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::context::TemplateHandle;
use crate::error::PersistResult;
use crate::rule::{CompactInstance, Metrics, OverfittingCheck, Rule, RuleStats, Template};
use crate::symbol::{EntityId, RelationId, SymbolTable};

use super::{create, flush, format_number, read_to_string, write_str};

const ABS_PREFIX: &str = "ABS: ";

/// One scored instance of an open template.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub anchor: EntityId,
    pub tail: Option<EntityId>,
    pub metrics: Metrics,
}

/// One template block of the index.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub handle: TemplateHandle,
    pub template: Arc<Template>,
    pub metrics: Metrics,
    /// Empty for closed templates.
    pub instances: Vec<InstanceRecord>,
}

fn join_metrics(metrics: &Metrics, separator: &str) -> String {
    metrics
        .as_array()
        .iter()
        .map(|&m| format_number(m))
        .collect::<Vec<_>>()
        .join(separator)
}

impl IndexRecord {
    /// The record's lines, newline-terminated.
    pub fn to_lines(&self, symbols: &SymbolTable) -> String {
        let mut out = format!(
            "{ABS_PREFIX}{}\t{}\t{}\t{}\n",
            self.handle,
            self.template.tag(),
            self.template.index_string(symbols),
            join_metrics(&self.metrics, "\t")
        );
        if !self.template.closed {
            let instances: Vec<String> = self
                .instances
                .iter()
                .map(|inst| match inst.tail {
                    Some(tail) => format!(
                        "2,{},{},{}",
                        inst.anchor,
                        tail,
                        join_metrics(&inst.metrics, ",")
                    ),
                    None => format!("0,{},{}", inst.anchor, join_metrics(&inst.metrics, ",")),
                })
                .collect();
            out.push_str(&instances.join("\t"));
            out.push('\n');
        }
        out
    }
}

/// Streams index records to a file.
pub struct RuleIndexWriter<W: Write> {
    out: W,
    path: std::path::PathBuf,
    records: usize,
}

impl RuleIndexWriter<std::io::BufWriter<std::fs::File>> {
    pub fn create(path: &Path) -> PersistResult<Self> {
        Ok(Self {
            out: create(path)?,
            path: path.to_path_buf(),
            records: 0,
        })
    }
}

impl<W: Write> RuleIndexWriter<W> {
    pub fn write(&mut self, record: &IndexRecord, symbols: &SymbolTable) -> PersistResult<()> {
        write_str(&mut self.out, &record.to_lines(symbols), &self.path)?;
        self.records += 1;
        Ok(())
    }

    /// Flush and return the number of records written.
    pub fn finish(mut self) -> PersistResult<usize> {
        flush(&mut self.out, &self.path)?;
        Ok(self.records)
    }
}

/// Split index text into record blocks keyed by handle. Lines that belong to
/// no block are skipped and counted.
fn blocks<'t>(text: &'t str, origin: &str) -> (Vec<(usize, Vec<&'t str>)>, usize) {
    let mut out: Vec<(usize, Vec<&'t str>)> = Vec::new();
    let mut skipped = 0;
    let mut lines = text.lines().enumerate().peekable();

    while let Some((number, line)) = lines.next() {
        if line.is_empty() {
            continue;
        }
        let Some(rest) = line.strip_prefix(ABS_PREFIX) else {
            warn!(file = origin, line = number + 1, "skipping line outside a template block");
            skipped += 1;
            continue;
        };
        let mut fields = rest.split('\t');
        let handle = fields.next().and_then(|h| h.parse::<usize>().ok());
        let tag = fields.next();
        let Some(handle) = handle else {
            warn!(file = origin, line = number + 1, "skipping template with a bad handle");
            skipped += 1;
            continue;
        };

        let mut block = vec![line];
        if tag == Some("OAR") {
            match lines.peek() {
                Some(&(_, next)) if !next.starts_with(ABS_PREFIX) => {
                    block.push(next);
                    lines.next();
                }
                _ => {
                    warn!(
                        file = origin,
                        line = number + 1,
                        "skipping open template without an instance line"
                    );
                    skipped += 1;
                    continue;
                }
            }
        }
        out.push((handle, block));
    }
    (out, skipped)
}

/// Rewrite an index file with its blocks ordered by template handle.
pub fn order_by_handle(path: &Path) -> PersistResult<usize> {
    let text = read_to_string(path)?;
    let origin = path.display().to_string();
    let (mut records, _) = blocks(&text, &origin);
    records.sort_by_key(|(handle, _)| *handle);

    let mut out = create(path)?;
    for (_, lines) in &records {
        for line in lines {
            write_str(&mut out, line, path)?;
            write_str(&mut out, "\n", path)?;
        }
    }
    flush(&mut out, path)?;
    Ok(records.len())
}

/// Rules read back from an index file.
#[derive(Debug, Default)]
pub struct LoadedRules {
    pub rules: Vec<Rule>,
    /// Malformed lines or records that were skipped.
    pub skipped: usize,
    /// Well-formed rules dropped by the overfitting check.
    pub overfitting: usize,
}

fn parse_metrics<'a>(fields: impl Iterator<Item = &'a str>) -> Option<Metrics> {
    let values: Vec<f64> = fields.map(|f| f.parse::<f64>().ok()).collect::<Option<_>>()?;
    let array: [f64; 6] = values.try_into().ok()?;
    Some(Metrics::from_array(array))
}

fn parse_entity(field: &str, symbols: &SymbolTable) -> Option<EntityId> {
    let raw = field.parse::<u32>().ok()?;
    let id = EntityId::new(raw);
    symbols.entity_name(id).map(|_| id)
}

fn parse_instance(record: &str, symbols: &SymbolTable) -> Option<InstanceRecord> {
    let mut fields = record.split(',');
    let code = fields.next()?;
    let anchor = parse_entity(fields.next()?, symbols)?;
    let tail = match code {
        "0" => None,
        "2" => Some(parse_entity(fields.next()?, symbols)?),
        _ => return None,
    };
    let metrics = parse_metrics(fields)?;
    Some(InstanceRecord {
        anchor,
        tail,
        metrics,
    })
}

/// Read the rules of `target` from an index file.
///
/// Closed templates become scored template rules; open-template instances
/// become compact rules carrying only their metrics. Rules that overfit
/// under `overfitting` are dropped.
pub fn read_rules(
    path: &Path,
    symbols: &SymbolTable,
    target: RelationId,
    overfitting: &OverfittingCheck,
) -> PersistResult<LoadedRules> {
    let text = read_to_string(path)?;
    let origin = path.display().to_string();
    let (records, mut skipped) = blocks(&text, &origin);
    let mut loaded = LoadedRules::default();

    for (handle, lines) in records {
        let Some(rest) = lines[0].strip_prefix(ABS_PREFIX) else {
            continue;
        };
        let fields: Vec<&str> = rest.split('\t').collect();
        if fields.len() != 9 {
            warn!(file = %origin, handle, fields = fields.len(), "skipping template with wrong field count");
            skipped += 1;
            continue;
        }
        let template = match Template::parse_index(fields[1], fields[2], symbols) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(file = %origin, handle, error = %e, "skipping unparsable template");
                skipped += 1;
                continue;
            }
        };
        if template.head != target {
            continue;
        }

        if template.closed {
            let Some(metrics) = parse_metrics(fields[3..].iter().copied()) else {
                warn!(file = %origin, handle, "skipping template with bad metrics");
                skipped += 1;
                continue;
            };
            let mut rule = Rule::from_template(template);
            rule.stats = RuleStats::from_metrics(metrics);
            if rule.overfits(overfitting) {
                loaded.overfitting += 1;
            } else {
                loaded.rules.push(rule);
            }
            continue;
        }

        let Some(instance_line) = lines.get(1) else {
            continue;
        };
        for record in instance_line.split('\t').filter(|r| !r.is_empty()) {
            let Some(inst) = parse_instance(record, symbols) else {
                warn!(file = %origin, handle, record, "skipping malformed instance");
                skipped += 1;
                continue;
            };
            let rule = Rule::compact(
                Arc::clone(&template),
                CompactInstance {
                    anchor: inst.anchor,
                    tail: inst.tail,
                },
                inst.metrics,
            );
            if rule.overfits(overfitting) {
                loaded.overfitting += 1;
            } else {
                loaded.rules.push(rule);
            }
        }
    }

    if skipped > 0 {
        warn!(file = %origin, skipped, "skipped malformed rule index entries");
    }
    loaded.skipped = skipped;
    Ok(loaded)
}
