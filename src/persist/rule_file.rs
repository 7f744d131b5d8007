//! The flat, human-readable rule file.
//!
//! One line per surviving rule:
//! `<tag>\t<rule>\t<quality>\t<headCoverage>\t<validPrecision>\t<support>\t<totalPredictions>`.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use crate::error::PersistResult;
use crate::rule::{QualityMeasure, Rule};
use crate::symbol::SymbolTable;

use super::{format_number, read_to_string};

/// Render one rule as a flat file line, without the newline.
pub fn format_line(rule: &Rule, symbols: &SymbolTable, measure: QualityMeasure) -> String {
    let (head_coverage, valid_precision) = rule
        .stats
        .metrics()
        .map_or((0.0, 0.0), |m| (m.head_coverage, m.valid_precision));
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        rule.render(symbols),
        format_number(rule.quality(measure)),
        format_number(head_coverage),
        format_number(valid_precision),
        rule.stats.support,
        rule.stats.total_predictions
    )
}

/// A flat rule line read back.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleLine {
    pub tag: String,
    pub rule: String,
    pub quality: f64,
    pub head_coverage: f64,
    pub valid_precision: f64,
    pub support: u64,
    pub total_predictions: u64,
}

impl RuleLine {
    /// Number of body atoms in the rule string.
    pub fn len(&self) -> usize {
        self.rule
            .split_once(" <- ")
            .map_or(0, |(_, body)| body.split("), ").count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_line(line: &str) -> Option<RuleLine> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [tag, rule, quality, hc, vp, support, total] = fields.as_slice() else {
        return None;
    };
    if !matches!(*tag, "CAR" | "OAR" | "HAR" | "BAR") || !rule.contains(" <- ") {
        return None;
    }
    Some(RuleLine {
        tag: tag.to_string(),
        rule: rule.to_string(),
        quality: quality.parse().ok()?,
        head_coverage: hc.parse().ok()?,
        valid_precision: vp.parse().ok()?,
        support: support.parse().ok()?,
        total_predictions: total.parse().ok()?,
    })
}

/// Rules read from a flat rule file.
#[derive(Debug, Default)]
pub struct RuleFile {
    pub lines: Vec<RuleLine>,
    pub skipped: usize,
}

impl RuleFile {
    /// Rule counts per tag.
    pub fn counts_by_tag(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for line in &self.lines {
            *counts.entry(line.tag.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Rule counts per body length.
    pub fn counts_by_length(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for line in &self.lines {
            *counts.entry(line.len()).or_insert(0) += 1;
        }
        counts
    }

    /// The `k` best rules by quality; equal qualities keep file order.
    pub fn top(&self, k: usize) -> Vec<&RuleLine> {
        let mut lines: Vec<&RuleLine> = self.lines.iter().collect();
        lines.sort_by(|a, b| b.quality.total_cmp(&a.quality));
        lines.truncate(k);
        lines
    }
}

/// Read a flat rule file, skipping malformed lines.
pub fn read_rule_file(path: &Path) -> PersistResult<RuleFile> {
    let text = read_to_string(path)?;
    let mut file = RuleFile::default();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(rule) => file.lines.push(rule),
            None => {
                warn!(file = %path.display(), line = number + 1, "skipping malformed rule line");
                file.skipped += 1;
            }
        }
    }
    Ok(file)
}
