//! Line-oriented output files and their readers.
//!
//! - [`rule_index`]: compact per-target index of scored templates and their
//!   instances, read back by the `apply` command.
//! - [`rule_file`]: one human-readable line per surviving rule.
//! - [`predictions`]: ranked answers per test query, and the verification
//!   report that explains them.
//!
//! Every writer maps I/O failures to [`PersistError`] with the offending path.
//! Readers skip malformed lines with a warning and report how many they
//! skipped.

pub mod predictions;
pub mod rule_file;
pub mod rule_index;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{PersistError, PersistResult};

/// Render a metric the way every output file does: at most five decimals,
/// no trailing zeros.
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    let fixed = format!("{value:.5}");
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

/// File name for a per-target output file, with path-hostile characters
/// replaced.
pub fn target_file_name(relation: &str) -> String {
    let sanitized: String = relation
        .chars()
        .map(|c| match c {
            ':' | '/' | '<' | '>' | '\\' => '_',
            c => c,
        })
        .collect();
    format!("{sanitized}.txt")
}

/// Create `path` for writing, creating its parent directories.
pub(crate) fn create(path: &Path) -> PersistResult<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PersistError::Write {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    let file = File::create(path).map_err(|e| PersistError::Write {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

pub(crate) fn read_to_string(path: &Path) -> PersistResult<String> {
    std::fs::read_to_string(path).map_err(|e| PersistError::Read {
        path: path.display().to_string(),
        source: e,
    })
}

/// Write `text` to `out`, attributing failures to `path`.
pub(crate) fn write_str<W: Write>(out: &mut W, text: &str, path: &Path) -> PersistResult<()> {
    out.write_all(text.as_bytes())
        .map_err(|e| PersistError::Write {
            path: path.display().to_string(),
            source: e,
        })
}

pub(crate) fn flush<W: Write>(out: &mut W, path: &Path) -> PersistResult<()> {
    out.flush().map_err(|e| PersistError::Write {
        path: path.display().to_string(),
        source: e,
    })
}

/// Serialize `value` as pretty JSON into `path`.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> PersistResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| PersistError::Serialize {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut out = create(path)?;
    write_str(&mut out, &json, path)?;
    flush(&mut out, path)
}
