//! Rich diagnostic error types for the rule miner.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Running out of a time or count budget is
//! not an error anywhere in the crate; phases report it through their summaries.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the rule miner.
#[derive(Debug, Error, Diagnostic)]
pub enum GpflError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Crate-wide result alias.
pub type GpflResult<T> = std::result::Result<T, GpflError>;

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(gpfl::config::read),
        help("Ensure the config file exists and is readable. `gpfl init-config` writes a default one.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(gpfl::config::parse),
        help("Check the TOML syntax and the value types in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(gpfl::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid setting `{field}`: {message}")]
    #[diagnostic(
        code(gpfl::config::invalid),
        help("Fix the value in the config file or on the command line and rerun.")
    )]
    Invalid { field: String, message: String },

    #[error("target relation \"{target}\" does not occur in the test file")]
    #[diagnostic(
        code(gpfl::config::unknown_target),
        help("Targets are validated against the relations of the test split. Check the spelling in `data.targets`.")
    )]
    UnknownTarget { target: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("relation not found: \"{name}\"")]
    #[diagnostic(
        code(gpfl::graph::relation_not_found),
        help("No edge of this relation was loaded. Check the relation name against the triple files.")
    )]
    RelationNotFound { name: String },

    #[error("malformed triple at {path}:{line}: {message}")]
    #[diagnostic(
        code(gpfl::graph::malformed_triple),
        help("Triple files hold one `subject<TAB>relation<TAB>object` line per fact.")
    )]
    MalformedTriple {
        path: String,
        line: usize,
        message: String,
    },
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// Rule errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RuleError {
    #[error("no template registered under handle {handle}")]
    #[diagnostic(
        code(gpfl::rule::missing_handle),
        help(
            "Template handles are assigned once during generalization and never removed. \
             A missing handle means the context was corrupted; this is a bug."
        )
    )]
    MissingHandle { handle: usize },

    #[error("cannot parse rule: {message}")]
    #[diagnostic(
        code(gpfl::rule::parse),
        help("Rule index lines look like `ABS: 3\\tCAR\\tr(X,Y) <- p(X,V1,0)\\t...`.")
    )]
    Parse { message: String },

    #[error("rule body is empty")]
    #[diagnostic(
        code(gpfl::rule::empty_body),
        help("Every rule needs at least one body atom.")
    )]
    EmptyBody,
}

pub type RuleResult<T> = std::result::Result<T, RuleError>;

// ---------------------------------------------------------------------------
// Persistence errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PersistError {
    #[error("failed to read {path}")]
    #[diagnostic(
        code(gpfl::persist::read),
        help("Ensure the file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    #[diagnostic(
        code(gpfl::persist::write),
        help(
            "Ensure the output directory is writable and the disk is not full. \
             Partial output from this run is not usable."
        )
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {path}: {message}")]
    #[diagnostic(
        code(gpfl::persist::serialize),
        help("This is a bug: every report type should serialize to JSON.")
    )]
    Serialize { path: String, message: String },
}

pub type PersistResult<T> = std::result::Result<T, PersistError>;

// ---------------------------------------------------------------------------
// Pipeline errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("a {stage} worker panicked")]
    #[diagnostic(
        code(gpfl::pipeline::worker_panicked),
        help("Rerun with RUST_LOG=debug to see what the worker was doing.")
    )]
    WorkerPanicked { stage: &'static str },

    #[error("failed to start the {stage} thread pool: {message}")]
    #[diagnostic(
        code(gpfl::pipeline::thread_pool),
        help("Lower `learn.threads` or check the process thread limit.")
    )]
    ThreadPool { stage: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_gpfl_error() {
        let err = ConfigError::Invalid {
            field: "learn.threads".into(),
            message: "must be at least 1".into(),
        };
        let top: GpflError = err.into();
        assert!(matches!(top, GpflError::Config(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rule_error_converts_to_gpfl_error() {
        let top: GpflError = RuleError::MissingHandle { handle: 7 }.into();
        assert!(matches!(
            top,
            GpflError::Rule(RuleError::MissingHandle { handle: 7 })
        ));
    }

    #[test]
    fn persist_error_keeps_source() {
        use std::error::Error as _;
        let err = PersistError::Write {
            path: "out/rules.txt".into(),
            source: std::io::Error::other("disk full"),
        };
        assert!(err.to_string().contains("out/rules.txt"));
        assert!(err.source().is_some());
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = ConfigError::UnknownTarget {
            target: "born_in".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("born_in"));

        let err = GraphError::MalformedTriple {
            path: "train.txt".into(),
            line: 12,
            message: "expected 3 fields".into(),
        };
        assert!(format!("{err}").contains("train.txt:12"));
    }
}
