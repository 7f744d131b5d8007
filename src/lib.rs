// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # gpfl
//!
//! Graph path feature learning: mines Horn rules from a knowledge graph by
//! sampling paths around known facts, scores them against the training
//! split, and applies them to rank answers for held-out test facts.
//!
//! ## Architecture
//!
//! - **Graph** (`graph`): petgraph store with a per-relation edge index,
//!   triple-file loading and random-walk path sampling
//! - **Rules** (`rule`): templates, anchored instances and their statistics
//! - **Learning** (`generalization`, `specialization`): saturation-driven
//!   template discovery, then concurrent scoring and instantiation
//! - **Grounding** (`grounding`): the matcher every phase shares
//! - **Application** (`application`, `dispatch`): capped prediction maps, or
//!   ordered convergence-mode application
//! - **Evaluation** (`ranking`, `evaluation`): tie-aware ranking, prediction
//!   files and hits@k / MRR scoring
//!
//! ## Library usage
//!
//! ```no_run
//! use gpfl::config::Config;
//! use gpfl::engine::{Miner, Phases};
//!
//! let mut config = Config::default();
//! config.data.home = "data/fb15k-237".into();
//! let miner = Miner::load(&config).unwrap();
//! let summary = miner.run(Phases::ALL).unwrap();
//! println!("{} targets", summary.targets.len());
//! ```

pub mod application;
pub mod cancel;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod generalization;
pub mod graph;
pub mod grounding;
pub mod persist;
pub mod ranking;
pub mod rule;
pub mod specialization;
pub mod symbol;
