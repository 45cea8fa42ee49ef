//! Error taxonomy for the engine.
//!
//! Configuration and graph errors are fatal and surface before anything
//! runs. Action errors stay local to one node.

use crate::types::{OutputRef, RuleId};
use std::path::PathBuf;

/// Result type for fallible engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Problems with the declared rule set.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("rule '{0}' is already registered")]
    DuplicateRule(RuleId),

    #[error("unknown rule '{0}'")]
    UnknownRule(RuleId),

    #[error("rule '{rule}' declares {kind} slot '{slot}' more than once")]
    DuplicateSlot {
        rule: RuleId,
        kind: &'static str,
        slot: String,
    },

    #[error(
        "output '{path}' of rule '{rule}' (slot '{slot}') overlaps an output of rule '{owner}'"
    )]
    OutputCollision {
        path: PathBuf,
        rule: RuleId,
        slot: String,
        owner: RuleId,
    },

    #[error("rule '{rule}' input '{slot}' references {reference}, which does not exist")]
    UnresolvedReference {
        rule: RuleId,
        slot: String,
        reference: OutputRef,
    },

    #[error("rule '{rule}' parameter '{param}' references unknown config key '{key}'")]
    UnknownConfigKey {
        rule: RuleId,
        param: String,
        key: String,
    },

    #[error("invalid rulefile: {0}")]
    InvalidRulefile(String),
}

/// Problems with the shape of the dependency graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<RuleId> },

    #[error("rule '{rule}' input '{slot}' ({path}) does not exist and no rule produces it")]
    MissingInput {
        rule: RuleId,
        slot: String,
        path: PathBuf,
    },

    #[error("unknown target '{0}': not a rule name or a declared output")]
    UnknownTarget(String),

    #[error("no target requested and the workflow declares no rules")]
    NoTargets,
}

/// Failure of a single node's action.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("exited with status {code}: {message}")]
    ExitStatus { code: i32, message: String },

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("declared outputs missing after success: {}", format_paths(.0))]
    MissingOutputs(Vec<PathBuf>),

    #[error("template error: {0}")]
    Template(String),

    #[error("failed to launch action: {0}")]
    Spawn(String),

    #[error("worker aborted: {0}")]
    Aborted(String),
}

/// Fatal errors surfaced to callers of the library.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_cycle(cycle: &[RuleId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
