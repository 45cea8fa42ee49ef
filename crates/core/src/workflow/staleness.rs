use super::dag::{DependencyGraph, Node};
use crate::config::StalenessMode;
use crate::storage::{HashLedger, LedgerEntry};
use crate::types::RuleId;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Why a node does or does not need to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Staleness {
    Fresh,
    MissingOutput { path: PathBuf },
    InputNewer { input: PathBuf, output: PathBuf },
    Upstream { rule: RuleId },
    ProbeFailed { path: PathBuf, error: String },
    HashChanged { path: PathBuf },
    NoLedgerEntry,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

impl std::fmt::Display for Staleness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Staleness::Fresh => write!(f, "up to date"),
            Staleness::MissingOutput { path } => write!(f, "missing output {}", path.display()),
            Staleness::InputNewer { input, output } => write!(
                f,
                "input {} is newer than output {}",
                input.display(),
                output.display()
            ),
            Staleness::Upstream { rule } => write!(f, "upstream rule {} will run", rule),
            Staleness::ProbeFailed { path, error } => {
                write!(f, "could not inspect {} ({}), assuming stale", path.display(), error)
            }
            Staleness::HashChanged { path } => write!(f, "content of {} changed", path.display()),
            Staleness::NoLedgerEntry => write!(f, "no recorded content hashes"),
        }
    }
}

/// Staleness decision for every node of a graph
#[derive(Debug, Clone, Default)]
pub struct StalenessPlan {
    order: Vec<RuleId>,
    decisions: HashMap<RuleId, Staleness>,
}

impl StalenessPlan {
    /// Whether the node must run. Unknown nodes are treated as stale.
    pub fn is_stale(&self, rule: &RuleId) -> bool {
        self.decisions.get(rule).map_or(true, Staleness::is_stale)
    }

    pub fn reason(&self, rule: &RuleId) -> Option<&Staleness> {
        self.decisions.get(rule)
    }

    /// Decisions in topological order
    pub fn iter(&self) -> impl Iterator<Item = (&RuleId, &Staleness)> {
        self.order.iter().map(|id| (id, &self.decisions[id]))
    }

    pub fn stale_count(&self) -> usize {
        self.decisions.values().filter(|s| s.is_stale()).count()
    }
}

/// Decides which nodes need re-execution.
///
/// Staleness is transitive: a node downstream of a stale node is stale no
/// matter what its own files say. Probe errors count as stale.
pub struct StalenessTracker<'a> {
    mode: StalenessMode,
    ledger: &'a HashLedger,
}

impl<'a> StalenessTracker<'a> {
    pub fn new(mode: StalenessMode, ledger: &'a HashLedger) -> Self {
        Self { mode, ledger }
    }

    /// Compute decisions for every node, dependencies first
    pub fn plan(&self, graph: &DependencyGraph) -> StalenessPlan {
        let mut plan = StalenessPlan::default();

        for node in graph.topological_order() {
            let upstream = node
                .predecessors
                .iter()
                .find(|pred| plan.is_stale(pred))
                .cloned();

            let decision = match upstream {
                Some(rule) => Staleness::Upstream { rule },
                None => self.check(graph.root(), node),
            };

            tracing::debug!("Rule {}: {}", node.id(), decision);
            plan.order.push(node.id().clone());
            plan.decisions.insert(node.id().clone(), decision);
        }

        plan
    }

    /// The node's own decision, ignoring predecessors
    pub fn check(&self, root: &Path, node: &Node) -> Staleness {
        let rule = &node.rule;

        // A rule without outputs only reruns because of its dependencies
        if rule.outputs.is_empty() {
            return Staleness::Fresh;
        }

        let mut oldest_output: Option<(SystemTime, &Path)> = None;
        for path in rule.output_paths() {
            match modified(&root.join(path)) {
                Ok(mtime) => {
                    if oldest_output.map_or(true, |(oldest, _)| mtime < oldest) {
                        oldest_output = Some((mtime, path));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Staleness::MissingOutput {
                        path: path.to_path_buf(),
                    };
                }
                Err(e) => return probe_failed(path, e),
            }
        }

        match self.mode {
            StalenessMode::Mtime => {
                let Some((oldest, output)) = oldest_output else {
                    return Staleness::Fresh;
                };
                for input in rule.input_paths() {
                    match modified(&root.join(input)) {
                        // Equal timestamps count as current
                        Ok(mtime) if mtime > oldest => {
                            return Staleness::InputNewer {
                                input: input.to_path_buf(),
                                output: output.to_path_buf(),
                            };
                        }
                        Ok(_) => {}
                        Err(e) => return probe_failed(input, e),
                    }
                }
                Staleness::Fresh
            }
            StalenessMode::ContentHash => {
                let Some(recorded) = self.ledger.entry(node.id()) else {
                    return Staleness::NoLedgerEntry;
                };
                match LedgerEntry::capture(root, rule) {
                    Ok(current) => match current.first_difference(recorded) {
                        Some(path) => Staleness::HashChanged { path },
                        None => Staleness::Fresh,
                    },
                    Err(e) => Staleness::ProbeFailed {
                        path: root.to_path_buf(),
                        error: e.to_string(),
                    },
                }
            }
        }
    }
}

fn modified(path: &Path) -> io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

fn probe_failed(path: &Path, error: io::Error) -> Staleness {
    tracing::warn!(
        "Failed to inspect {}: {}; assuming stale",
        path.display(),
        error
    );
    Staleness::ProbeFailed {
        path: path.to_path_buf(),
        error: error.to_string(),
    }
}
