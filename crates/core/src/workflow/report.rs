use crate::types::{NodeState, RuleId, RunId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Final state of one node after a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReport {
    pub rule: RuleId,
    pub state: NodeState,
    /// Why the node was scheduled, skipped or blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Outcome of executing a dependency graph
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub wall_time_ms: u64,
    pub cancelled: bool,
    /// No node failed or was blocked, and the run was not cancelled
    succeeded: bool,
    exit_code: i32,
    /// Every node of the graph, in topological order
    pub nodes: Vec<NodeReport>,
}

impl ExecutionReport {
    pub fn new(
        run_id: RunId,
        started_at: DateTime<Utc>,
        wall_time_ms: u64,
        cancelled: bool,
        nodes: Vec<NodeReport>,
    ) -> Self {
        let succeeded = !cancelled
            && nodes
                .iter()
                .all(|n| !matches!(n.state, NodeState::Failed | NodeState::SkippedBlocked));
        Self {
            run_id,
            started_at,
            wall_time_ms,
            cancelled,
            succeeded,
            exit_code: if succeeded { 0 } else { 1 },
            nodes,
        }
    }

    /// True when no node failed and the run was not cancelled
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn node(&self, rule: &RuleId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.rule == rule)
    }

    pub fn state_of(&self, rule: &RuleId) -> Option<NodeState> {
        self.node(rule).map(|n| n.state)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.state == NodeState::Failed)
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .nodes
            .iter()
            .map(|n| n.rule.as_str().len())
            .max()
            .unwrap_or(0);

        for node in &self.nodes {
            write!(f, "  {:width$}  {}", node.rule.as_str(), node.state, width = width)?;
            if let Some(ms) = node.duration_ms {
                write!(f, " ({:.1}s)", ms as f64 / 1000.0)?;
            }
            if let Some(error) = &node.error {
                write!(f, ": {}", error.lines().next().unwrap_or_default())?;
            } else if let Some(reason) = node.reason.as_ref().filter(|_| node.state == NodeState::SkippedBlocked) {
                write!(f, ": {}", reason)?;
            }
            writeln!(f)?;
        }

        write!(
            f,
            "{} succeeded, {} up to date, {} failed, {} blocked in {:.1}s",
            self.count(NodeState::Succeeded),
            self.count(NodeState::SkippedFresh),
            self.count(NodeState::Failed),
            self.count(NodeState::SkippedBlocked),
            self.wall_time_ms as f64 / 1000.0
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(rule: &str, state: NodeState) -> NodeReport {
        NodeReport {
            rule: RuleId::new(rule),
            state,
            reason: None,
            error: None,
            attempts: 0,
            duration_ms: None,
        }
    }

    fn report(nodes: Vec<NodeReport>, cancelled: bool) -> ExecutionReport {
        ExecutionReport::new(RunId::new(), Utc::now(), 1500, cancelled, nodes)
    }

    #[test]
    fn test_exit_code() {
        let ok = report(
            vec![node("a", NodeState::Succeeded), node("b", NodeState::SkippedFresh)],
            false,
        );
        assert!(ok.succeeded());
        assert_eq!(ok.exit_code(), 0);

        let failed = report(
            vec![node("a", NodeState::Failed), node("b", NodeState::SkippedBlocked)],
            false,
        );
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.failures().count(), 1);

        let cancelled = report(vec![node("a", NodeState::Succeeded)], true);
        assert_eq!(cancelled.exit_code(), 1);
    }

    #[test]
    fn test_display_summary() {
        let mut failed = node("align", NodeState::Failed);
        failed.error = Some("exit status 2: bad input\nmore".to_string());
        let text = report(vec![node("parse", NodeState::Succeeded), failed], false).to_string();

        assert!(text.contains("  align  failed: exit status 2: bad input\n"));
        assert!(text.ends_with("1 succeeded, 0 up to date, 1 failed, 0 blocked in 1.5s"));
    }

    #[test]
    fn test_serialize_states() {
        let json = serde_json::to_value(report(vec![node("a", NodeState::SkippedFresh)], false)).unwrap();
        assert_eq!(json["nodes"][0]["state"], "skipped_fresh");
        assert!(json["nodes"][0].get("error").is_none());
        assert_eq!(json["succeeded"], true);
        assert_eq!(json["exit_code"], 0);

        let json = serde_json::to_value(report(vec![node("a", NodeState::Failed)], false)).unwrap();
        assert_eq!(json["succeeded"], false);
        assert_eq!(json["exit_code"], 1);
    }
}
