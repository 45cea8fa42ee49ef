use super::action::Action;
use super::dag::DependencyGraph;
use super::node_runner::{NodeResult, NodeRunner};
use super::report::{ExecutionReport, NodeReport};
use super::staleness::{StalenessPlan, StalenessTracker};
use crate::config::{EngineConfig, StalenessMode};
use crate::error::ActionError;
use crate::events::{Event, EventLog, EventType, NullEventLog};
use crate::storage::HashLedger;
use crate::types::{NodeState, ResolvedRule, RuleId, RunId};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs the stale part of a dependency graph on a bounded worker pool.
///
/// A single coordinator owns the per-run state table. Workers only run
/// actions and hand their results back, so state transitions never race.
pub struct Executor {
    config: EngineConfig,
    event_log: Arc<dyn EventLog>,
    runner: Arc<NodeRunner>,
}

/// Per-run bookkeeping, written only by the coordinator
struct RunState {
    run_id: RunId,
    states: HashMap<RuleId, NodeState>,
    reports: HashMap<RuleId, NodeReport>,
    waiting_on: HashMap<RuleId, usize>,
    ready: VecDeque<RuleId>,
}

impl Executor {
    pub fn new(config: EngineConfig, action: Arc<dyn Action>) -> Self {
        Self::with_event_log(config, action, Arc::new(NullEventLog))
    }

    pub fn with_event_log(
        config: EngineConfig,
        action: Arc<dyn Action>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        let runner = Arc::new(NodeRunner::new(action, event_log.clone(), config.clone()));
        Self {
            config,
            event_log,
            runner,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hash ledger for the workflow rooted at `root`. Mtime mode never
    /// touches disk.
    pub fn open_ledger(&self, root: &Path) -> HashLedger {
        match self.config.staleness {
            StalenessMode::Mtime => HashLedger::in_memory(),
            StalenessMode::ContentHash => HashLedger::open(root.join(&self.config.ledger_path)),
        }
    }

    /// Staleness decisions without running anything
    pub fn plan(&self, graph: &DependencyGraph) -> StalenessPlan {
        let ledger = self.open_ledger(graph.root());
        StalenessTracker::new(self.config.staleness, &ledger).plan(graph)
    }

    pub async fn run(&self, graph: &DependencyGraph) -> ExecutionReport {
        self.run_until_cancelled(graph, CancellationToken::new()).await
    }

    /// Execute the graph. Once `cancel` fires no new node starts; running
    /// nodes finish and everything still pending is reported as blocked.
    pub async fn run_until_cancelled(
        &self,
        graph: &DependencyGraph,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let run_id = RunId::new();
        let started_at = chrono::Utc::now();
        let start = Instant::now();

        let mut ledger = self.open_ledger(graph.root());
        let plan = StalenessTracker::new(self.config.staleness, &ledger).plan(graph);
        let order: Vec<RuleId> = graph
            .topological_order()
            .into_iter()
            .map(|n| n.id().clone())
            .collect();

        tracing::info!(
            "Starting run {}: {} rules, {} stale",
            run_id,
            graph.len(),
            plan.stale_count()
        );
        self.emit(
            run_id,
            EventType::RunStarted {
                targets: graph.targets().to_vec(),
                nodes: graph.len(),
                stale: plan.stale_count(),
            },
        )
        .await;

        let mut run = RunState {
            run_id,
            states: order.iter().map(|id| (id.clone(), NodeState::Pending)).collect(),
            reports: HashMap::new(),
            waiting_on: graph
                .nodes()
                .map(|n| (n.id().clone(), n.predecessors.len()))
                .collect(),
            ready: order
                .iter()
                .filter(|id| graph.node(id).is_some_and(|n| n.predecessors.is_empty()))
                .cloned()
                .collect(),
        };

        let pool_size = self.config.pool_size();
        let mut workers: JoinSet<(RuleId, NodeResult)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                self.cancelled(run_id, workers.len()).await;
            }

            // Settle or dispatch every ready node while worker slots remain
            while let Some(id) = run.ready.pop_front() {
                let Some(node) = graph.node(&id) else {
                    continue;
                };

                if cancelled {
                    self.finish_skipped(&mut run, graph, &id, NodeState::SkippedBlocked, "run cancelled".to_string())
                        .await;
                    continue;
                }

                if let Some(failed) = node
                    .predecessors
                    .iter()
                    .find(|p| run.states.get(*p).is_some_and(|s| s.blocks_dependents()))
                {
                    let reason = format!("dependency {} did not complete", failed);
                    self.finish_skipped(&mut run, graph, &id, NodeState::SkippedBlocked, reason)
                        .await;
                    continue;
                }

                if !plan.is_stale(&id) {
                    self.finish_skipped(&mut run, graph, &id, NodeState::SkippedFresh, "up to date".to_string())
                        .await;
                    continue;
                }

                if workers.len() >= pool_size {
                    run.ready.push_front(id);
                    break;
                }

                let reason = plan
                    .reason(&id)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "not yet built".to_string());
                tracing::debug!("Scheduling rule {}: {}", id, reason);
                self.emit(
                    run_id,
                    EventType::NodeScheduled {
                        rule: id.clone(),
                        reason: reason.clone(),
                    },
                )
                .await;

                run.states.insert(id.clone(), NodeState::Running);
                run.reports.insert(id.clone(), pending_report(&id, Some(reason)));
                self.spawn_worker(&mut workers, run_id, graph.root(), &node.rule);
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    self.cancelled(run_id, workers.len()).await;
                }
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok((id, result)) => {
                            match &result.fingerprint {
                                Some(entry) => ledger.record(id.clone(), entry.clone()),
                                None => ledger.forget(&id),
                            }
                            self.finish(&mut run, graph, &id, result);
                        }
                        Err(e) => tracing::error!("Worker task ended abnormally: {}", e),
                    }
                }
            }
        }

        if self.config.staleness == StalenessMode::ContentHash {
            if let Err(e) = ledger.save().await {
                tracing::warn!("Failed to save hash ledger: {:#}", e);
            }
        }

        let nodes: Vec<NodeReport> = order
            .iter()
            .map(|id| {
                let mut report = run
                    .reports
                    .remove(id)
                    .unwrap_or_else(|| pending_report(id, None));
                report.state = run.states.get(id).copied().unwrap_or(NodeState::Pending);
                // A node that never reached a terminal state could not finish
                if !report.state.is_terminal() {
                    report.state = NodeState::Failed;
                    if report.error.is_none() {
                        report.error = Some("worker task ended abnormally".to_string());
                    }
                }
                report
            })
            .collect();

        let report = ExecutionReport::new(
            run_id,
            started_at,
            start.elapsed().as_millis() as u64,
            cancelled,
            nodes,
        );

        self.emit(
            run_id,
            EventType::RunCompleted {
                succeeded: report.succeeded(),
                duration_ms: report.wall_time_ms,
            },
        )
        .await;
        tracing::info!("Run {} finished: {}", run_id, if report.succeeded() { "ok" } else { "failed" });

        report
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<(RuleId, NodeResult)>,
        run_id: RunId,
        root: &Path,
        rule: &ResolvedRule,
    ) {
        let runner = self.runner.clone();
        let root: PathBuf = root.to_path_buf();
        let rule = rule.clone();

        workers.spawn(async move {
            let id = rule.id.clone();
            // Inner task so a panicking action still reports back for its node
            let task = tokio::spawn(async move { runner.execute(run_id, &root, &rule).await });
            let result = match task.await {
                Ok(result) => result,
                Err(e) => NodeResult {
                    state: NodeState::Failed,
                    error: Some(ActionError::Aborted(e.to_string()).to_string()),
                    attempts: 1,
                    duration: Duration::ZERO,
                    fingerprint: None,
                },
            };
            (id, result)
        });
    }

    /// Record a worker's result and release dependents
    fn finish(&self, run: &mut RunState, graph: &DependencyGraph, id: &RuleId, result: NodeResult) {
        run.states.insert(id.clone(), result.state);
        let report = run
            .reports
            .entry(id.clone())
            .or_insert_with(|| pending_report(id, None));
        report.state = result.state;
        report.error = result.error;
        report.attempts = result.attempts;
        report.duration_ms = Some(result.duration.as_millis() as u64);

        release_dependents(run, graph, id);
    }

    async fn finish_skipped(
        &self,
        run: &mut RunState,
        graph: &DependencyGraph,
        id: &RuleId,
        state: NodeState,
        reason: String,
    ) {
        let event = match state {
            NodeState::SkippedFresh => {
                tracing::debug!("Rule {} is up to date", id);
                EventType::NodeSkipped { rule: id.clone() }
            }
            _ => {
                tracing::info!("Rule {} blocked: {}", id, reason);
                EventType::NodeBlocked {
                    rule: id.clone(),
                    reason: reason.clone(),
                }
            }
        };
        self.emit(run.run_id, event).await;

        run.states.insert(id.clone(), state);
        let mut report = pending_report(id, Some(reason));
        report.state = state;
        run.reports.insert(id.clone(), report);

        release_dependents(run, graph, id);
    }

    async fn cancelled(&self, run_id: RunId, running: usize) {
        tracing::warn!("Run {} cancelled; waiting for {} running rules", run_id, running);
        self.emit(
            run_id,
            EventType::RunCancelled {
                reason: "cancellation requested".to_string(),
            },
        )
        .await;
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::warn!("Failed to record event: {}", e);
        }
    }
}

/// A dependent becomes ready once every predecessor is terminal
fn release_dependents(run: &mut RunState, graph: &DependencyGraph, id: &RuleId) {
    let Some(node) = graph.node(id) else {
        return;
    };
    for successor in &node.successors {
        if let Some(count) = run.waiting_on.get_mut(successor) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                run.ready.push_back(successor.clone());
            }
        }
    }
}

fn pending_report(id: &RuleId, reason: Option<String>) -> NodeReport {
    NodeReport {
        rule: id.clone(),
        state: NodeState::Pending,
        reason,
        error: None,
        attempts: 0,
        duration_ms: None,
    }
}
