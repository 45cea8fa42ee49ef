use super::action::{Action, Invocation};
use crate::config::{EngineConfig, StalenessMode};
use crate::error::ActionError;
use crate::events::{Event, EventLog, EventType};
use crate::storage::LedgerEntry;
use crate::types::{NodeState, ResolvedRule, RunId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Result of running one node to a terminal state
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub state: NodeState,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration: Duration,
    /// Content hashes captured after success, in content-hash mode
    pub fingerprint: Option<LedgerEntry>,
}

/// Runs a single node's action with timeout and retry logic
pub struct NodeRunner {
    action: Arc<dyn Action>,
    event_log: Arc<dyn EventLog>,
    config: EngineConfig,
}

impl NodeRunner {
    pub fn new(action: Arc<dyn Action>, event_log: Arc<dyn EventLog>, config: EngineConfig) -> Self {
        Self {
            action,
            event_log,
            config,
        }
    }

    /// Run the node until it succeeds or runs out of attempts
    pub async fn execute(&self, run_id: RunId, workdir: &Path, rule: &ResolvedRule) -> NodeResult {
        let invocation = Invocation::new(workdir, rule);
        let max_attempts = rule.retry.as_ref().map_or(1, |p| p.max_attempts.max(1));
        let start = Instant::now();
        let mut attempt = 1;

        loop {
            tracing::info!("Running rule {} (attempt {})", rule.id, attempt);
            self.emit(
                run_id,
                EventType::NodeStarted {
                    rule: rule.id.clone(),
                    attempt,
                },
            )
            .await;

            match self.attempt(&invocation, rule).await {
                Ok(()) => {
                    let duration = start.elapsed();
                    self.emit(
                        run_id,
                        EventType::NodeSucceeded {
                            rule: rule.id.clone(),
                            duration_ms: duration.as_millis() as u64,
                        },
                    )
                    .await;
                    tracing::info!("Rule {} succeeded in {:?}", rule.id, duration);

                    return NodeResult {
                        state: NodeState::Succeeded,
                        error: None,
                        attempts: attempt,
                        duration,
                        fingerprint: self.fingerprint(workdir, rule),
                    };
                }
                Err(e) => {
                    let will_retry = attempt < max_attempts;
                    self.emit(
                        run_id,
                        EventType::NodeFailed {
                            rule: rule.id.clone(),
                            error: e.to_string(),
                            attempt,
                            will_retry,
                        },
                    )
                    .await;

                    if !self.config.keep_incomplete {
                        remove_outputs(&invocation);
                    }

                    if !will_retry {
                        tracing::error!("Rule {} failed: {}", rule.id, e);
                        return NodeResult {
                            state: NodeState::Failed,
                            error: Some(e.to_string()),
                            attempts: attempt,
                            duration: start.elapsed(),
                            fingerprint: None,
                        };
                    }

                    // Exponential backoff between attempts
                    let backoff = rule.retry.as_ref().map_or(0, |p| p.backoff_secs);
                    let backoff_duration = backoff_delay(backoff, attempt);
                    tracing::warn!(
                        "Rule {} failed ({}); retrying after {:?} (attempt {})",
                        rule.id,
                        e,
                        backoff_duration,
                        attempt + 1
                    );
                    tokio::time::sleep(backoff_duration).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt: prepare output directories, run the action, verify outputs
    async fn attempt(&self, invocation: &Invocation, rule: &ResolvedRule) -> Result<(), ActionError> {
        for (_, path) in &invocation.outputs {
            if let Some(parent) = invocation.locate(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ActionError::Failed(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let timeout_secs = rule.timeout_secs.or(self.config.default_timeout_secs);
        match timeout_secs {
            Some(secs) => match timeout(Duration::from_secs(secs), self.action.execute(invocation)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!("Rule {} timed out", rule.id);
                    return Err(ActionError::Timeout(secs));
                }
            },
            None => self.action.execute(invocation).await?,
        }

        // Declared outputs are the authoritative success signal
        let missing: Vec<PathBuf> = invocation
            .outputs
            .iter()
            .filter(|(_, p)| !invocation.locate(p).exists())
            .map(|(_, p)| p.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ActionError::MissingOutputs(missing));
        }

        Ok(())
    }

    fn fingerprint(&self, workdir: &Path, rule: &ResolvedRule) -> Option<LedgerEntry> {
        if self.config.staleness != StalenessMode::ContentHash {
            return None;
        }
        match LedgerEntry::capture(workdir, rule) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Failed to hash files of rule {}: {}", rule.id, e);
                None
            }
        }
    }

    async fn emit(&self, run_id: RunId, event_type: EventType) {
        if let Err(e) = self.event_log.append(Event::new(run_id, event_type)).await {
            tracing::warn!("Failed to record event: {}", e);
        }
    }
}

/// Delay before the attempt after `attempt`: `backoff * 2^(attempt-1)`, saturating
fn backoff_delay(backoff_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(backoff_secs.saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1))))
}

/// Delete whatever a failed attempt left behind at declared output paths
fn remove_outputs(invocation: &Invocation) {
    for (_, path) in &invocation.outputs {
        let location = invocation.locate(path);
        let result = match std::fs::symlink_metadata(&location) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&location),
            Ok(_) => std::fs::remove_file(&location),
            Err(_) => continue,
        };
        match result {
            Ok(()) => tracing::info!(
                "Removed incomplete output {} of rule {}",
                path.display(),
                invocation.rule
            ),
            Err(e) => tracing::warn!("Failed to remove {}: {}", location.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::types::{RetryPolicy, RuleId};
    use crate::workflow::ShellAction;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails a fixed number of times, then writes every output
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Action for Flaky {
        async fn execute(&self, invocation: &Invocation) -> Result<(), ActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                // Leave a partial file behind
                std::fs::write(invocation.locate(&invocation.outputs[0].1), "partial").unwrap();
                return Err(ActionError::Failed(format!("flaky failure {}", call + 1)));
            }
            for (_, path) in &invocation.outputs {
                std::fs::write(invocation.locate(path), "done").unwrap();
            }
            Ok(())
        }
    }

    struct Sleepy;

    #[async_trait::async_trait]
    impl Action for Sleepy {
        async fn execute(&self, _invocation: &Invocation) -> Result<(), ActionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn rule(retry: Option<RetryPolicy>) -> ResolvedRule {
        ResolvedRule {
            id: RuleId::new("tree"),
            inputs: Vec::new(),
            outputs: vec![("tree".to_string(), PathBuf::from("results/tree.nwk"))],
            params: Default::default(),
            action: Some("augur tree".to_string()),
            timeout_secs: None,
            retry,
        }
    }

    fn runner(action: Arc<dyn Action>, log: Arc<MemoryEventLog>) -> NodeRunner {
        NodeRunner::new(action, log, EngineConfig::default())
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let temp_dir = TempDir::new().unwrap();
        let log = Arc::new(MemoryEventLog::new());
        let action = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let result = runner(action, log.clone())
            .execute(
                RunId::new(),
                temp_dir.path(),
                &rule(Some(RetryPolicy {
                    max_attempts: 3,
                    backoff_secs: 0,
                })),
            )
            .await;

        assert_eq!(result.state, NodeState::Succeeded);
        assert_eq!(result.attempts, 3);

        let retries = log
            .events()
            .await
            .iter()
            .filter(|e| matches!(e.event_type, EventType::NodeFailed { will_retry: true, .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_many_attempts_without_backoff() {
        let temp_dir = TempDir::new().unwrap();
        let action = Arc::new(Flaky {
            failures: 69,
            calls: AtomicU32::new(0),
        });
        let result = runner(action, Arc::new(MemoryEventLog::new()))
            .execute(
                RunId::new(),
                temp_dir.path(),
                &rule(Some(RetryPolicy {
                    max_attempts: 70,
                    backoff_secs: 0,
                })),
            )
            .await;

        assert_eq!(result.state, NodeState::Succeeded);
        assert_eq!(result.attempts, 70);
    }

    #[test]
    fn test_backoff_delay_saturates() {
        assert_eq!(backoff_delay(3, 1), Duration::from_secs(3));
        assert_eq!(backoff_delay(3, 3), Duration::from_secs(12));
        assert_eq!(backoff_delay(0, 70), Duration::ZERO);
        assert_eq!(backoff_delay(1 << 40, 80), Duration::from_secs(u64::MAX));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_shell_children() {
        let temp_dir = TempDir::new().unwrap();
        let mut rule = rule(None);
        rule.outputs = vec![("out".to_string(), PathBuf::from("out.txt"))];
        rule.action = Some("(sleep 2; echo late > {output.out}); true".to_string());
        rule.timeout_secs = Some(1);

        let result = runner(Arc::new(ShellAction::new()), Arc::new(MemoryEventLog::new()))
            .execute(RunId::new(), temp_dir.path(), &rule)
            .await;
        assert_eq!(result.state, NodeState::Failed);
        assert_eq!(result.error.as_deref(), Some("timed out after 1 seconds"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!temp_dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_failure_removes_partial_outputs() {
        let temp_dir = TempDir::new().unwrap();
        let action = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let result = runner(action, Arc::new(MemoryEventLog::new()))
            .execute(RunId::new(), temp_dir.path(), &rule(None))
            .await;

        assert_eq!(result.state, NodeState::Failed);
        assert_eq!(result.error.as_deref(), Some("flaky failure 1"));
        assert!(!temp_dir.path().join("results/tree.nwk").exists());
    }

    #[tokio::test]
    async fn test_keep_incomplete_leaves_outputs() {
        let temp_dir = TempDir::new().unwrap();
        let action = Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let config = EngineConfig {
            keep_incomplete: true,
            ..Default::default()
        };
        let result = NodeRunner::new(action, Arc::new(MemoryEventLog::new()), config)
            .execute(RunId::new(), temp_dir.path(), &rule(None))
            .await;

        assert_eq!(result.state, NodeState::Failed);
        assert!(temp_dir.path().join("results/tree.nwk").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_node() {
        let temp_dir = TempDir::new().unwrap();
        let mut rule = rule(None);
        rule.timeout_secs = Some(5);

        let result = runner(Arc::new(Sleepy), Arc::new(MemoryEventLog::new()))
            .execute(RunId::new(), temp_dir.path(), &rule)
            .await;

        assert_eq!(result.state, NodeState::Failed);
        assert_eq!(result.error.as_deref(), Some("timed out after 5 seconds"));
    }

    #[tokio::test]
    async fn test_success_without_outputs_is_failure() {
        struct Lazy;

        #[async_trait::async_trait]
        impl Action for Lazy {
            async fn execute(&self, _invocation: &Invocation) -> Result<(), ActionError> {
                Ok(())
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let result = runner(Arc::new(Lazy), Arc::new(MemoryEventLog::new()))
            .execute(RunId::new(), temp_dir.path(), &rule(None))
            .await;

        assert_eq!(result.state, NodeState::Failed);
        assert!(result
            .error
            .unwrap()
            .contains("declared outputs missing after success: results/tree.nwk"));
    }
}
