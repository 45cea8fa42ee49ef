use ruleflow_core::{EngineConfig, StalenessMode};
use std::path::PathBuf;

/// Command-line settings layered over the rulefile's `[engine]` table
#[derive(Debug, Clone, Default)]
pub struct EngineOverrides {
    pub jobs: Option<usize>,
    pub staleness: Option<StalenessMode>,
    pub keep_incomplete: bool,
    pub ledger: Option<PathBuf>,
}

impl EngineOverrides {
    /// Final engine settings: flags win over the rulefile, which wins over defaults
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(jobs) = self.jobs {
            config.workers = jobs;
        }
        if let Some(staleness) = self.staleness {
            config.staleness = staleness;
        }
        if self.keep_incomplete {
            config.keep_incomplete = true;
        }
        if let Some(ledger) = &self.ledger {
            config.ledger_path = ledger.clone();
        }

        tracing::debug!(
            "Engine: {} workers, {:?} staleness, keep_incomplete={}",
            config.pool_size(),
            config.staleness,
            config.keep_incomplete
        );
        config
    }
}

/// Default `tracing` filter when `RUST_LOG` is unset
pub fn default_log_filter(verbose: bool) -> &'static str {
    if verbose {
        "ruleflow=debug,ruleflow_core=debug"
    } else {
        "ruleflow=info,ruleflow_core=info"
    }
}
