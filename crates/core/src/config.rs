use crate::types::ParamValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How the staleness tracker compares inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalenessMode {
    /// Modification timestamps; equal timestamps count as current
    #[default]
    Mtime,
    /// SHA-256 of inputs and outputs against a persisted ledger
    ContentHash,
}

impl std::str::FromStr for StalenessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mtime" => Ok(Self::Mtime),
            "content-hash" => Ok(Self::ContentHash),
            other => Err(format!(
                "unknown staleness mode '{}' (expected 'mtime' or 'content-hash')",
                other
            )),
        }
    }
}

/// Engine settings, read from the `[engine]` table of a rulefile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub staleness: StalenessMode,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Leave outputs of failed actions on disk instead of removing them
    #[serde(default)]
    pub keep_incomplete: bool,

    /// Timeout applied to rules that do not declare their own
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".ruleflow/ledger.json")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            staleness: StalenessMode::default(),
            ledger_path: default_ledger_path(),
            keep_incomplete: false,
            default_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Worker pool size, never below one
    pub fn pool_size(&self) -> usize {
        self.workers.max(1)
    }
}

/// The rulefile's `[config]` table. Built once at load time and only ever
/// borrowed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowConfig(BTreeMap<String, ParamValue>);

impl WorkflowConfig {
    pub fn new(values: BTreeMap<String, ParamValue>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ParamValue)> for WorkflowConfig {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
