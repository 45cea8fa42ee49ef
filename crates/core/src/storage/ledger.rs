use crate::types::{ResolvedRule, RuleId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Hex-encoded SHA-256 of a file, or of a directory's files in sorted order
pub fn hash_path(path: &Path) -> io::Result<String> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_dir() {
        let mut hasher = Sha256::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(hash_file(entry.path())?.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    } else {
        hash_file(path)
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn hash_all<'p>(
    root: &Path,
    paths: impl Iterator<Item = &'p Path>,
) -> io::Result<BTreeMap<String, String>> {
    paths
        .map(|p| Ok((p.display().to_string(), hash_path(&root.join(p))?)))
        .collect()
}

/// Content hashes of a rule's inputs and outputs after it last succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Hash every input and output of `rule`, relative to `root`
    pub fn capture(root: &Path, rule: &ResolvedRule) -> io::Result<Self> {
        Ok(Self {
            inputs: hash_all(root, rule.input_paths())?,
            outputs: hash_all(root, rule.output_paths())?,
            recorded_at: Utc::now(),
        })
    }

    /// First path whose hash differs from `recorded`, ignoring timestamps
    pub fn first_difference(&self, recorded: &LedgerEntry) -> Option<PathBuf> {
        let differs = |current: &BTreeMap<String, String>, previous: &BTreeMap<String, String>| {
            current
                .iter()
                .find(|(path, hash)| previous.get(*path) != Some(*hash))
                .map(|(path, _)| PathBuf::from(path))
                .or_else(|| {
                    previous
                        .keys()
                        .find(|path| !current.contains_key(*path))
                        .map(PathBuf::from)
                })
        };

        differs(&self.inputs, &recorded.inputs).or_else(|| differs(&self.outputs, &recorded.outputs))
    }
}

/// Persisted content hashes, one entry per rule.
///
/// Only the executor's coordinator writes to it, and only after a node
/// succeeds; it is saved once at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct HashLedger {
    path: PathBuf,
    entries: BTreeMap<RuleId, LedgerEntry>,
}

impl HashLedger {
    /// An empty ledger that has never touched the disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the ledger at `path`. A missing or unreadable file yields an empty
    /// ledger, which makes every node stale rather than silently fresh.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unreadable ledger {}: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read ledger {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self, rule: &RuleId) -> Option<&LedgerEntry> {
        self.entries.get(rule)
    }

    pub fn record(&mut self, rule: RuleId, entry: LedgerEntry) {
        self.entries.insert(rule, entry);
    }

    pub fn forget(&mut self, rule: &RuleId) {
        self.entries.remove(rule);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the ledger to disk via a temporary file and rename
    pub async fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create ledger directory")?;
        }

        let json =
            serde_json::to_string_pretty(&self.entries).context("Failed to serialize ledger")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .context("Failed to write ledger")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("Failed to replace ledger")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rule;
    use tempfile::TempDir;

    fn resolved(rule: Rule) -> ResolvedRule {
        ResolvedRule {
            id: rule.id.clone(),
            inputs: rule
                .inputs
                .iter()
                .map(|s| match &s.binding {
                    crate::types::InputBinding::Path { path } => (s.name.clone(), path.clone()),
                    crate::types::InputBinding::Reference { .. } => unreachable!(),
                })
                .collect(),
            outputs: rule.outputs.iter().map(|o| (o.name.clone(), o.path.clone())).collect(),
            params: Default::default(),
            action: None,
            timeout_secs: None,
            retry: None,
        }
    }

    #[test]
    fn test_hash_file_and_directory() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "hello").unwrap();
        assert_eq!(
            hash_path(&temp_dir.path().join("a.txt")).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        std::fs::create_dir(temp_dir.path().join("dir")).unwrap();
        std::fs::write(temp_dir.path().join("dir/x"), "1").unwrap();
        let before = hash_path(&temp_dir.path().join("dir")).unwrap();
        std::fs::write(temp_dir.path().join("dir/x"), "2").unwrap();
        let after = hash_path(&temp_dir.path().join("dir")).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_capture_and_difference() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("in.txt"), "a").unwrap();
        std::fs::write(temp_dir.path().join("out.txt"), "b").unwrap();
        let rule = resolved(Rule::new("r").input("in", "in.txt").output("out", "out.txt"));

        let recorded = LedgerEntry::capture(temp_dir.path(), &rule).unwrap();
        let same = LedgerEntry::capture(temp_dir.path(), &rule).unwrap();
        assert_eq!(same.first_difference(&recorded), None);

        std::fs::write(temp_dir.path().join("in.txt"), "changed").unwrap();
        let changed = LedgerEntry::capture(temp_dir.path(), &rule).unwrap();
        assert_eq!(changed.first_difference(&recorded), Some(PathBuf::from("in.txt")));
    }

    #[tokio::test]
    async fn test_save_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".ruleflow/ledger.json");

        let mut ledger = HashLedger::open(&path);
        assert!(ledger.is_empty());
        ledger.record(
            RuleId::new("align"),
            LedgerEntry {
                inputs: [("a".to_string(), "h1".to_string())].into_iter().collect(),
                outputs: BTreeMap::new(),
                recorded_at: Utc::now(),
            },
        );
        ledger.save().await.unwrap();

        let reopened = HashLedger::open(&path);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.entry(&RuleId::new("align")), ledger.entry(&RuleId::new("align")));
    }

    #[test]
    fn test_corrupt_ledger_opens_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ledger.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(HashLedger::open(&path).is_empty());
    }
}
