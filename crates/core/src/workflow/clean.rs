use crate::registry::TargetRegistry;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Delete every declared output of every registered rule.
///
/// Returns the declared paths that existed and were removed. Paths that
/// are already absent are ignored.
pub fn clean(registry: &TargetRegistry) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    for path in registry.outputs() {
        let location = registry.root().join(path);
        let meta = match std::fs::symlink_metadata(&location) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to inspect {}", location.display()))
            }
        };

        if meta.is_dir() {
            std::fs::remove_dir_all(&location)
        } else {
            std::fs::remove_file(&location)
        }
        .with_context(|| format!("Failed to remove {}", location.display()))?;

        tracing::info!("Removed {}", path.display());
        removed.push(path.to_path_buf());
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rule;
    use tempfile::TempDir;

    #[test]
    fn test_clean_removes_files_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mut registry = TargetRegistry::new(root);
        registry
            .register(Rule::new("parse").input("in", "data/sequences.fasta").output("seqs", "results/seqs.fasta"))
            .unwrap();
        registry
            .register(Rule::new("export").input_ref("seqs", "parse", "seqs").output("auspice", "auspice"))
            .unwrap();
        registry
            .register(Rule::new("tree").input_ref("seqs", "parse", "seqs").output("tree", "results/tree.nwk"))
            .unwrap();

        std::fs::create_dir_all(root.join("results")).unwrap();
        std::fs::create_dir_all(root.join("auspice/sub")).unwrap();
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::write(root.join("results/seqs.fasta"), ">a\nACGT\n").unwrap();
        std::fs::write(root.join("auspice/sub/zika.json"), "{}").unwrap();
        std::fs::write(root.join("data/sequences.fasta"), ">a\nACGT\n").unwrap();

        let removed = clean(&registry).unwrap();
        assert_eq!(
            removed,
            vec![PathBuf::from("results/seqs.fasta"), PathBuf::from("auspice")]
        );
        assert!(!root.join("results/seqs.fasta").exists());
        assert!(!root.join("auspice").exists());
        // Inputs are never touched
        assert!(root.join("data/sequences.fasta").exists());
    }
}
