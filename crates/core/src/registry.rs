use crate::error::ConfigurationError;
use crate::paths::PathKey;
use crate::types::{OutputSlot, Rule, RuleId};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Owner of a declared output path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputOwner {
    pub rule: RuleId,
    pub slot: String,
}

/// Registry of declared rules, in declaration order
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    root: PathBuf,
    rules: Vec<Rule>,
    by_id: HashMap<RuleId, usize>,
    outputs: HashMap<PathKey, OutputOwner>,
}

impl TargetRegistry {
    /// Create an empty registry whose relative paths are anchored at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rules: Vec::new(),
            by_id: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a rule. Nothing is stored if any check fails.
    pub fn register(&mut self, rule: Rule) -> Result<(), ConfigurationError> {
        if self.by_id.contains_key(&rule.id) {
            return Err(ConfigurationError::DuplicateRule(rule.id));
        }

        check_unique_slots(&rule.id, "input", rule.inputs.iter().map(|s| s.name.as_str()))?;
        check_unique_slots(&rule.id, "output", rule.outputs.iter().map(|s| s.name.as_str()))?;

        // A claim may not equal or nest inside another claim, including
        // claims within the rule itself
        let mut claims: Vec<(PathKey, &OutputSlot)> = Vec::new();
        for slot in &rule.outputs {
            let key = PathKey::new(&self.root, &slot.path);
            let collision = |owner: &RuleId| ConfigurationError::OutputCollision {
                path: slot.path.clone(),
                rule: rule.id.clone(),
                slot: slot.name.clone(),
                owner: owner.clone(),
            };
            if let Some((_, owner)) = self.outputs.iter().find(|(k, _)| k.overlaps(&key)) {
                return Err(collision(&owner.rule));
            }
            if claims.iter().any(|(k, _)| k.overlaps(&key)) {
                return Err(collision(&rule.id));
            }
            claims.push((key, slot));
        }

        for (key, slot) in claims {
            self.outputs.insert(
                key,
                OutputOwner {
                    rule: rule.id.clone(),
                    slot: slot.name.clone(),
                },
            );
        }

        tracing::debug!(
            "Registered rule {} ({} inputs, {} outputs)",
            rule.id,
            rule.inputs.len(),
            rule.outputs.len()
        );

        self.by_id.insert(rule.id.clone(), self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    /// Look up a rule by identifier
    pub fn get(&self, id: &RuleId) -> Result<&Rule, ConfigurationError> {
        self.by_id
            .get(id)
            .map(|&i| &self.rules[i])
            .ok_or_else(|| ConfigurationError::UnknownRule(id.clone()))
    }

    pub fn contains(&self, id: &RuleId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Rules in declaration order
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rule and slot that own the given path, if any
    pub fn owner_of(&self, path: &Path) -> Option<&OutputOwner> {
        self.outputs.get(&PathKey::new(&self.root, path))
    }

    /// Every declared output path, in declaration order
    pub fn outputs(&self) -> Vec<&Path> {
        self.rules
            .iter()
            .flat_map(|r| r.outputs.iter().map(|o| o.path.as_path()))
            .collect()
    }
}

fn check_unique_slots<'a>(
    rule: &RuleId,
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigurationError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigurationError::DuplicateSlot {
                rule: rule.clone(),
                kind,
                slot: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        registry
            .register(Rule::new("parse").input("fasta", "data/raw.fasta").output("seqs", "results/seqs.fasta"))
            .unwrap();

        let rule = registry.get(&RuleId::new("parse")).unwrap();
        assert_eq!(rule.outputs.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.owner_of(Path::new("results/seqs.fasta")).unwrap().rule,
            RuleId::new("parse")
        );
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        registry.register(Rule::new("align")).unwrap();

        let err = registry.register(Rule::new("align")).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateRule(id) if id.as_str() == "align"));
    }

    #[test]
    fn test_unknown_rule() {
        let temp_dir = TempDir::new().unwrap();
        let registry = TargetRegistry::new(temp_dir.path());
        assert!(matches!(
            registry.get(&RuleId::new("tree")),
            Err(ConfigurationError::UnknownRule(_))
        ));
    }

    #[test]
    fn test_output_collision_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        registry
            .register(Rule::new("tree").output("tree", "results/tree.nwk"))
            .unwrap();

        let err = registry
            .register(Rule::new("refine").output("tree", "results/./tree.nwk"))
            .unwrap_err();
        match err {
            ConfigurationError::OutputCollision { rule, owner, .. } => {
                assert_eq!(rule.as_str(), "refine");
                assert_eq!(owner.as_str(), "tree");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The rejected rule left no trace
        assert!(!registry.contains(&RuleId::new("refine")));
        assert_eq!(registry.outputs().len(), 1);
    }

    #[test]
    fn test_nested_output_is_a_collision() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        registry.register(Rule::new("export").output("dir", "results")).unwrap();

        let err = registry
            .register(Rule::new("tree").output("tree", "results/tree.nwk"))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::OutputCollision { ref owner, .. } if owner.as_str() == "export"
        ));

        // Enclosing directory declared after the nested file
        let mut registry = TargetRegistry::new(temp_dir.path());
        registry
            .register(Rule::new("tree").output("tree", "results/tree.nwk"))
            .unwrap();
        assert!(registry.register(Rule::new("export").output("dir", "./results")).is_err());

        // Sibling prefixes are separate artifacts
        assert!(registry
            .register(Rule::new("refine").output("tree", "results/tree.nwk.json"))
            .is_ok());
        assert!(registry.register(Rule::new("copy").output("dir", "results2")).is_ok());
    }

    #[test]
    fn test_case_alias_is_a_collision() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        registry
            .register(Rule::new("export").output("main", "auspice/zika.json"))
            .unwrap();
        assert!(registry
            .register(Rule::new("export2").output("main", "auspice/Zika.json"))
            .is_err());
    }

    #[test]
    fn test_collision_within_one_rule() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        let err = registry
            .register(
                Rule::new("translate")
                    .output("aa", "results/aa.json")
                    .output("nt", "results/aa.json"),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::OutputCollision { .. }));
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = TargetRegistry::new(temp_dir.path());
        let err = registry
            .register(Rule::new("filter").input("seqs", "a.fasta").input("seqs", "b.fasta"))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateSlot { kind: "input", .. }));
    }
}
