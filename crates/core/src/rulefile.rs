//! TOML rulefile loading.
//!
//! ```toml
//! default_target = "all"
//!
//! [config]
//! min_length = 9000
//!
//! [[rule]]
//! name = "filter"
//! inputs = { sequences = "results/sequences.fasta" }
//! outputs = { sequences = "results/filtered.fasta" }
//! params = { min_length = { config = "min_length" } }
//! shell = "augur filter --sequences {input.sequences} --min-length {params.min_length} --output {output.sequences}"
//! ```

use crate::config::{EngineConfig, WorkflowConfig};
use crate::error::{ConfigurationError, EngineResult, GraphError};
use crate::registry::TargetRegistry;
use crate::resolver::ReferenceResolver;
use crate::template::TemplateProcessor;
use crate::types::{
    InputBinding, InputSlot, OutputSlot, ParamBinding, ParamValue, ResolvedRule, RetryPolicy, Rule,
    RuleId,
};
use crate::workflow::DependencyGraph;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File name looked up when no rulefile is given
pub const DEFAULT_RULEFILE: &str = "Ruleflow.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRulefile {
    #[serde(default)]
    default_target: Option<String>,
    #[serde(default)]
    config: WorkflowConfig,
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default, rename = "rule")]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    name: String,
    #[serde(default)]
    inputs: toml::Table,
    #[serde(default)]
    outputs: toml::Table,
    #[serde(default)]
    params: toml::Table,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    retry: Option<RetryPolicy>,
}

/// A loaded workflow: registered rules plus the settings declared next to them
#[derive(Debug)]
pub struct Workflow {
    pub registry: TargetRegistry,
    pub config: WorkflowConfig,
    pub engine: EngineConfig,
    pub default_target: Option<String>,
}

impl Workflow {
    /// Read a rulefile. Relative paths in it are anchored at its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rulefile {}", path.display()))?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let root = std::path::absolute(&dir)
            .with_context(|| format!("Failed to resolve directory {}", dir.display()))?;

        let workflow = Self::from_toml(&text, &root)
            .with_context(|| format!("Failed to load rulefile {}", path.display()))?;
        tracing::debug!(
            "Loaded {} rules from {}",
            workflow.registry.len(),
            path.display()
        );
        Ok(workflow)
    }

    /// Parse rulefile text, registering every rule under `root`
    pub fn from_toml(text: &str, root: &Path) -> Result<Self, ConfigurationError> {
        let raw: RawRulefile =
            toml::from_str(text).map_err(|e| ConfigurationError::InvalidRulefile(e.to_string()))?;

        let mut registry = TargetRegistry::new(root);
        for raw_rule in raw.rules {
            let rule = convert_rule(raw_rule)?;
            validate_template(&rule)?;
            registry.register(rule)?;
        }

        Ok(Self {
            registry,
            config: raw.config,
            engine: raw.engine,
            default_target: raw.default_target,
        })
    }

    pub fn root(&self) -> &Path {
        self.registry.root()
    }

    /// The declared default target, else a rule named `all`, else the first rule
    pub fn default_targets(&self) -> Result<Vec<String>, GraphError> {
        if let Some(target) = &self.default_target {
            return Ok(vec![target.clone()]);
        }
        if self.registry.contains(&RuleId::new("all")) {
            return Ok(vec!["all".to_string()]);
        }
        self.registry
            .rules()
            .next()
            .map(|rule| vec![rule.id.to_string()])
            .ok_or(GraphError::NoTargets)
    }

    /// Resolve references and config parameters of every rule
    pub fn resolve(&self) -> Result<HashMap<RuleId, ResolvedRule>, ConfigurationError> {
        ReferenceResolver::new(&self.registry, &self.config).resolve_all()
    }

    /// Resolve and build the graph for `targets`, or the default targets when empty
    pub fn graph(&self, targets: &[String]) -> EngineResult<DependencyGraph> {
        let targets = if targets.is_empty() {
            self.default_targets()?
        } else {
            targets.to_vec()
        };
        let resolved = self.resolve()?;
        DependencyGraph::build(&self.registry, &resolved, &targets)
    }
}

fn convert_rule(raw: RawRule) -> Result<Rule, ConfigurationError> {
    let id = RuleId::new(raw.name.as_str());

    let inputs = raw
        .inputs
        .iter()
        .map(|(name, value)| {
            Ok(InputSlot {
                name: name.clone(),
                binding: InputBinding::parse(string_value(&id, "input", name, value)?),
            })
        })
        .collect::<Result<Vec<_>, ConfigurationError>>()?;

    let outputs = raw
        .outputs
        .iter()
        .map(|(name, value)| {
            Ok(OutputSlot {
                name: name.clone(),
                path: PathBuf::from(string_value(&id, "output", name, value)?),
            })
        })
        .collect::<Result<Vec<_>, ConfigurationError>>()?;

    let mut params = std::collections::BTreeMap::new();
    for (name, value) in &raw.params {
        params.insert(name.clone(), param_binding(&id, name, value)?);
    }

    Ok(Rule {
        id,
        inputs,
        outputs,
        params,
        action: raw.shell,
        timeout_secs: raw.timeout_secs,
        retry: raw.retry,
    })
}

fn string_value<'v>(
    rule: &RuleId,
    kind: &str,
    name: &str,
    value: &'v toml::Value,
) -> Result<&'v str, ConfigurationError> {
    value.as_str().ok_or_else(|| {
        ConfigurationError::InvalidRulefile(format!(
            "rule '{}' {} '{}' must be a string path",
            rule, kind, name
        ))
    })
}

fn param_binding(rule: &RuleId, name: &str, value: &toml::Value) -> Result<ParamBinding, ConfigurationError> {
    let literal = |value: ParamValue| Ok(ParamBinding::Literal { value });
    match value {
        toml::Value::Integer(v) => literal(ParamValue::Integer(*v)),
        toml::Value::Float(v) => literal(ParamValue::Float(*v)),
        toml::Value::String(v) => literal(ParamValue::String(v.clone())),
        toml::Value::Table(table) if table.len() == 1 => match table.get("config").and_then(|k| k.as_str()) {
            Some(key) => Ok(ParamBinding::Config { key: key.to_string() }),
            None => Err(invalid_param(rule, name)),
        },
        _ => Err(invalid_param(rule, name)),
    }
}

fn invalid_param(rule: &RuleId, name: &str) -> ConfigurationError {
    ConfigurationError::InvalidRulefile(format!(
        "rule '{}' parameter '{}' must be a string, a number or {{ config = \"key\" }}",
        rule, name
    ))
}

/// Reject templates naming slots or parameters the rule does not declare
fn validate_template(rule: &Rule) -> Result<(), ConfigurationError> {
    let Some(template) = &rule.action else {
        return Ok(());
    };

    for placeholder in TemplateProcessor::extract_placeholders(template) {
        let known = match placeholder.split_once('.') {
            None => matches!(placeholder.as_str(), "input" | "output" | "rule"),
            Some(("input", slot)) => rule.inputs.iter().any(|s| s.name == slot),
            Some(("output", slot)) => rule.outputs.iter().any(|s| s.name == slot),
            Some(("params", key)) => rule.params.contains_key(key),
            Some(_) => false,
        };
        if !known {
            return Err(ConfigurationError::InvalidRulefile(format!(
                "rule '{}' uses unknown placeholder '{{{}}}'",
                rule.id, placeholder
            )));
        }
    }

    Ok(())
}
