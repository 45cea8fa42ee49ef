use crate::config::WorkflowConfig;
use crate::error::ConfigurationError;
use crate::registry::TargetRegistry;
use crate::types::{InputBinding, ParamBinding, ResolvedRule, Rule, RuleId};
use std::collections::{BTreeMap, HashMap};

/// Substitutes symbolic bindings with concrete values.
///
/// Resolution runs after every rule is registered, so a rule may reference
/// another rule declared later in the file. Nothing is executed.
pub struct ReferenceResolver<'a> {
    registry: &'a TargetRegistry,
    config: &'a WorkflowConfig,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(registry: &'a TargetRegistry, config: &'a WorkflowConfig) -> Self {
        Self { registry, config }
    }

    /// Resolve every registered rule, keyed by identifier
    pub fn resolve_all(&self) -> Result<HashMap<RuleId, ResolvedRule>, ConfigurationError> {
        self.registry
            .rules()
            .map(|rule| Ok((rule.id.clone(), self.resolve(rule)?)))
            .collect()
    }

    /// Resolve a single rule's input references and config parameters
    pub fn resolve(&self, rule: &Rule) -> Result<ResolvedRule, ConfigurationError> {
        let mut inputs = Vec::with_capacity(rule.inputs.len());
        for slot in &rule.inputs {
            let path = match &slot.binding {
                InputBinding::Path { path } => path.clone(),
                InputBinding::Reference { target, literal } => {
                    let unresolved = || ConfigurationError::UnresolvedReference {
                        rule: rule.id.clone(),
                        slot: slot.name.clone(),
                        reference: target.clone(),
                    };
                    let producer = match (self.registry.get(&target.rule), literal) {
                        (Ok(producer), _) => producer,
                        (Err(_), Some(path)) => {
                            inputs.push((slot.name.clone(), path.clone()));
                            continue;
                        }
                        (Err(_), None) => return Err(unresolved()),
                    };
                    producer
                        .output_path(&target.slot)
                        .ok_or_else(unresolved)?
                        .to_path_buf()
                }
            };
            inputs.push((slot.name.clone(), path));
        }

        let mut params = BTreeMap::new();
        for (name, binding) in &rule.params {
            let value = match binding {
                ParamBinding::Literal { value } => value.clone(),
                ParamBinding::Config { key } => self
                    .config
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ConfigurationError::UnknownConfigKey {
                        rule: rule.id.clone(),
                        param: name.clone(),
                        key: key.clone(),
                    })?,
            };
            params.insert(name.clone(), value);
        }

        Ok(ResolvedRule {
            id: rule.id.clone(),
            inputs,
            outputs: rule
                .outputs
                .iter()
                .map(|o| (o.name.clone(), o.path.clone()))
                .collect(),
            params,
            action: rule.action.clone(),
            timeout_secs: rule.timeout_secs,
            retry: rule.retry.clone(),
        })
    }
}
