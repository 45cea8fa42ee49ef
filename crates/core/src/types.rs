use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for an executor run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Symbolic pointer at another rule's output slot (`rules.X.output.Y`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub rule: RuleId,
    pub slot: String,
}

impl OutputRef {
    pub fn new(rule: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            rule: RuleId::new(rule),
            slot: slot.into(),
        }
    }

    /// Parse `rules.X.output.Y` or `X.output.Y`. Anything else is not a reference.
    pub fn parse(text: &str) -> Option<Self> {
        let body = text.strip_prefix("rules.").unwrap_or(text);
        let (rule, slot) = body.split_once(".output.")?;
        let valid = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if valid(rule) && valid(slot) {
            Some(Self::new(rule, slot))
        } else {
            None
        }
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rules.{}.output.{}", self.rule, self.slot)
    }
}

/// What an input slot is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputBinding {
    /// A concrete file path, relative to the workflow root or absolute
    Path { path: PathBuf },
    /// Another rule's output slot
    Reference {
        target: OutputRef,
        /// Literal path used when the short `X.output.Y` form names no rule
        #[serde(default, skip_serializing_if = "Option::is_none")]
        literal: Option<PathBuf>,
    },
}

impl InputBinding {
    /// Interpret a rulefile string: references when they parse as one, paths otherwise.
    ///
    /// The short form without `rules.` may also be a plain file name such as
    /// `reads.output.fastq`, so it keeps the text as a literal fallback.
    pub fn parse(text: &str) -> Self {
        match OutputRef::parse(text) {
            Some(target) => Self::Reference {
                target,
                literal: (!text.starts_with("rules.")).then(|| PathBuf::from(text)),
            },
            None => Self::Path {
                path: PathBuf::from(text),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSlot {
    pub name: String,
    pub binding: InputBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub name: String,
    pub path: PathBuf,
}

/// Literal parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    String(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// A parameter is either a literal or a key into the workflow config table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamBinding {
    Literal { value: ParamValue },
    Config { key: String },
}

/// Retry policy for a rule's action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_secs: u64,
}

/// A declared processing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<OutputSlot>,
    pub params: BTreeMap<String, ParamBinding>,
    /// Command template; `None` marks a pseudo-rule such as `all`
    pub action: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

impl Rule {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RuleId::new(id),
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            action: None,
            timeout_secs: None,
            retry: None,
        }
    }

    /// Bind an input slot to a literal path
    pub fn input(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            binding: InputBinding::Path { path: path.into() },
        });
        self
    }

    /// Bind an input slot to another rule's output slot
    pub fn input_ref(
        mut self,
        name: impl Into<String>,
        rule: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            binding: InputBinding::Reference {
                target: OutputRef::new(rule, slot),
                literal: None,
            },
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(OutputSlot {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(
            name.into(),
            ParamBinding::Literal {
                value: value.into(),
            },
        );
        self
    }

    pub fn config_param(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.params
            .insert(name.into(), ParamBinding::Config { key: key.into() });
        self
    }

    pub fn shell(mut self, template: impl Into<String>) -> Self {
        self.action = Some(template.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff_secs: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            backoff_secs,
        });
        self
    }

    pub fn output_path(&self, slot: &str) -> Option<&Path> {
        self.outputs
            .iter()
            .find(|o| o.name == slot)
            .map(|o| o.path.as_path())
    }
}

/// A rule after reference and config substitution: every binding is concrete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRule {
    pub id: RuleId,
    pub inputs: Vec<(String, PathBuf)>,
    pub outputs: Vec<(String, PathBuf)>,
    pub params: BTreeMap<String, ParamValue>,
    pub action: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

impl ResolvedRule {
    pub fn input_paths(&self) -> impl Iterator<Item = &Path> {
        self.inputs.iter().map(|(_, p)| p.as_path())
    }

    pub fn output_paths(&self) -> impl Iterator<Item = &Path> {
        self.outputs.iter().map(|(_, p)| p.as_path())
    }

    /// Turn back into a declaration whose inputs are all literal paths
    pub fn to_rule(&self) -> Rule {
        Rule {
            id: self.id.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|(name, path)| InputSlot {
                    name: name.clone(),
                    binding: InputBinding::Path { path: path.clone() },
                })
                .collect(),
            outputs: self
                .outputs
                .iter()
                .map(|(name, path)| OutputSlot {
                    name: name.clone(),
                    path: path.clone(),
                })
                .collect(),
            params: self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), ParamBinding::Literal { value: v.clone() }))
                .collect(),
            action: self.action.clone(),
            timeout_secs: self.timeout_secs,
            retry: self.retry.clone(),
        }
    }
}

/// Per-node execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    SkippedFresh,
    SkippedBlocked,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Running)
    }

    /// Whether dependents may proceed past a node in this state
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::SkippedFresh)
    }

    /// Whether dependents must be blocked by a node in this state
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, NodeState::Failed | NodeState::SkippedBlocked)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::SkippedFresh => "skipped (fresh)",
            NodeState::SkippedBlocked => "skipped (blocked)",
        };
        f.write_str(label)
    }
}
