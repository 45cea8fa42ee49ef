use crate::error::ActionError;
use crate::template::{TemplateContext, TemplateProcessor};
use crate::types::{ParamValue, ResolvedRule, RuleId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Everything an action gets to see about the node it runs for
#[derive(Debug, Clone)]
pub struct Invocation {
    pub rule: RuleId,
    pub template: Option<String>,
    pub workdir: PathBuf,
    pub inputs: Vec<(String, PathBuf)>,
    pub outputs: Vec<(String, PathBuf)>,
    pub params: BTreeMap<String, ParamValue>,
}

impl Invocation {
    pub fn new(workdir: &Path, rule: &ResolvedRule) -> Self {
        Self {
            rule: rule.id.clone(),
            template: rule.action.clone(),
            workdir: workdir.to_path_buf(),
            inputs: rule.inputs.clone(),
            outputs: rule.outputs.clone(),
            params: rule.params.clone(),
        }
    }

    pub fn input(&self, slot: &str) -> Option<&Path> {
        find_slot(&self.inputs, slot)
    }

    pub fn output(&self, slot: &str) -> Option<&Path> {
        find_slot(&self.outputs, slot)
    }

    /// Absolute location of a declared path
    pub fn locate(&self, path: &Path) -> PathBuf {
        self.workdir.join(path)
    }

    /// The command line with every placeholder substituted, if the rule has one
    pub fn render(&self) -> Result<Option<String>, ActionError> {
        let Some(template) = &self.template else {
            return Ok(None);
        };
        TemplateProcessor::render(
            template,
            &TemplateContext {
                rule: self.rule.as_str(),
                inputs: &self.inputs,
                outputs: &self.outputs,
                params: &self.params,
            },
        )
        .map(Some)
    }
}

fn find_slot<'a>(slots: &'a [(String, PathBuf)], slot: &str) -> Option<&'a Path> {
    slots
        .iter()
        .find(|(name, _)| name == slot)
        .map(|(_, p)| p.as_path())
}

/// External work performed for a node.
///
/// The engine only observes the returned status; whether the declared
/// outputs exist afterwards is checked separately.
#[async_trait::async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<(), ActionError>;
}

/// Runs a rule's rendered template through a shell
#[derive(Debug, Clone)]
pub struct ShellAction {
    shell: String,
}

impl Default for ShellAction {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellAction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

const STDERR_TAIL_LINES: usize = 20;

/// Kills every process left in a shell's process group when dropped
struct ProcessGroup(u32);

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // Fails quietly once the group is empty
            let _ = std::process::Command::new("kill")
                .args(["-KILL", "--", &format!("-{}", self.0)])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

#[async_trait::async_trait]
impl Action for ShellAction {
    async fn execute(&self, invocation: &Invocation) -> Result<(), ActionError> {
        let Some(command) = invocation.render()? else {
            // Pseudo-rules have nothing to run
            return Ok(());
        };

        tracing::info!("[{}] {}", invocation.rule, command);

        let mut shell = tokio::process::Command::new(&self.shell);
        shell
            .arg("-c")
            .arg(&command)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        shell.process_group(0);

        let child = shell
            .spawn()
            .map_err(|e| ActionError::Spawn(format!("{}: {}", self.shell, e)))?;
        // Subshells and pipelines must not outlive the action, even on timeout
        let _group = child.id().map(ProcessGroup);
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ActionError::Failed(format!("failed to wait for {}: {}", self.shell, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!("[{}] stdout:\n{}", invocation.rule, stdout.trim_end());
        }

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

        match output.status.code() {
            Some(code) => Err(ActionError::ExitStatus {
                code,
                message: tail,
            }),
            None => Err(ActionError::Failed(format!(
                "terminated by signal{}",
                if tail.is_empty() {
                    String::new()
                } else {
                    format!(": {}", tail)
                }
            ))),
        }
    }
}
