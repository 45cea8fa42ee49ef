// Action command templates

use crate::error::ActionError;
use crate::types::ParamValue;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Values available to a command template
pub struct TemplateContext<'a> {
    pub rule: &'a str,
    pub inputs: &'a [(String, PathBuf)],
    pub outputs: &'a [(String, PathBuf)],
    pub params: &'a BTreeMap<String, ParamValue>,
}

/// Renders `{input.NAME}`-style placeholders into a command line
pub struct TemplateProcessor;

impl TemplateProcessor {
    /// Substitute every placeholder. `{{` and `}}` produce literal braces.
    ///
    /// Paths are shell-quoted when needed; parameter values are inserted
    /// verbatim so a parameter may carry several flags.
    pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, ActionError> {
        let mut result = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    result.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    result.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(ActionError::Template(format!(
                                    "unterminated placeholder '{{{}'",
                                    name
                                )))
                            }
                        }
                    }
                    result.push_str(&Self::lookup(name.trim(), ctx)?);
                }
                '}' => {
                    return Err(ActionError::Template(
                        "unmatched '}' in template".to_string(),
                    ))
                }
                c => result.push(c),
            }
        }

        Ok(result)
    }

    fn lookup(name: &str, ctx: &TemplateContext<'_>) -> Result<String, ActionError> {
        let join = |slots: &[(String, PathBuf)]| {
            slots
                .iter()
                .map(|(_, p)| quote(&p.display().to_string()))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let find = |slots: &[(String, PathBuf)], slot: &str| {
            slots
                .iter()
                .find(|(n, _)| n == slot)
                .map(|(_, p)| quote(&p.display().to_string()))
        };

        let value = match name.split_once('.') {
            None => match name {
                "input" => Some(join(ctx.inputs)),
                "output" => Some(join(ctx.outputs)),
                "rule" => Some(ctx.rule.to_string()),
                _ => None,
            },
            Some(("input", slot)) => find(ctx.inputs, slot),
            Some(("output", slot)) => find(ctx.outputs, slot),
            Some(("params", key)) => ctx.params.get(key).map(|v| v.to_string()),
            Some(_) => None,
        };

        value.ok_or_else(|| {
            ActionError::Template(format!(
                "unknown placeholder '{{{}}}' in rule '{}'",
                name, ctx.rule
            ))
        })
    }

    /// Placeholder names used by a template, sorted and deduplicated
    pub fn extract_placeholders(text: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut chars = text.chars().peekable();
        let mut current = String::new();
        let mut in_placeholder = false;

        while let Some(c) = chars.next() {
            if !in_placeholder && c == '{' && chars.peek() == Some(&'{') {
                chars.next(); // escaped brace
            } else if !in_placeholder && c == '{' {
                in_placeholder = true;
                current.clear();
            } else if in_placeholder && c == '}' {
                if !current.trim().is_empty() {
                    names.push(current.trim().to_string());
                }
                in_placeholder = false;
            } else if in_placeholder {
                current.push(c);
            }
        }

        names.sort();
        names.dedup();
        names
    }
}

/// Single-quote a word for `sh` unless it only has safe characters
fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,%@".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
