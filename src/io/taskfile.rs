//! Task definition documents (TOML) with per-item substitution.
//!
//! A task file carries the prompt plus optional checker and hook prompts.
//! Every string field is a minijinja template over one variable, `item`, so
//! the same definition can fan out across a work list.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Deserialize;

use crate::checker::Checker;
use crate::session::SessionOptions;
use crate::task::{DEFAULT_MAX_ITERATIONS, TaskSpec};

/// Checker value that disables verification entirely.
pub const CHECK_DISABLED: &str = "none";

/// Parsed task definition, still unrendered.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    pub prompt: String,
    #[serde(default)]
    pub check: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub set_up: Option<String>,
    #[serde(default)]
    pub tear_down: Option<String>,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
}

/// Load and validate a task definition from a TOML file.
pub fn load_task_file(path: &Path) -> Result<TaskDefinition> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task file {}", path.display()))?;
    let def: TaskDefinition =
        toml::from_str(&contents).with_context(|| format!("parse task file {}", path.display()))?;
    if def.prompt.trim().is_empty() {
        return Err(anyhow!(
            "task file {} has an empty 'prompt'",
            path.display()
        ));
    }
    Ok(def)
}

impl TaskDefinition {
    /// Render the definition against a work item and build a runnable spec.
    pub fn to_spec(&self, item: Option<&str>, session: &SessionOptions) -> Result<TaskSpec> {
        let item = item.unwrap_or("");
        let checker = match self.render_optional(self.check.as_deref(), item)? {
            None => Checker::Default,
            Some(text) if text.trim().eq_ignore_ascii_case(CHECK_DISABLED) => Checker::Disabled,
            Some(text) => Checker::Prompt(text),
        };

        Ok(TaskSpec {
            prompt: render(&self.prompt, item).context("render prompt")?,
            checker,
            max_iterations: self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            set_up: self.render_optional(self.set_up.as_deref(), item)?,
            tear_down: self.render_optional(self.tear_down.as_deref(), item)?,
            on_success: self.render_optional(self.on_success.as_deref(), item)?,
            on_failure: self.render_optional(self.on_failure.as_deref(), item)?,
            session: session.clone(),
        })
    }

    /// Whether any field actually consumes the `{{item}}` placeholder.
    pub fn uses_item(&self) -> bool {
        let a = self.fingerprint("\u{1}");
        let b = self.fingerprint("\u{2}");
        a != b
    }

    fn fingerprint(&self, item: &str) -> String {
        [
            Some(self.prompt.as_str()),
            self.check.as_deref(),
            self.set_up.as_deref(),
            self.tear_down.as_deref(),
            self.on_success.as_deref(),
            self.on_failure.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(|text| render(text, item).unwrap_or_default())
        .collect()
    }

    fn render_optional(&self, template: Option<&str>, item: &str) -> Result<Option<String>> {
        let Some(template) = template else {
            return Ok(None);
        };
        let rendered = render(template, item)?;
        if rendered.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(rendered))
    }
}

fn render(template: &str, item: &str) -> Result<String> {
    Environment::new()
        .render_str(template, context! { item })
        .with_context(|| format!("render task template: {template:.40}"))
}
