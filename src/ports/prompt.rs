//! Default interactive prompter over a terminal. Refuses to hang when stdin
//! is not a terminal; non-interactive runs should use `--ask=nobody` or
//! `--ask=ai` instead.

use async_trait::async_trait;
use console::{style, Term};
use serde_json::Value as JsonValue;

use super::Prompter;
use crate::recipe::VariableSpec;

#[derive(Debug, Default)]
pub struct TermPrompter;

impl TermPrompter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prompter for TermPrompter {
    async fn ask(&self, name: &str, spec: &VariableSpec) -> anyhow::Result<JsonValue> {
        let term = Term::stderr();
        if !term.is_term() {
            anyhow::bail!(
                "variable '{name}' needs an interactive terminal; pass --{name}=<value> or use --ask=ai"
            );
        }

        let label = spec.prompt.clone().unwrap_or_else(|| {
            spec.description
                .clone()
                .unwrap_or_else(|| format!("Value for '{name}'"))
        });

        let mut line = format!("{} {}", style("?").green().bold(), style(label).bold());
        if !spec.values.is_empty() {
            line.push_str(&format!(" ({})", spec.values.join("/")));
        }
        if let Some(hint) = spec.hint() {
            let hint_text = match hint {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            line.push_str(&format!(" [{}]", style(hint_text).dim()));
        }
        line.push_str(": ");
        term.write_str(&line)?;

        let answer = term.read_line()?;
        let answer = answer.trim();

        if answer.is_empty() {
            if let Some(hint) = spec.hint() {
                return Ok(hint.clone());
            }
        }
        Ok(JsonValue::String(answer.to_string()))
    }

    async fn confirm(&self, question: &str) -> anyhow::Result<bool> {
        let term = Term::stderr();
        if !term.is_term() {
            // existing files are left alone when nobody can answer
            return Ok(false);
        }
        term.write_str(&format!(
            "{} {} [y/N]: ",
            style("?").green().bold(),
            question
        ))?;
        let answer = term.read_line()?;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    }
}
