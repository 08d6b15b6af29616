//! Default AI transport: prints the collected prompts as a document on
//! stdout and defers to the user, who answers out-of-band and re-runs with
//! `--answers`.

use async_trait::async_trait;
use console::style;

use super::{Transport, TransportContext, TransportOutcome};
use crate::ai::AiCollector;

/// Exit code signalling "prompts were printed, re-run with --answers".
pub const DEFERRED_EXIT_CODE: i32 = 2;

#[derive(Debug, Default)]
pub struct StdoutTransport;

impl StdoutTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn resolve(
        &self,
        collector: &AiCollector,
        ctx: &TransportContext,
    ) -> anyhow::Result<TransportOutcome> {
        println!("{}", render_prompt_document(collector, ctx));
        Ok(TransportOutcome::Deferred {
            exit_code: DEFERRED_EXIT_CODE,
        })
    }
}

/// Builds the prompt document: one section per collected entry plus
/// instructions for providing the answers file.
pub fn render_prompt_document(collector: &AiCollector, ctx: &TransportContext) -> String {
    let mut doc = String::new();
    doc.push_str(&format!(
        "\n{}\n{}\n",
        style(format!("AI prompts for recipe '{}'", ctx.recipe_name))
            .bold()
            .cyan(),
        style("━".repeat(50)).cyan()
    ));
    if !ctx.recipe_description.is_empty() {
        doc.push_str(&format!("{}\n", ctx.recipe_description));
    }

    for entry in collector.entries() {
        doc.push_str(&format!("\n{}\n", style(format!("## {}", entry.key)).bold()));
        for context in &entry.contexts {
            doc.push_str(&format!("context: {context}\n"));
        }
        doc.push_str(&format!("{}\n", entry.prompt));
        for example in &entry.examples {
            doc.push_str(&format!("example: {example}\n"));
        }
    }

    let keys: Vec<String> = collector
        .entries()
        .iter()
        .map(|e| format!("\"{}\": \"...\"", e.key))
        .collect();
    doc.push_str(&format!(
        "\n{}\nWrite your answers to {} as:\n  {{{}}}\nthen re-run with --answers ai-answers.json\n",
        style("━".repeat(50)).cyan(),
        ctx.working_dir.join("ai-answers.json").display(),
        keys.join(", ")
    ));
    doc
}
