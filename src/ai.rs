//! AI assistance plumbing: the per-run collector that accumulates `@ai`
//! blocks during Pass 1, the block syntax itself, and the answers file
//! consumed by `--answers`.
//!
//! Template bodies may contain blocks of the form:
//!
//! ```text
//! @ai(greeting)
//! @context This file is the project README
//! @prompt Write a one-line greeting for the user
//! @example Hello, friend!
//! @end
//! ```
//!
//! In collect mode a block records an [`AiEntry`] and renders to nothing; in
//! write mode it renders the resolved answer verbatim.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

/// One pending AI request collected during Pass 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiEntry {
    /// Unique within one recipe run.
    pub key: String,
    pub prompt: String,
    pub contexts: Vec<String>,
    pub examples: Vec<String>,
}

/// Per-run accumulator of AI requests. Created at run start, cleared at run
/// boundary; entries are owned exclusively by the collector.
///
/// Collection-mode renders are serialized by the engine (Pass 1 runs with a
/// concurrency of one), the mutex only satisfies the port boundary.
#[derive(Debug, Default)]
pub struct AiCollector {
    entries: Mutex<IndexMap<String, AiEntry>>,
}

impl AiCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry. The first record for a key wins; keys are unique
    /// within a run.
    pub fn record(&self, entry: AiEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(entry.key.clone()).or_insert(entry);
    }

    pub fn entries(&self) -> Vec<AiEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Resolved answers keyed by `@ai` block key.
pub type AiAnswers = HashMap<String, String>;

/// Per-run AI state threaded through template rendering: which pass is
/// active, the collector that accumulates Pass-1 entries, and the answers
/// spliced in during Pass 2.
#[derive(Clone)]
pub struct AiState {
    pub collect_mode: bool,
    pub collector: std::sync::Arc<AiCollector>,
    pub answers: std::sync::Arc<AiAnswers>,
}

impl AiState {
    /// Pass-1 state: record entries, suppress output.
    pub fn collecting(collector: std::sync::Arc<AiCollector>) -> Self {
        Self {
            collect_mode: true,
            collector,
            answers: std::sync::Arc::new(AiAnswers::new()),
        }
    }

    /// Pass-2 state: splice the given answers into `@ai` blocks.
    pub fn writing(answers: std::sync::Arc<AiAnswers>) -> Self {
        Self {
            collect_mode: false,
            collector: std::sync::Arc::new(AiCollector::new()),
            answers,
        }
    }

    pub fn mode(&self) -> AiMode<'_> {
        if self.collect_mode {
            AiMode::Collect(&self.collector)
        } else {
            AiMode::Write(&self.answers)
        }
    }
}

/// How [`process_blocks`] treats `@ai` blocks.
pub enum AiMode<'a> {
    /// Record entries into the collector; blocks render to nothing.
    Collect(&'a AiCollector),
    /// Splice resolved answers in place of blocks; missing keys render empty.
    Write(&'a AiAnswers),
}

/// Scans a rendered template body for `@ai` blocks and either records or
/// splices them depending on `mode`. Text outside blocks passes through
/// untouched.
pub fn process_blocks(body: &str, mode: &AiMode<'_>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(body.len());
    let mut lines = body.lines().peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if let Some(key) = parse_block_open(trimmed) {
            let entry = parse_block_body(&key, &mut lines)?;
            match mode {
                AiMode::Collect(collector) => collector.record(entry),
                AiMode::Write(answers) => {
                    if let Some(answer) = answers.get(&key) {
                        out.push_str(answer);
                        out.push('\n');
                    }
                }
            }
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }

    // lines() drops a trailing newline; only re-add what the input had
    if !body.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

fn parse_block_open(line: &str) -> Option<String> {
    let rest = line.strip_prefix("@ai(")?;
    let key = rest.strip_suffix(')')?.trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

fn parse_block_body(
    key: &str,
    lines: &mut std::iter::Peekable<std::str::Lines<'_>>,
) -> anyhow::Result<AiEntry> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Prompt,
        Context,
        Example,
    }

    let mut prompt = String::new();
    let mut contexts: Vec<String> = Vec::new();
    let mut examples: Vec<String> = Vec::new();
    let mut section = Section::None;
    let mut closed = false;

    for line in lines.by_ref() {
        let trimmed = line.trim();
        if trimmed == "@end" {
            closed = true;
            break;
        }

        if let Some(rest) = trimmed.strip_prefix("@prompt") {
            section = Section::Prompt;
            push_section_line(&mut prompt, rest.trim());
        } else if let Some(rest) = trimmed.strip_prefix("@context") {
            section = Section::Context;
            contexts.push(rest.trim().to_string());
        } else if let Some(rest) = trimmed
            .strip_prefix("@example")
            .or_else(|| trimmed.strip_prefix("@output"))
        {
            section = Section::Example;
            examples.push(rest.trim().to_string());
        } else {
            // continuation line of the current section
            match section {
                Section::Prompt => push_section_line(&mut prompt, trimmed),
                Section::Context => {
                    if let Some(last) = contexts.last_mut() {
                        push_section_line(last, trimmed);
                    }
                }
                Section::Example => {
                    if let Some(last) = examples.last_mut() {
                        push_section_line(last, trimmed);
                    }
                }
                Section::None => {}
            }
        }
    }

    if !closed {
        anyhow::bail!("@ai({key}) block is missing a closing @end");
    }

    contexts.retain(|c| !c.is_empty());
    examples.retain(|e| !e.is_empty());

    Ok(AiEntry {
        key: key.to_string(),
        prompt: prompt.trim().to_string(),
        contexts,
        examples,
    })
}

fn push_section_line(buf: &mut String, line: &str) {
    if line.is_empty() {
        return;
    }
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}

/// Loads an answers file (`{"<key>": "<string>"}`). Non-string scalars are
/// stringified; structured values are rejected.
pub fn load_answers(path: &Path) -> anyhow::Result<AiAnswers> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read answers file '{}'", path.display()))?;
    let value: JsonValue = serde_json::from_str(&contents)
        .with_context(|| format!("answers file '{}' is not valid JSON", path.display()))?;

    let object = value
        .as_object()
        .with_context(|| format!("answers file '{}' must be a JSON object", path.display()))?;

    let mut answers = AiAnswers::new();
    for (key, value) in object {
        let answer = match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            other => anyhow::bail!(
                "answers file '{}': value for '{}' must be a string, got {}",
                path.display(),
                key,
                other
            ),
        };
        answers.insert(key.clone(), answer);
    }
    Ok(answers)
}
