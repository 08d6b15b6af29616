//! Boundaries the engine consumes but does not own: template rendering, file
//! writes, interactive prompts, the AI transport, and generator package
//! lookup. The engine depends only on these traits; default implementations
//! live in the submodules.

pub mod prompt;
pub mod sink;
pub mod template;
pub mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::ai::{AiCollector, AiState};
use crate::recipe::VariableSpec;

/// Frontmatter block parsed from a rendered template
/// (`---\nto: path\n---` ahead of the body).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Frontmatter {
    /// Target path, relative to the project root.
    pub to: Option<String>,
    #[serde(default)]
    pub inject: bool,
    pub after: Option<String>,
    pub before: Option<String>,
    /// Expression gating the write; false means the template produces no
    /// files, which is not a failure.
    pub condition: Option<String>,
}

/// Result of rendering one template source.
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub body: String,
    pub frontmatter: Option<Frontmatter>,
}

/// Renders template sources. May call `AiCollector::record` through the
/// [`AiState`] when collect mode is active.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    async fn render(
        &self,
        source: &Path,
        data: &JsonValue,
        ai: &AiState,
    ) -> anyhow::Result<Rendered>;
}

/// How a file write treats an existing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Skip,
    Prompt,
    Inject,
}

/// Where injected content lands relative to an anchor line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectAnchor {
    After(String),
    Before(String),
    Append,
}

/// What a sink operation actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Overwritten,
    Skipped,
    Injected,
    Unchanged,
}

/// Writes files on behalf of tool handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn write(&self, path: &Path, body: &str, mode: WriteMode)
        -> anyhow::Result<WriteOutcome>;

    async fn inject(
        &self,
        path: &Path,
        body: &str,
        anchor: &InjectAnchor,
    ) -> anyhow::Result<WriteOutcome>;

    /// Returns true when the file existed and was removed.
    async fn delete(&self, path: &Path) -> anyhow::Result<bool>;
}

/// Interactive questions during variable resolution and overwrite decisions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Asks for a raw value; coercion happens in the resolver afterwards.
    async fn ask(&self, name: &str, spec: &VariableSpec) -> anyhow::Result<JsonValue>;

    async fn confirm(&self, question: &str) -> anyhow::Result<bool>;
}

/// Context handed to the transport alongside the collector.
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub recipe_name: String,
    pub recipe_description: String,
    pub working_dir: PathBuf,
}

/// What the transport did with the collected prompts.
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    /// Answers keyed by collector entry key; the engine re-runs as Pass 2.
    Resolved(crate::ai::AiAnswers),
    /// The transport handed the prompts to the user; the engine exits with
    /// this code and the user re-runs with `--answers`.
    Deferred { exit_code: i32 },
}

/// Delivers collected AI prompts and returns answers, or defers to the user.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn resolve(
        &self,
        collector: &AiCollector,
        ctx: &TransportContext,
    ) -> anyhow::Result<TransportOutcome>;
}

/// Maps globally installed generator package names to local directories.
#[cfg_attr(test, mockall::automock)]
pub trait PackageResolver: Send + Sync {
    fn local_path_for(&self, package_name: &str) -> Option<PathBuf>;
}

/// Resolver that knows no global packages; discovery then only sees local
/// kits.
#[derive(Debug, Default)]
pub struct NoPackages;

impl PackageResolver for NoPackages {
    fn local_path_for(&self, _package_name: &str) -> Option<PathBuf> {
        None
    }
}

/// Bundle of port implementations handed to the engine.
#[derive(Clone)]
pub struct Ports {
    pub template: Arc<dyn TemplateEngine>,
    pub sink: Arc<dyn FileSink>,
    pub prompter: Arc<dyn Prompter>,
    pub transport: Arc<dyn Transport>,
    pub packages: Arc<dyn PackageResolver>,
}

impl Ports {
    /// The default local wiring: handlebars rendering, filesystem writes,
    /// terminal prompts, and the stdout transport.
    pub fn local_defaults(project_root: &Path, dry_run: bool) -> Self {
        Self {
            template: Arc::new(template::HandlebarsEngine::new()),
            sink: Arc::new(sink::FsSink::new(project_root, dry_run)),
            prompter: Arc::new(prompt::TermPrompter::new()),
            transport: Arc::new(transport::StdoutTransport::new()),
            packages: Arc::new(NoPackages),
        }
    }
}
