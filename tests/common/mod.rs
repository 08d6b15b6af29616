#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use hypergen::ai::{AiAnswers, AiCollector};
use hypergen::engine::{Engine, RunOptions, RunParams};
use hypergen::ports::{
    sink::FsSink, template::HandlebarsEngine, NoPackages, Ports, Prompter, Transport,
    TransportContext, TransportOutcome,
};
use hypergen::recipe::VariableSpec;
use hypergen::registry::Registries;
use hypergen::variables::AskMode;

/// Transport that answers every collected entry from a fixed map.
pub struct AnswersTransport(pub AiAnswers);

#[async_trait]
impl Transport for AnswersTransport {
    async fn resolve(
        &self,
        _collector: &AiCollector,
        _ctx: &TransportContext,
    ) -> anyhow::Result<TransportOutcome> {
        Ok(TransportOutcome::Resolved(self.0.clone()))
    }
}

/// Transport that always defers, like the stdout default but silent.
pub struct DeferringTransport;

#[async_trait]
impl Transport for DeferringTransport {
    async fn resolve(
        &self,
        _collector: &AiCollector,
        _ctx: &TransportContext,
    ) -> anyhow::Result<TransportOutcome> {
        Ok(TransportOutcome::Deferred { exit_code: 2 })
    }
}

/// Prompter for non-interactive tests; being asked at all is a failure.
pub struct NoPrompt;

#[async_trait]
impl Prompter for NoPrompt {
    async fn ask(&self, name: &str, _spec: &VariableSpec) -> anyhow::Result<JsonValue> {
        anyhow::bail!("unexpected prompt for '{name}' in test")
    }

    async fn confirm(&self, _question: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

pub fn engine_with_transport(root: &Path, transport: Arc<dyn Transport>) -> Engine {
    let ports = Ports {
        template: Arc::new(HandlebarsEngine::new()),
        sink: Arc::new(FsSink::new(root, false)),
        prompter: Arc::new(NoPrompt),
        transport,
        packages: Arc::new(NoPackages),
    };
    Engine::new(ports, Registries::with_builtins())
}

pub fn engine(root: &Path) -> Engine {
    engine_with_transport(root, Arc::new(DeferringTransport))
}

pub fn nobody_options() -> RunOptions {
    RunOptions {
        ask: AskMode::Nobody,
        verbose: true,
        ..Default::default()
    }
}

pub fn params_with(options: RunOptions) -> RunParams {
    RunParams {
        options,
        ..Default::default()
    }
}

/// Writes `recipe/recipe.yml` (and nothing else) under the given root.
pub fn write_recipe(root: &Path, yaml: &str) -> PathBuf {
    let dir = root.join("recipe");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("recipe.yml"), yaml).unwrap();
    dir
}

pub fn write_template(root: &Path, name: &str, contents: &str) {
    let path = root.join("recipe").join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}
