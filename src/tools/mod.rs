//! The four tool handlers a step dispatches to, plus shared plumbing for
//! parameter interpolation and project-root containment.

pub mod action;
pub mod codemod;
pub mod recipe;
pub mod template;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::ai::AiState;
use crate::condition::{interpolate, Scope};
use crate::engine::RunOptions;
use crate::ports::Ports;
use crate::recipe::{Step, ToolKind};
use crate::registry::Registries;
use crate::result::{StepError, StepResults};
use crate::variables::VariableEnvironment;

/// Everything a tool handler needs for one step execution. All fields are
/// owned or cheaply cloneable so the context can cross task boundaries.
#[derive(Clone)]
pub struct ToolCtx {
    pub step: Step,
    pub env: Arc<VariableEnvironment>,
    /// Immutable snapshot of results from earlier phases.
    pub snapshot: Arc<StepResults>,
    pub recipe_dir: PathBuf,
    pub project_root: PathBuf,
    pub ports: Ports,
    pub registries: Arc<Registries>,
    pub ai: AiState,
    pub opts: Arc<RunOptions>,
    pub cancel: CancellationToken,
}

impl ToolCtx {
    pub fn scope(&self) -> Scope<'_> {
        Scope::new(&self.env, &self.snapshot)
    }

    pub fn render_text(&self, text: &str) -> String {
        interpolate(text, &self.scope())
    }
}

/// File effects and output of one tool execution.
#[derive(Debug, Default)]
pub struct ToolOutcome {
    pub output: Option<JsonValue>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
}

/// Dispatches a step to its tool handler.
pub async fn dispatch(ctx: &ToolCtx) -> Result<ToolOutcome, StepError> {
    if ctx.cancel.is_cancelled() {
        return Err(StepError::cancelled());
    }
    match ctx.step.tool.kind() {
        ToolKind::Template => template::run(ctx).await,
        ToolKind::Action => action::run(ctx).await,
        ToolKind::Codemod => codemod::run(ctx).await,
        ToolKind::Recipe => recipe::run(ctx).await,
    }
}

/// Recursively substitutes `{{path}}` placeholders inside every string leaf
/// of a params value.
pub fn interpolate_value(value: &JsonValue, scope: &Scope<'_>) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(interpolate(s, scope)),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| interpolate_value(v, scope)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves a target path declared relative to the project root, rejecting
/// anything that escapes it.
pub fn ensure_within_root(project_root: &Path, target: &str) -> Result<PathBuf, StepError> {
    let unsafe_path = || {
        StepError::tool(format!(
            "unsafe path '{target}' resolves outside the project root"
        ))
    };

    let candidate = Path::new(target);
    if candidate.is_absolute() {
        return Err(unsafe_path());
    }

    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(unsafe_path());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_path()),
        }
    }

    let full = project_root.join(&normalized);
    match pathdiff::diff_paths(&full, project_root) {
        Some(rel) if !rel.starts_with("..") => Ok(rel),
        _ => Err(unsafe_path()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    #[test]
    fn interpolate_value_touches_only_strings() {
        let env = VariableEnvironment::new(IndexMap::from([(
            "name".to_string(),
            json!("widget"),
        )]));
        let steps = StepResults::new();
        let scope = Scope::new(&env, &steps);

        let params = json!({
            "greeting": "hi {{name}}",
            "count": 3,
            "nested": {"inner": "{{name}}"},
            "list": ["{{name}}", true]
        });
        let out = interpolate_value(&params, &scope);
        assert_eq!(out["greeting"], json!("hi widget"));
        assert_eq!(out["count"], json!(3));
        assert_eq!(out["nested"]["inner"], json!("widget"));
        assert_eq!(out["list"], json!(["widget", true]));
    }

    #[test]
    fn paths_inside_root_are_accepted() {
        let root = Path::new("/project");
        assert_eq!(
            ensure_within_root(root, "src/lib.rs").unwrap(),
            PathBuf::from("src/lib.rs")
        );
        assert_eq!(
            ensure_within_root(root, "./a/../b.txt").unwrap(),
            PathBuf::from("b.txt")
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let root = Path::new("/project");
        assert!(ensure_within_root(root, "../outside.txt").is_err());
        assert!(ensure_within_root(root, "a/../../outside.txt").is_err());
        assert!(ensure_within_root(root, "/etc/passwd").is_err());
    }
}
