//! Nested-recipe tool: resolve the child recipe, pass the step's params as
//! its only variables, and bubble its file lists up into this step's
//! outcome. Child step results stay invisible to parent siblings.

use std::future::Future;
use std::pin::Pin;

use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};

use super::{interpolate_value, ToolCtx, ToolOutcome};
use crate::recipe::ToolSpec;
use crate::result::{RecipeResult, StepError};

pub async fn run(ctx: &ToolCtx) -> Result<ToolOutcome, StepError> {
    let ToolSpec::Recipe { path, params } = &ctx.step.tool else {
        return Err(StepError::tool("step is not a recipe step"));
    };

    let rel = ctx.render_text(path);
    let child_dir = resolve_child_dir(ctx, &rel)?;

    let params = interpolate_value(params, &ctx.scope());
    let child_vars: IndexMap<String, JsonValue> = match params {
        JsonValue::Null => IndexMap::new(),
        JsonValue::Object(map) => map.into_iter().collect(),
        other => {
            return Err(StepError::tool(format!(
                "recipe step params must be an object, got {other}"
            )));
        }
    };

    // Boxing breaks the recursion engine -> tool -> engine for the compiler.
    let fut: Pin<Box<dyn Future<Output = Result<RecipeResult, StepError>> + Send>> =
        Box::pin(crate::engine::run_child(ctx.clone(), child_dir, child_vars));
    let child = fut.await?;

    if !child.success {
        return Err(StepError::tool_with_cause(
            format!("child recipe '{rel}' failed"),
            child.errors.join("; "),
        ));
    }

    Ok(ToolOutcome {
        output: Some(json!({
            "recipe": rel,
            "completedSteps": child.metadata.completed_steps,
            "skippedSteps": child.metadata.skipped_steps,
        })),
        files_created: child.files_created,
        files_modified: child.files_modified,
        files_deleted: child.files_deleted,
    })
}

fn resolve_child_dir(ctx: &ToolCtx, rel: &str) -> Result<std::path::PathBuf, StepError> {
    // direct paths relative to the recipe dir win over namespace lookup
    let direct = ctx.recipe_dir.join(rel);
    if direct.join("recipe.yml").is_file() {
        return Ok(direct);
    }
    if direct.is_file() {
        return Ok(direct
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or(direct.clone()));
    }

    let segments: Vec<String> = rel.split_whitespace().map(str::to_string).collect();
    match crate::discovery::resolve(&segments, &ctx.project_root, &*ctx.ports.packages) {
        Ok(resolved) if resolved.kind == crate::discovery::ResolvedKind::Recipe => {
            Ok(resolved.full_path)
        }
        Ok(_) => Err(StepError::tool(format!(
            "'{rel}' resolved to a recipe group, expected a single recipe"
        ))),
        Err(e) => Err(StepError::tool(format!(
            "child recipe '{rel}' not found: {e}"
        ))),
    }
}
