//! Template tool: render a source through the template port, honor the
//! frontmatter, and hand the body to the file sink.

use serde_json::json;

use super::{ensure_within_root, ToolCtx, ToolOutcome};
use crate::condition;
use crate::ports::{InjectAnchor, WriteMode, WriteOutcome};
use crate::recipe::ToolSpec;
use crate::result::StepError;

pub async fn run(ctx: &ToolCtx) -> Result<ToolOutcome, StepError> {
    let ToolSpec::Template { source, to } = &ctx.step.tool else {
        return Err(StepError::tool("step is not a template step"));
    };

    let source_path = ctx.recipe_dir.join(ctx.render_text(source));
    let data = ctx
        .env
        .template_data(serde_json::to_value(&*ctx.snapshot).unwrap_or(json!({})));

    let rendered = ctx
        .ports
        .template
        .render(&source_path, &data, &ctx.ai)
        .await
        .map_err(|e| StepError::tool_with_cause("template rendering failed", e.to_string()))?;

    let frontmatter = rendered.frontmatter.unwrap_or_default();

    // A false frontmatter condition means this template produces no files;
    // that is not a failure.
    if let Some(expr) = &frontmatter.condition {
        let scope = ctx.scope();
        match condition::evaluate(expr, &scope) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(ToolOutcome {
                    output: Some(json!({ "written": false, "reason": "condition false" })),
                    ..Default::default()
                });
            }
            Err(e) => return Err(StepError::condition(e.to_string())),
        }
    }

    let target = to
        .as_ref()
        .map(|t| ctx.render_text(t))
        .or(frontmatter.to.clone());

    let Some(target) = target else {
        if rendered.body.trim().is_empty() {
            return Ok(ToolOutcome {
                output: Some(json!({ "written": false })),
                ..Default::default()
            });
        }
        return Err(StepError::tool(format!(
            "template '{source}' produced output but declared no target path"
        )));
    };

    // Pass 1 is a dry discovery: nothing is written in collect mode.
    if ctx.ai.collect_mode {
        return Ok(ToolOutcome {
            output: Some(json!({ "written": false, "collected": true, "to": target })),
            ..Default::default()
        });
    }

    let rel = ensure_within_root(&ctx.project_root, &target)?;
    let full = ctx.project_root.join(&rel);
    let exists = full.exists();

    let outcome = if frontmatter.inject
        || frontmatter.after.is_some()
        || frontmatter.before.is_some()
    {
        let anchor = if let Some(after) = frontmatter.after.clone() {
            InjectAnchor::After(after)
        } else if let Some(before) = frontmatter.before.clone() {
            InjectAnchor::Before(before)
        } else {
            InjectAnchor::Append
        };
        ctx.ports
            .sink
            .inject(&rel, &rendered.body, &anchor)
            .await
            .map_err(|e| StepError::tool_with_cause("inject failed", e.to_string()))?
    } else {
        let mode = if ctx.opts.force || !exists {
            WriteMode::Overwrite
        } else if ctx.opts.interactive() {
            let overwrite = ctx
                .ports
                .prompter
                .confirm(&format!("Overwrite {}?", rel.display()))
                .await
                .map_err(|e| StepError::tool_with_cause("prompt failed", e.to_string()))?;
            if overwrite {
                WriteMode::Overwrite
            } else {
                WriteMode::Skip
            }
        } else {
            WriteMode::Skip
        };
        ctx.ports
            .sink
            .write(&rel, &rendered.body, mode)
            .await
            .map_err(|e| StepError::tool_with_cause("write failed", e.to_string()))?
    };

    let mut result = ToolOutcome {
        output: Some(json!({
            "to": rel.display().to_string(),
            "outcome": format!("{outcome:?}").to_lowercase(),
        })),
        ..Default::default()
    };
    match outcome {
        WriteOutcome::Created => result.files_created.push(rel),
        WriteOutcome::Overwritten | WriteOutcome::Injected => result.files_modified.push(rel),
        WriteOutcome::Skipped | WriteOutcome::Unchanged => {}
    }
    Ok(result)
}
