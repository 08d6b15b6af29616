//! Codemod tool: apply a named transform to every project file matching the
//! target glob. Files the transform leaves unchanged are not reported as
//! modified.

use std::path::PathBuf;

use globset::GlobBuilder;
use ignore::WalkBuilder;
use serde_json::json;

use super::{interpolate_value, ToolCtx, ToolOutcome};
use crate::ports::WriteMode;
use crate::recipe::ToolSpec;
use crate::registry::{TransformInvocation, TransformResult};
use crate::result::StepError;

pub async fn run(ctx: &ToolCtx) -> Result<ToolOutcome, StepError> {
    let ToolSpec::Codemod {
        target,
        transform,
        params,
    } = &ctx.step.tool
    else {
        return Err(StepError::tool("step is not a codemod step"));
    };

    let Some(transform_fn) = ctx.registries.lookup_transform(transform) else {
        return Err(StepError::tool(format!("unknown transform '{transform}'")));
    };

    let pattern = ctx.render_text(target);
    let matcher = GlobBuilder::new(&pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| StepError::tool(format!("invalid target glob '{pattern}': {e}")))?
        .compile_matcher();

    let params = interpolate_value(params, &ctx.scope());

    // Deterministic order: collect matches, then sort.
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in WalkBuilder::new(&ctx.project_root)
        .add_custom_ignore_filename(".hyperignore")
        .build()
        .flatten()
    {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&ctx.project_root) else {
            continue;
        };
        if matcher.is_match(rel) {
            matches.push(rel.to_path_buf());
        }
    }
    matches.sort();

    let mut modified = Vec::new();
    let mut changed = 0usize;

    for rel in &matches {
        if ctx.cancel.is_cancelled() {
            return Err(StepError::cancelled());
        }

        let full = ctx.project_root.join(rel);
        let source = tokio::fs::read_to_string(&full).await.map_err(|e| {
            StepError::tool_with_cause(format!("cannot read '{}'", rel.display()), e.to_string())
        })?;

        let result = transform_fn(&TransformInvocation {
            source: &source,
            path: rel,
            params: &params,
            variables: &ctx.env,
        })
        .map_err(|e| {
            StepError::tool_with_cause(
                format!("transform '{transform}' failed on '{}'", rel.display()),
                e.to_string(),
            )
        })?;

        if let TransformResult::Changed(next) = result {
            changed += 1;
            if !ctx.ai.collect_mode {
                ctx.ports
                    .sink
                    .write(rel, &next, WriteMode::Overwrite)
                    .await
                    .map_err(|e| {
                        StepError::tool_with_cause(
                            format!("cannot write '{}'", rel.display()),
                            e.to_string(),
                        )
                    })?;
                modified.push(rel.clone());
            }
        }
    }

    Ok(ToolOutcome {
        output: Some(json!({ "matched": matches.len(), "changed": changed })),
        files_modified: modified,
        ..Default::default()
    })
}
