//! Action tool: look up a registered function by name and invoke it with
//! the step's interpolated params. Actions are trusted code.

use super::{interpolate_value, ToolCtx, ToolOutcome};
use crate::recipe::ToolSpec;
use crate::registry::ActionInvocation;
use crate::result::StepError;

pub async fn run(ctx: &ToolCtx) -> Result<ToolOutcome, StepError> {
    let ToolSpec::Action { action, params } = &ctx.step.tool else {
        return Err(StepError::tool("step is not an action step"));
    };

    let Some(function) = ctx.registries.lookup_action(action) else {
        return Err(StepError::tool(format!(
            "unknown action '{action}'; registered actions: {}",
            ctx.registries.action_names().join(", ")
        )));
    };

    let params = interpolate_value(params, &ctx.scope());

    let output = function(ActionInvocation {
        variables: ctx.env.clone(),
        params,
        project_root: ctx.project_root.clone(),
        cancel: ctx.cancel.clone(),
    })
    .await
    .map_err(|e| StepError::tool_with_cause(format!("action '{action}' failed"), e.to_string()))?;

    Ok(ToolOutcome {
        output: output.output,
        files_created: output.files_created,
        files_modified: output.files_modified,
        files_deleted: output.files_deleted,
    })
}
