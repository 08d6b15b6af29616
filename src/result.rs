use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use rand::distr::{Alphanumeric, SampleString};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::recipe::ToolKind;

/// Execution state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Error attached to a failed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StepError {
    pub fn tool(message: impl Into<String>) -> Self {
        Self {
            kind: "tool".into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn tool_with_cause(message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind: "tool".into(),
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn condition(message: impl Into<String>) -> Self {
        Self {
            kind: "condition".into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: "timeout".into(),
            message: format!("step exceeded timeout of {timeout_ms}ms"),
            cause: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: "cancelled".into(),
            message: "run was cancelled".into(),
            cause: None,
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of one step. Owned by the executor while running and read-only
/// once the step terminates; downstream steps see it through the
/// `stepResults.<name>` scope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_name: String,
    pub tool: ToolKind,
    pub status: StepStatus,
    pub started_at: u64,
    pub ended_at: u64,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Whether every dependency completed; false marks an upstream-failure skip.
    pub dependencies_satisfied: bool,
    /// Result of the `when` expression, when one was declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepResult {
    pub fn new(step_name: impl Into<String>, tool: ToolKind) -> Self {
        Self {
            step_name: step_name.into(),
            tool,
            status: StepStatus::Pending,
            started_at: 0,
            ended_at: 0,
            duration_ms: 0,
            retry_count: 0,
            files_created: Vec::new(),
            files_modified: Vec::new(),
            files_deleted: Vec::new(),
            output: None,
            error: None,
            dependencies_satisfied: true,
            condition_result: None,
            skip_reason: None,
        }
    }

    pub fn skipped(step_name: impl Into<String>, tool: ToolKind, reason: &str) -> Self {
        let mut result = Self::new(step_name, tool);
        result.status = StepStatus::Skipped;
        result.skip_reason = Some(reason.to_string());
        result
    }
}

/// Ordered map of step name to result, in completion order.
pub type StepResults = IndexMap<String, StepResult>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeMetadata {
    pub started_at: u64,
    pub ended_at: u64,
    pub duration_ms: u64,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub working_dir: PathBuf,
    pub execution_id: String,
}

/// Aggregated outcome of one recipe run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeResult {
    pub success: bool,
    pub step_results: StepResults,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub variables: IndexMap<String, JsonValue>,
    pub metadata: RecipeMetadata,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn new_execution_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 12)
}

/// Merges per-step results into a recipe result.
///
/// File lists keep set semantics in first-appearance order, and a path is
/// never reported in two lists at once: the most recent operation on a path
/// wins (a file created and later deleted appears only in `files_deleted`).
pub fn aggregate(
    step_results: StepResults,
    variables: IndexMap<String, JsonValue>,
    warnings: Vec<String>,
    started_at: u64,
    working_dir: PathBuf,
    execution_id: String,
) -> RecipeResult {
    let mut created: Vec<PathBuf> = Vec::new();
    let mut modified: Vec<PathBuf> = Vec::new();
    let mut deleted: Vec<PathBuf> = Vec::new();
    let mut errors = Vec::new();

    let mut completed = 0;
    let mut failed = 0;
    let mut skipped = 0;

    for result in step_results.values() {
        match result.status {
            StepStatus::Completed => completed += 1,
            StepStatus::Failed => {
                failed += 1;
                let message = result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                errors.push(format!("{}: {}", result.step_name, message));
            }
            StepStatus::Skipped => skipped += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }

        for path in &result.files_created {
            record(path, &mut created, &mut [&mut modified, &mut deleted]);
        }
        for path in &result.files_modified {
            record(path, &mut modified, &mut [&mut created, &mut deleted]);
        }
        for path in &result.files_deleted {
            record(path, &mut deleted, &mut [&mut created, &mut modified]);
        }
    }

    let ended_at = now_millis();
    let total_steps = step_results.len();

    RecipeResult {
        success: failed == 0,
        step_results,
        files_created: created,
        files_modified: modified,
        files_deleted: deleted,
        errors,
        warnings,
        variables,
        metadata: RecipeMetadata {
            started_at,
            ended_at,
            duration_ms: ended_at.saturating_sub(started_at),
            total_steps,
            completed_steps: completed,
            failed_steps: failed,
            skipped_steps: skipped,
            working_dir,
            execution_id,
        },
    }
}

fn record(path: &PathBuf, target: &mut Vec<PathBuf>, others: &mut [&mut Vec<PathBuf>]) {
    for other in others.iter_mut() {
        other.retain(|p| p != path);
    }
    if !target.contains(path) {
        target.push(path.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(name: &str) -> StepResult {
        let mut r = StepResult::new(name, ToolKind::Template);
        r.status = StepStatus::Completed;
        r
    }

    #[test]
    fn file_lists_are_set_valued() {
        let mut a = completed("a");
        a.files_created = vec!["x.txt".into(), "y.txt".into()];
        let mut b = completed("b");
        b.files_created = vec!["x.txt".into()];

        let mut results = StepResults::new();
        results.insert("a".into(), a);
        results.insert("b".into(), b);

        let agg = aggregate(
            results,
            IndexMap::new(),
            vec![],
            0,
            PathBuf::from("."),
            "id".into(),
        );
        assert_eq!(agg.files_created, vec![PathBuf::from("x.txt"), PathBuf::from("y.txt")]);
    }

    #[test]
    fn created_then_deleted_appears_only_in_deleted() {
        let mut a = completed("a");
        a.files_created = vec!["x.txt".into()];
        let mut b = completed("b");
        b.files_deleted = vec!["x.txt".into()];

        let mut results = StepResults::new();
        results.insert("a".into(), a);
        results.insert("b".into(), b);

        let agg = aggregate(
            results,
            IndexMap::new(),
            vec![],
            0,
            PathBuf::from("."),
            "id".into(),
        );
        assert!(agg.files_created.is_empty());
        assert_eq!(agg.files_deleted, vec![PathBuf::from("x.txt")]);
    }

    #[test]
    fn failed_step_appears_in_errors_exactly_once() {
        let mut a = StepResult::new("a", ToolKind::Action);
        a.status = StepStatus::Failed;
        a.error = Some(StepError::tool("boom"));

        let mut results = StepResults::new();
        results.insert("a".into(), a);

        let agg = aggregate(
            results,
            IndexMap::new(),
            vec![],
            0,
            PathBuf::from("."),
            "id".into(),
        );
        assert!(!agg.success);
        assert_eq!(agg.errors, vec!["a: boom"]);
        assert_eq!(agg.metadata.failed_steps, 1);
    }

    #[test]
    fn counts_reflect_statuses() {
        let mut results = StepResults::new();
        results.insert("a".into(), completed("a"));
        results.insert(
            "b".into(),
            StepResult::skipped("b", ToolKind::Template, "condition false"),
        );

        let agg = aggregate(
            results,
            IndexMap::new(),
            vec![],
            0,
            PathBuf::from("."),
            "id".into(),
        );
        assert!(agg.success);
        assert_eq!(agg.metadata.completed_steps, 1);
        assert_eq!(agg.metadata.skipped_steps, 1);
        assert_eq!(agg.metadata.total_steps, 2);
    }
}
