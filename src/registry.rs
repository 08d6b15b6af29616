//! Process-wide registries for action functions and codemod transforms.
//! Both are populated once at engine construction and treated as immutable
//! afterwards; duplicate names are rejected at registration time.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use crate::variables::VariableEnvironment;

/// Context handed to an action function. Actions run arbitrary code and are
/// trusted; file effects they cause must be reported back in the output.
pub struct ActionInvocation {
    pub variables: Arc<VariableEnvironment>,
    pub params: JsonValue,
    pub project_root: PathBuf,
    pub cancel: CancellationToken,
}

/// File effects and output reported by an action.
#[derive(Debug, Default)]
pub struct ActionOutput {
    pub output: Option<JsonValue>,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
}

pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<ActionOutput>> + Send>>;
pub type ActionFn = Arc<dyn Fn(ActionInvocation) -> ActionFuture + Send + Sync>;

/// Context handed to a codemod transform for one matched file.
pub struct TransformInvocation<'a> {
    pub source: &'a str,
    pub path: &'a std::path::Path,
    pub params: &'a JsonValue,
    pub variables: &'a VariableEnvironment,
}

/// A transform either rewrites the source or reports no change; unchanged
/// files never appear in a step's modified list.
#[derive(Debug, PartialEq, Eq)]
pub enum TransformResult {
    Changed(String),
    Unchanged,
}

pub type TransformFn =
    Arc<dyn Fn(&TransformInvocation<'_>) -> anyhow::Result<TransformResult> + Send + Sync>;

/// Registering a name twice is always a programming error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRegistration {
    pub kind: &'static str,
    pub name: String,
}

impl std::fmt::Display for DuplicateRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "duplicate {} '{}'", self.kind, self.name)
    }
}

impl std::error::Error for DuplicateRegistration {}

/// Registries keyed by name, mirroring each other for actions and
/// transforms.
#[derive(Default)]
pub struct Registries {
    actions: BTreeMap<String, ActionFn>,
    transforms: BTreeMap<String, TransformFn>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registries pre-loaded with the builtin actions (`shell`, `mkdir`,
    /// `delete`) and transforms (`replace`, `append`, `prepend`,
    /// `insert-after`).
    pub fn with_builtins() -> Self {
        let mut registries = Self::new();
        register_builtin_actions(&mut registries).expect("builtin action names are unique");
        register_builtin_transforms(&mut registries).expect("builtin transform names are unique");
        registries
    }

    pub fn register_action(
        &mut self,
        name: &str,
        action: ActionFn,
    ) -> Result<(), DuplicateRegistration> {
        if self.actions.contains_key(name) {
            return Err(DuplicateRegistration {
                kind: "action",
                name: name.to_string(),
            });
        }
        self.actions.insert(name.to_string(), action);
        Ok(())
    }

    pub fn register_transform(
        &mut self,
        name: &str,
        transform: TransformFn,
    ) -> Result<(), DuplicateRegistration> {
        if self.transforms.contains_key(name) {
            return Err(DuplicateRegistration {
                kind: "transform",
                name: name.to_string(),
            });
        }
        self.transforms.insert(name.to_string(), transform);
        Ok(())
    }

    pub fn lookup_action(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).cloned()
    }

    pub fn lookup_transform(&self, name: &str) -> Option<TransformFn> {
        self.transforms.get(name).cloned()
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Drops all registrations. Tests reset state between runs with this.
    pub fn clear(&mut self) {
        self.actions.clear();
        self.transforms.clear();
    }
}

fn register_builtin_actions(registries: &mut Registries) -> Result<(), DuplicateRegistration> {
    registries.register_action(
        "shell",
        Arc::new(|inv: ActionInvocation| Box::pin(shell_action(inv)) as ActionFuture),
    )?;
    registries.register_action(
        "mkdir",
        Arc::new(|inv: ActionInvocation| Box::pin(mkdir_action(inv)) as ActionFuture),
    )?;
    registries.register_action(
        "delete",
        Arc::new(|inv: ActionInvocation| Box::pin(delete_action(inv)) as ActionFuture),
    )?;
    Ok(())
}

fn param_str<'a>(params: &'a JsonValue, key: &str) -> anyhow::Result<&'a str> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing required string param '{key}'"))
}

/// Runs a command through `sh -c`, streaming output into the step's output
/// value. A non-zero exit code fails the action.
async fn shell_action(inv: ActionInvocation) -> anyhow::Result<ActionOutput> {
    let command = param_str(&inv.params, "command")?.to_string();
    let cwd = inv
        .params
        .get("cwd")
        .and_then(JsonValue::as_str)
        .map(|c| inv.project_root.join(c))
        .unwrap_or_else(|| inv.project_root.clone());

    log::debug!("shell action: {command}");

    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("could not spawn '{command}': {e}"))?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let collect = |reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>| async move {
        let mut lines = tokio::io::BufReader::new(reader).lines();
        let mut buf = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            buf.push_str(&line);
            buf.push('\n');
        }
        buf
    };

    let stdout_task = tokio::spawn(collect(Box::new(stdout)));
    let stderr_task = tokio::spawn(collect(Box::new(stderr)));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = inv.cancel.cancelled() => {
            child.kill().await.ok();
            anyhow::bail!("shell command cancelled");
        }
    };

    let stdout_text = stdout_task.await.unwrap_or_default();
    let stderr_text = stderr_task.await.unwrap_or_default();

    if !status.success() {
        anyhow::bail!(
            "command '{command}' exited with {status}: {}",
            stderr_text.trim()
        );
    }

    Ok(ActionOutput {
        output: Some(json!({
            "stdout": stdout_text.trim_end(),
            "exitCode": status.code().unwrap_or(0),
        })),
        ..Default::default()
    })
}

async fn mkdir_action(inv: ActionInvocation) -> anyhow::Result<ActionOutput> {
    let path = param_str(&inv.params, "path")?;
    let full = inv.project_root.join(path);
    let existed = full.exists();
    tokio::fs::create_dir_all(&full).await?;

    let mut output = ActionOutput {
        output: Some(json!({ "path": path })),
        ..Default::default()
    };
    if !existed {
        output.files_created.push(PathBuf::from(path));
    }
    Ok(output)
}

async fn delete_action(inv: ActionInvocation) -> anyhow::Result<ActionOutput> {
    let path = param_str(&inv.params, "path")?;
    let full = inv.project_root.join(path);

    let mut output = ActionOutput {
        output: Some(json!({ "path": path })),
        ..Default::default()
    };
    if full.is_file() {
        tokio::fs::remove_file(&full).await?;
        output.files_deleted.push(PathBuf::from(path));
    } else if full.is_dir() {
        tokio::fs::remove_dir_all(&full).await?;
        output.files_deleted.push(PathBuf::from(path));
    }
    Ok(output)
}

fn register_builtin_transforms(registries: &mut Registries) -> Result<(), DuplicateRegistration> {
    registries.register_transform(
        "replace",
        Arc::new(|inv: &TransformInvocation<'_>| {
            let pattern = param_str(inv.params, "pattern")?;
            let replacement = param_str(inv.params, "with")?;
            let re = regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid pattern '{pattern}': {e}"))?;
            if !re.is_match(inv.source) {
                return Ok(TransformResult::Unchanged);
            }
            Ok(TransformResult::Changed(
                re.replace_all(inv.source, replacement).into_owned(),
            ))
        }),
    )?;

    registries.register_transform(
        "append",
        Arc::new(|inv: &TransformInvocation<'_>| {
            let text = param_str(inv.params, "text")?;
            if inv.source.contains(text) {
                return Ok(TransformResult::Unchanged);
            }
            let mut next = inv.source.to_string();
            if !next.is_empty() && !next.ends_with('\n') {
                next.push('\n');
            }
            next.push_str(text);
            next.push('\n');
            Ok(TransformResult::Changed(next))
        }),
    )?;

    registries.register_transform(
        "prepend",
        Arc::new(|inv: &TransformInvocation<'_>| {
            let text = param_str(inv.params, "text")?;
            if inv.source.contains(text) {
                return Ok(TransformResult::Unchanged);
            }
            Ok(TransformResult::Changed(format!("{text}\n{}", inv.source)))
        }),
    )?;

    registries.register_transform(
        "insert-after",
        Arc::new(|inv: &TransformInvocation<'_>| {
            let anchor = param_str(inv.params, "anchor")?;
            let text = param_str(inv.params, "text")?;
            if inv.source.contains(text) {
                return Ok(TransformResult::Unchanged);
            }
            let mut out = String::with_capacity(inv.source.len() + text.len() + 1);
            let mut inserted = false;
            for line in inv.source.lines() {
                out.push_str(line);
                out.push('\n');
                if !inserted && line.contains(anchor) {
                    out.push_str(text);
                    out.push('\n');
                    inserted = true;
                }
            }
            if !inserted {
                anyhow::bail!("anchor '{anchor}' not found");
            }
            Ok(TransformResult::Changed(out))
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn env() -> VariableEnvironment {
        VariableEnvironment::new(IndexMap::new())
    }

    fn transform(
        registries: &Registries,
        name: &str,
        source: &str,
        params: JsonValue,
    ) -> anyhow::Result<TransformResult> {
        let env = env();
        let f = registries.lookup_transform(name).unwrap();
        f(&TransformInvocation {
            source,
            path: std::path::Path::new("file.txt"),
            params: &params,
            variables: &env,
        })
    }

    #[test]
    fn duplicate_action_is_rejected() {
        let mut registries = Registries::with_builtins();
        let err = registries
            .register_action(
                "shell",
                Arc::new(|_| Box::pin(async { Ok(ActionOutput::default()) }) as ActionFuture),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "duplicate action 'shell'");
    }

    #[test]
    fn unknown_lookup_returns_none() {
        let registries = Registries::new();
        assert!(registries.lookup_action("shell").is_none());
        assert!(registries.lookup_transform("replace").is_none());
    }

    #[test]
    fn replace_transform_reports_unchanged_without_match() {
        let registries = Registries::with_builtins();
        let result = transform(
            &registries,
            "replace",
            "hello world",
            json!({"pattern": "absent", "with": "x"}),
        )
        .unwrap();
        assert_eq!(result, TransformResult::Unchanged);

        let result = transform(
            &registries,
            "replace",
            "hello world",
            json!({"pattern": "world", "with": "there"}),
        )
        .unwrap();
        assert_eq!(result, TransformResult::Changed("hello there".into()));
    }

    #[test]
    fn append_is_idempotent() {
        let registries = Registries::with_builtins();
        let once = transform(
            &registries,
            "append",
            "line1\n",
            json!({"text": "line2"}),
        )
        .unwrap();
        let TransformResult::Changed(next) = once else {
            panic!("expected change");
        };
        assert_eq!(next, "line1\nline2\n");

        let twice = transform(&registries, "append", &next, json!({"text": "line2"})).unwrap();
        assert_eq!(twice, TransformResult::Unchanged);
    }

    #[test]
    fn insert_after_requires_anchor() {
        let registries = Registries::with_builtins();
        let result = transform(
            &registries,
            "insert-after",
            "mod a;\nmod b;\n",
            json!({"anchor": "mod a;", "text": "mod new;"}),
        )
        .unwrap();
        assert_eq!(
            result,
            TransformResult::Changed("mod a;\nmod new;\nmod b;\n".into())
        );

        let err = transform(
            &registries,
            "insert-after",
            "nothing here\n",
            json!({"anchor": "mod z;", "text": "mod new;"}),
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn shell_action_captures_stdout() {
        let registries = Registries::with_builtins();
        let action = registries.lookup_action("shell").unwrap();
        let out = action(ActionInvocation {
            variables: Arc::new(env()),
            params: json!({"command": "echo hello"}),
            project_root: std::env::temp_dir(),
            cancel: CancellationToken::new(),
        })
        .await
        .unwrap();
        assert_eq!(out.output.unwrap()["stdout"], "hello");
    }

    #[tokio::test]
    async fn shell_action_fails_on_nonzero_exit() {
        let registries = Registries::with_builtins();
        let action = registries.lookup_action("shell").unwrap();
        let err = action(ActionInvocation {
            variables: Arc::new(env()),
            params: json!({"command": "exit 3"}),
            project_root: std::env::temp_dir(),
            cancel: CancellationToken::new(),
        })
        .await;
        assert!(err.is_err());
    }
}
