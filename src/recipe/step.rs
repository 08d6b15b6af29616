use serde::Deserialize;
use serde_json::Value as JsonValue;

fn bool_true_default() -> bool {
    true
}

/// One unit of work within a recipe. The tool payload determines how the step
/// executes; the common fields drive gating, ordering and retry behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,

    /// Condition expression; the step is skipped when it evaluates false.
    pub when: Option<String>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Whether this step may share a phase's parallel execution. A single
    /// `parallel: false` step degrades its whole phase to serial.
    #[serde(default = "bool_true_default")]
    pub parallel: bool,

    #[serde(default)]
    pub retries: u32,

    pub timeout_ms: Option<u64>,

    #[serde(flatten)]
    pub tool: ToolSpec,
}

/// Tool-specific payload of a step, tagged by the `tool` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", rename_all = "lowercase")]
pub enum ToolSpec {
    Template {
        /// Template file path, resolved relative to the recipe directory.
        source: String,
        /// Target path override; frontmatter `to` is used when absent.
        to: Option<String>,
    },
    Action {
        action: String,
        #[serde(default)]
        params: JsonValue,
    },
    Codemod {
        /// File path or glob, relative to the project root.
        target: String,
        transform: String,
        #[serde(default)]
        params: JsonValue,
    },
    Recipe {
        /// Child recipe path segments, resolved relative to the recipe dir.
        path: String,
        #[serde(default)]
        params: JsonValue,
    },
}

impl ToolSpec {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolSpec::Template { .. } => ToolKind::Template,
            ToolSpec::Action { .. } => ToolKind::Action,
            ToolSpec::Codemod { .. } => ToolKind::Codemod,
            ToolSpec::Recipe { .. } => ToolKind::Recipe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Template,
    Action,
    Codemod,
    Recipe,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolKind::Template => "template",
            ToolKind::Action => "action",
            ToolKind::Codemod => "codemod",
            ToolKind::Recipe => "recipe",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_template_step() {
        let yaml = r#"
name: make-model
tool: template
source: model.hbs
to: src/model.rs
dependsOn: [setup]
retries: 2
timeoutMs: 5000
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.name, "make-model");
        assert_eq!(step.depends_on, vec!["setup"]);
        assert_eq!(step.retries, 2);
        assert_eq!(step.timeout_ms, Some(5000));
        assert!(step.parallel);
        match step.tool {
            ToolSpec::Template { ref source, ref to } => {
                assert_eq!(source, "model.hbs");
                assert_eq!(to.as_deref(), Some("src/model.rs"));
            }
            _ => panic!("expected template tool"),
        }
    }

    #[test]
    fn parses_action_step_with_params() {
        let yaml = r#"
name: install
tool: action
action: shell
params:
  command: echo hi
parallel: false
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert!(!step.parallel);
        match step.tool {
            ToolSpec::Action { ref action, ref params } => {
                assert_eq!(action, "shell");
                assert_eq!(params["command"], "echo hi");
            }
            _ => panic!("expected action tool"),
        }
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let yaml = "name: x\ntool: magic\n";
        assert!(serde_yaml::from_str::<Step>(yaml).is_err());
    }
}
