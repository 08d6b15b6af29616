pub mod step;
pub mod variable;

pub use step::{Step, ToolKind, ToolSpec};
pub use variable::{VariableSpec, VariableType};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

/// The parsed form of a `recipe.yml`.
///
/// A `Recipe` is shared read-only with the planner and executor for the
/// duration of one run. Variable key order is significant only for positional
/// argument binding; step declaration order is the tie-break when dependencies
/// permit multiple orderings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub version: String,

    pub author: Option<String>,

    pub category: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub variables: IndexMap<String, VariableSpec>,

    #[serde(default)]
    pub steps: Vec<Step>,

    /// Directory containing the `recipe.yml`, set by the loader. Template
    /// sources and nested recipe paths resolve relative to it.
    #[serde(skip)]
    pub dir: PathBuf,
}

impl Recipe {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of variables that carry a `position`, ordered by position.
    pub fn positional_variables(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = self
            .variables
            .iter()
            .filter_map(|(name, spec)| spec.position.map(|p| (name.as_str(), p)))
            .collect();
        out.sort_by_key(|(_, p)| *p);
        out
    }
}

/// A single schema problem found while validating a recipe. Problems are
/// collected rather than failing on the first, so the user sees all of them
/// in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    pub location: Option<String>,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    fn at(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Some(location.into()),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {}", loc, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Why a recipe failed to load. Unparseable YAML fails fast; schema problems
/// are reported all at once.
#[derive(Debug)]
pub enum LoadError {
    Io(String),
    Parse(String),
    Invalid(Vec<ValidationError>),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(msg) => write!(f, "failed to read recipe: {msg}"),
            LoadError::Parse(msg) => write!(f, "failed to parse recipe YAML: {msg}"),
            LoadError::Invalid(errors) => {
                writeln!(f, "recipe failed validation:")?;
                for err in errors {
                    writeln!(f, "  - {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for LoadError {}

fn step_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]*$").unwrap())
}

/// Loads and validates a `recipe.yml`. The given path may be the file itself
/// or a directory containing one.
pub fn load(path: &Path) -> Result<Recipe, LoadError> {
    let file = if path.is_dir() {
        path.join("recipe.yml")
    } else {
        path.to_path_buf()
    };

    let contents = std::fs::read_to_string(&file)
        .map_err(|e| LoadError::Io(format!("{}: {e}", file.display())))?;

    let mut recipe: Recipe = serde_yaml::from_str(&contents).map_err(|e| {
        let loc = e
            .location()
            .map(|l| format!(" at line {}, column {}", l.line(), l.column()))
            .unwrap_or_default();
        LoadError::Parse(format!("{}{loc}: {e}", file.display()))
    })?;

    recipe.dir = file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let errors = validate(&recipe);
    if errors.is_empty() {
        Ok(recipe)
    } else {
        Err(LoadError::Invalid(errors))
    }
}

/// Validates a parsed recipe, returning every problem found.
pub fn validate(recipe: &Recipe) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if recipe.name.trim().is_empty() {
        errors.push(ValidationError::new("recipe name must not be empty"));
    }

    validate_steps(recipe, &mut errors);
    validate_variables(recipe, &mut errors);

    errors
}

fn validate_steps(recipe: &Recipe, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for step in &recipe.steps {
        let loc = format!("step '{}'", step.name);

        if step.name.is_empty() {
            errors.push(ValidationError::new("step name must not be empty"));
        } else if !step_name_re().is_match(&step.name) {
            errors.push(ValidationError::at(
                "step name must match [a-zA-Z_][a-zA-Z0-9_-]*",
                &loc,
            ));
        }

        if !seen.insert(step.name.clone()) {
            errors.push(ValidationError::at("duplicate step name", &loc));
        }

        match &step.tool {
            ToolSpec::Template { source, .. } => {
                if source.trim().is_empty() {
                    errors.push(ValidationError::at("template step requires 'source'", &loc));
                }
            }
            ToolSpec::Action { action, .. } => {
                if action.trim().is_empty() {
                    errors.push(ValidationError::at("action step requires 'action'", &loc));
                }
            }
            ToolSpec::Codemod {
                target, transform, ..
            } => {
                if target.trim().is_empty() {
                    errors.push(ValidationError::at("codemod step requires 'target'", &loc));
                }
                if transform.trim().is_empty() {
                    errors.push(ValidationError::at(
                        "codemod step requires 'transform'",
                        &loc,
                    ));
                }
            }
            ToolSpec::Recipe { path, .. } => {
                if path.trim().is_empty() {
                    errors.push(ValidationError::at("recipe step requires 'path'", &loc));
                }
            }
        }
    }

    // dependsOn targets must reference declared step names
    let names: HashSet<&str> = recipe.steps.iter().map(|s| s.name.as_str()).collect();
    for step in &recipe.steps {
        for dep in &step.depends_on {
            if !names.contains(dep.as_str()) {
                errors.push(ValidationError::at(
                    format!("depends on unknown step '{dep}'"),
                    format!("step '{}'", step.name),
                ));
            }
        }
    }
}

fn validate_variables(recipe: &Recipe, errors: &mut Vec<ValidationError>) {
    for (name, spec) in &recipe.variables {
        let loc = format!("variable '{name}'");

        if spec.var_type == VariableType::Enum && spec.values.is_empty() {
            errors.push(ValidationError::at(
                "enum variable requires 'values'",
                &loc,
            ));
        }

        if let Some(pattern) = &spec.pattern {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::at(
                    format!("pattern does not compile: {e}"),
                    &loc,
                ));
            }
        }
    }

    // Positions across positional variables must form a contiguous 0-based
    // sequence; declaration order does not matter for this check.
    let mut positions: Vec<(String, usize)> = recipe
        .variables
        .iter()
        .filter_map(|(name, spec)| spec.position.map(|p| (name.clone(), p)))
        .collect();
    positions.sort_by_key(|(_, p)| *p);

    for (expected, (name, actual)) in positions.iter().enumerate() {
        if *actual != expected {
            errors.push(ValidationError::at(
                format!(
                    "positions must be contiguous from 0; found position {actual} where {expected} was expected"
                ),
                format!("variable '{name}'"),
            ));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse(yaml: &str) -> Recipe {
        serde_yaml::from_str(yaml).unwrap()
    }

    const VALID: &str = r#"
name: component
description: Scaffold a component
version: 1.0.0
variables:
  name:
    type: string
    required: true
    position: 0
  kind:
    type: enum
    values: [api, web]
    position: 1
steps:
  - name: render
    tool: template
    source: component.hbs
  - name: announce
    tool: action
    action: shell
    params:
      command: echo done
    dependsOn: [render]
"#;

    #[test]
    fn valid_recipe_passes() {
        let recipe = parse(VALID);
        assert!(validate(&recipe).is_empty());
        assert_eq!(recipe.positional_variables(), vec![("name", 0), ("kind", 1)]);
    }

    #[test]
    fn duplicate_step_names_are_reported() {
        let yaml = r#"
name: r
steps:
  - { name: a, tool: action, action: shell }
  - { name: a, tool: action, action: shell }
"#;
        let errors = validate(&parse(yaml));
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let yaml = r#"
name: r
steps:
  - { name: a, tool: action, action: shell, dependsOn: [ghost] }
"#;
        let errors = validate(&parse(yaml));
        assert!(errors.iter().any(|e| e.message.contains("unknown step 'ghost'")));
    }

    #[test_case("1name" ; "leading digit")]
    #[test_case("has space" ; "embedded space")]
    #[test_case("dotted.name" ; "dot")]
    fn bad_step_names_are_reported(name: &str) {
        let yaml = format!("name: r\nsteps:\n  - {{ name: \"{name}\", tool: action, action: shell }}\n");
        let errors = validate(&parse(&yaml));
        assert!(errors.iter().any(|e| e.message.contains("must match")));
    }

    #[test]
    fn enum_without_values_is_reported() {
        let yaml = r#"
name: r
variables:
  kind:
    type: enum
"#;
        let errors = validate(&parse(yaml));
        assert!(errors.iter().any(|e| e.message.contains("requires 'values'")));
    }

    #[test]
    fn bad_pattern_is_reported() {
        let yaml = r#"
name: r
variables:
  id:
    type: string
    pattern: "(["
"#;
        let errors = validate(&parse(yaml));
        assert!(errors.iter().any(|e| e.message.contains("does not compile")));
    }

    #[test]
    fn gapped_positions_are_reported() {
        let yaml = r#"
name: r
variables:
  a: { type: string, position: 0 }
  b: { type: string, position: 2 }
"#;
        let errors = validate(&parse(yaml));
        assert!(errors.iter().any(|e| e.message.contains("contiguous")));
    }

    #[test]
    fn positions_not_starting_at_zero_are_reported() {
        let yaml = r#"
name: r
variables:
  a: { type: string, position: 1 }
"#;
        let errors = validate(&parse(yaml));
        assert!(!errors.is_empty());
    }

    #[test]
    fn load_rejects_unparseable_yaml() {
        let dir = std::env::temp_dir().join(format!(
            "hypergen-load-{}",
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("recipe.yml"), "name: [unclosed").unwrap();
        let err = load(&dir).unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_sets_recipe_dir() {
        let dir = std::env::temp_dir().join(format!(
            "hypergen-load-{}",
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("recipe.yml"), VALID).unwrap();
        let recipe = load(&dir).unwrap();
        assert_eq!(recipe.dir, dir);
        assert_eq!(recipe.name, "component");
        std::fs::remove_dir_all(&dir).ok();
    }
}
