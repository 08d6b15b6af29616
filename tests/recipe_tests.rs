//! Loader, validation and discovery against real directories.

mod common;

use common::write_recipe;
use hypergen::ai;
use hypergen::discovery::{self, ResolvedKind};
use hypergen::ports::NoPackages;
use hypergen::recipe::{self, LoadError, ToolSpec, VariableType};
use tempfile::TempDir;
use test_case::test_case;

#[test]
fn loads_a_complete_recipe_from_a_directory() {
    let tmp = TempDir::new().unwrap();
    let dir = write_recipe(
        tmp.path(),
        r#"
name: component
description: Scaffold a component
version: 1.2.0
author: someone
tags: [scaffold, demo]
variables:
  name:
    type: string
    required: true
    position: 0
    pattern: "^[A-Z][A-Za-z0-9]*$"
  kind:
    type: enum
    values: [api, web, cli]
    default: api
steps:
  - name: render
    tool: template
    source: component.hbs
    to: "src/{{name}}.rs"
  - name: notify
    tool: action
    action: shell
    params:
      command: echo done
    dependsOn: [render]
    retries: 1
    timeoutMs: 2000
"#,
    );

    let recipe = recipe::load(&dir).unwrap();
    assert_eq!(recipe.name, "component");
    assert_eq!(recipe.version, "1.2.0");
    assert_eq!(recipe.tags, vec!["scaffold", "demo"]);
    assert_eq!(recipe.dir, dir);

    let name = &recipe.variables["name"];
    assert_eq!(name.var_type, VariableType::String);
    assert_eq!(name.position, Some(0));

    assert_eq!(recipe.steps.len(), 2);
    match &recipe.steps[0].tool {
        ToolSpec::Template { source, to } => {
            assert_eq!(source, "component.hbs");
            assert_eq!(to.as_deref(), Some("src/{{name}}.rs"));
        }
        other => panic!("expected template step, got {other:?}"),
    }
    assert_eq!(recipe.steps[1].retries, 1);
    assert_eq!(recipe.steps[1].timeout_ms, Some(2000));
}

#[test]
fn validation_reports_every_problem_at_once() {
    let tmp = TempDir::new().unwrap();
    let dir = write_recipe(
        tmp.path(),
        r#"
name: broken
variables:
  kind:
    type: enum
  id:
    type: string
    pattern: "(["
  a: { type: string, position: 0 }
  b: { type: string, position: 2 }
steps:
  - { name: x, tool: action, action: shell }
  - { name: x, tool: action, action: shell }
  - { name: y, tool: action, action: shell, dependsOn: [ghost] }
"#,
    );

    let err = recipe::load(&dir).unwrap_err();
    let LoadError::Invalid(errors) = err else {
        panic!("expected collected validation errors, got {err}");
    };
    let all = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(all.contains("requires 'values'"), "{all}");
    assert!(all.contains("does not compile"), "{all}");
    assert!(all.contains("contiguous"), "{all}");
    assert!(all.contains("duplicate step name"), "{all}");
    assert!(all.contains("unknown step 'ghost'"), "{all}");
    assert!(errors.len() >= 5);
}

#[test_case("name: [unclosed" ; "unclosed flow sequence")]
#[test_case("steps: {{bad" ; "stray braces")]
fn unparseable_yaml_fails_fast(yaml: &str) {
    let tmp = TempDir::new().unwrap();
    let dir = write_recipe(tmp.path(), yaml);
    assert!(matches!(recipe::load(&dir), Err(LoadError::Parse(_))));
}

fn kit_fixture() -> TempDir {
    let tmp = TempDir::new().unwrap();
    for (cookbook, recipes) in [("crud", vec!["api", "web"]), ("infra", vec!["ci"])] {
        for name in recipes {
            let dir = tmp
                .path()
                .join(".hyper/kits/starter")
                .join(cookbook)
                .join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("recipe.yml"),
                format!("name: {name}\nsteps: []\n"),
            )
            .unwrap();
        }
    }
    tmp
}

#[test]
fn discovery_resolves_and_loads_end_to_end() {
    let tmp = kit_fixture();
    let segments: Vec<String> = ["starter", "crud", "api", "Widget"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let resolved = discovery::resolve(&segments, tmp.path(), &NoPackages).unwrap();
    assert_eq!(resolved.kind, ResolvedKind::Recipe);
    assert_eq!(resolved.remaining, vec!["Widget"]);

    let recipe = recipe::load(&resolved.full_path).unwrap();
    assert_eq!(recipe.name, "api");
}

#[test]
fn discovery_suggests_near_misses() {
    let tmp = kit_fixture();
    let segments: Vec<String> = ["starter", "crud", "ap"].iter().map(|s| s.to_string()).collect();
    let err = discovery::resolve(&segments, tmp.path(), &NoPackages).unwrap_err();
    assert_eq!(err.deepest_prefix, vec!["starter", "crud"]);
    assert!(err.suggestions.contains(&"api".to_string()));
}

#[test]
fn answers_file_round_trip() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ai-answers.json");
    std::fs::write(&path, r#"{"greeting": "hello", "count": 3}"#).unwrap();

    let answers = ai::load_answers(&path).unwrap();
    assert_eq!(answers["greeting"], "hello");
    assert_eq!(answers["count"], "3");
}

#[test]
fn answers_file_rejects_structured_values() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ai-answers.json");
    std::fs::write(&path, r#"{"greeting": ["no", "arrays"]}"#).unwrap();
    assert!(ai::load_answers(&path).is_err());
}
