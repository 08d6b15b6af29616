use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::distr::{Alphanumeric, SampleString};

use crate::recipe::{self, Recipe};

/// Builds a throwaway project root containing a recipe directory with a
/// `recipe.yml` and template files, then loads the recipe through the real
/// loader.
pub struct TestRecipeBuilder {
    root: PathBuf,
    name: String,
    variables: Vec<String>,
    steps: Vec<String>,
}

impl TestRecipeBuilder {
    pub fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "hypergen-test-{}",
            Alphanumeric.sample_string(&mut rand::rng(), 12)
        ));
        std::fs::create_dir_all(root.join("recipe")).unwrap();
        Self {
            root,
            name: name.to_string(),
            variables: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn recipe_dir(&self) -> PathBuf {
        self.root.join("recipe")
    }

    /// Adds a variable from a YAML snippet, e.g. `type: string\nrequired: true`.
    pub fn with_variable(mut self, name: &str, spec_yaml: &str) -> Self {
        let mut block = format!("  {name}:\n");
        for line in spec_yaml.lines() {
            block.push_str(&format!("    {line}\n"));
        }
        self.variables.push(block);
        self
    }

    /// Adds a step from a YAML snippet without the leading dash.
    pub fn with_step(mut self, step_yaml: &str) -> Self {
        let mut block = String::new();
        for (i, line) in step_yaml.lines().enumerate() {
            if i == 0 {
                block.push_str(&format!("  - {line}\n"));
            } else {
                block.push_str(&format!("    {line}\n"));
            }
        }
        self.steps.push(block);
        self
    }

    pub fn with_template(self, filename: &str, contents: &str) -> Self {
        std::fs::write(self.recipe_dir().join(filename), contents).unwrap();
        self
    }

    pub fn build(self) -> (Arc<Recipe>, PathBuf) {
        let mut yaml = format!(
            "name: {}\ndescription: test recipe\nversion: 0.1.0\n",
            self.name
        );
        if !self.variables.is_empty() {
            yaml.push_str("variables:\n");
            for block in &self.variables {
                yaml.push_str(block);
            }
        }
        if !self.steps.is_empty() {
            yaml.push_str("steps:\n");
            for block in &self.steps {
                yaml.push_str(block);
            }
        }
        std::fs::write(self.recipe_dir().join("recipe.yml"), &yaml).unwrap();
        let recipe = recipe::load(&self.recipe_dir()).unwrap_or_else(|e| {
            panic!("test recipe failed to load: {e}\n---\n{yaml}");
        });
        (Arc::new(recipe), self.root)
    }
}
