//! Default template renderer: handlebars over the template data object,
//! followed by frontmatter extraction and `@ai` block processing.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use handlebars::Handlebars;
use serde_json::Value as JsonValue;

use super::{Frontmatter, Rendered, TemplateEngine};
use crate::ai::{self, AiState};

#[derive(Debug, Default)]
pub struct HandlebarsEngine;

impl HandlebarsEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TemplateEngine for HandlebarsEngine {
    async fn render(
        &self,
        source: &Path,
        data: &JsonValue,
        ai: &AiState,
    ) -> anyhow::Result<Rendered> {
        let raw = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read template '{}'", source.display()))?;

        // Unknown identifiers render empty rather than erroring; templates
        // routinely reference optional variables and step results.
        let handlebars = Handlebars::new();
        let rendered = handlebars
            .render_template(&raw, data)
            .with_context(|| format!("failed to render template '{}'", source.display()))?;

        let (frontmatter, body) = split_frontmatter(&rendered)
            .with_context(|| format!("bad frontmatter in template '{}'", source.display()))?;

        let body = ai::process_blocks(&body, &ai.mode())
            .with_context(|| format!("bad @ai block in template '{}'", source.display()))?;

        Ok(Rendered { body, frontmatter })
    }
}

/// Splits a leading `---\n...\n---\n` block off the rendered output and
/// parses it as YAML. No block means no frontmatter.
pub fn split_frontmatter(rendered: &str) -> anyhow::Result<(Option<Frontmatter>, String)> {
    let Some(rest) = rendered.strip_prefix("---\n").or_else(|| {
        rendered
            .strip_prefix("---\r\n")
    }) else {
        return Ok((None, rendered.to_string()));
    };

    let Some(end) = rest.find("\n---").map(|i| i + 1) else {
        anyhow::bail!("frontmatter is missing its closing '---'");
    };
    let header = &rest[..end - 1];
    let mut body = &rest[end + 3..];
    if let Some(stripped) = body.strip_prefix('\n') {
        body = stripped;
    } else if let Some(stripped) = body.strip_prefix("\r\n") {
        body = stripped;
    }

    let frontmatter: Frontmatter =
        serde_yaml::from_str(header).map_err(|e| anyhow::anyhow!("invalid frontmatter: {e}"))?;
    Ok((Some(frontmatter), body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiAnswers, AiCollector};
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::Arc;

    use crate::variables::VariableEnvironment;

    fn write_template(contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("hypergen-tpl-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.hbs");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn splits_frontmatter_and_body() {
        let (fm, body) = split_frontmatter("---\nto: out.txt\ninject: true\n---\nbody\n").unwrap();
        let fm = fm.unwrap();
        assert_eq!(fm.to.as_deref(), Some("out.txt"));
        assert!(fm.inject);
        assert_eq!(body, "body\n");
    }

    #[test]
    fn missing_frontmatter_yields_none() {
        let (fm, body) = split_frontmatter("just a body\n").unwrap();
        assert!(fm.is_none());
        assert_eq!(body, "just a body\n");
    }

    #[test]
    fn unterminated_frontmatter_errors() {
        assert!(split_frontmatter("---\nto: x\n").is_err());
    }

    #[tokio::test]
    async fn renders_variables_into_frontmatter_and_body() {
        let path = write_template("---\nto: out/{{name}}.txt\n---\nHello {{name}}!\n");
        let env = VariableEnvironment::new(IndexMap::from([(
            "name".to_string(),
            json!("widget"),
        )]));
        let data = env.template_data(json!({}));
        let ai = AiState::writing(Arc::new(AiAnswers::new()));

        let rendered = HandlebarsEngine::new()
            .render(&path, &data, &ai)
            .await
            .unwrap();
        assert_eq!(
            rendered.frontmatter.unwrap().to.as_deref(),
            Some("out/widget.txt")
        );
        assert_eq!(rendered.body, "Hello widget!\n");
    }

    #[tokio::test]
    async fn collect_mode_records_ai_blocks_and_strips_them() {
        let path = write_template(
            "---\nto: out.txt\n---\n@ai(greeting)\n@prompt Say hi\n@end\n",
        );
        let env = VariableEnvironment::new(IndexMap::new());
        let data = env.with_collect_mode(true).template_data(json!({}));
        let collector = Arc::new(AiCollector::new());
        let ai = AiState::collecting(collector.clone());

        let rendered = HandlebarsEngine::new()
            .render(&path, &data, &ai)
            .await
            .unwrap();
        assert!(rendered.body.trim().is_empty());
        assert_eq!(collector.len(), 1);
        assert_eq!(collector.entries()[0].key, "greeting");
    }

    #[tokio::test]
    async fn write_mode_splices_answers() {
        let path = write_template("@ai(greeting)\n@prompt Say hi\n@end\n");
        let env = VariableEnvironment::new(IndexMap::new());
        let data = env.template_data(json!({}));
        let mut answers = AiAnswers::new();
        answers.insert("greeting".into(), "hello".into());
        let ai = AiState::writing(Arc::new(answers));

        let rendered = HandlebarsEngine::new()
            .render(&path, &data, &ai)
            .await
            .unwrap();
        assert_eq!(rendered.body, "hello\n");
    }

    #[tokio::test]
    async fn missing_template_file_errors() {
        let env = VariableEnvironment::new(IndexMap::new());
        let data = env.template_data(json!({}));
        let ai = AiState::writing(Arc::new(AiAnswers::new()));
        let result = HandlebarsEngine::new()
            .render(Path::new("/nonexistent/t.hbs"), &data, &ai)
            .await;
        assert!(result.is_err());
    }
}
