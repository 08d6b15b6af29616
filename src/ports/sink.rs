//! Default filesystem sink. Creates parent directories on demand, honors the
//! write mode against existing files, supports idempotent injection, and in
//! dry-run mode reports outcomes without touching disk.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, warn};

use super::{FileSink, InjectAnchor, WriteMode, WriteOutcome};

#[derive(Debug)]
pub struct FsSink {
    project_root: PathBuf,
    dry_run: bool,
}

impl FsSink {
    pub fn new(project_root: &Path, dry_run: bool) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            dry_run,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

#[async_trait]
impl FileSink for FsSink {
    async fn write(
        &self,
        path: &Path,
        body: &str,
        mode: WriteMode,
    ) -> anyhow::Result<WriteOutcome> {
        let full = self.resolve(path);
        let exists = full.exists();

        match mode {
            WriteMode::Skip if exists => {
                debug!("skipping existing file {}", full.display());
                return Ok(WriteOutcome::Skipped);
            }
            WriteMode::Prompt => {
                // Interactive decisions happen in the template handler; a
                // sink receiving Prompt treats it as Skip.
                if exists {
                    warn!(
                        "prompt mode reached the sink for {}; skipping",
                        full.display()
                    );
                    return Ok(WriteOutcome::Skipped);
                }
            }
            WriteMode::Inject => {
                return self.inject(path, body, &InjectAnchor::Append).await;
            }
            _ => {}
        }

        if !self.dry_run {
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            tokio::fs::write(&full, body)
                .await
                .with_context(|| format!("failed to write {}", full.display()))?;
        }

        Ok(if exists {
            WriteOutcome::Overwritten
        } else {
            WriteOutcome::Created
        })
    }

    async fn inject(
        &self,
        path: &Path,
        body: &str,
        anchor: &InjectAnchor,
    ) -> anyhow::Result<WriteOutcome> {
        let full = self.resolve(path);
        let existing = tokio::fs::read_to_string(&full)
            .await
            .with_context(|| format!("cannot inject into missing file {}", full.display()))?;

        let trimmed = body.trim_end_matches('\n');
        if !trimmed.is_empty() && existing.contains(trimmed) {
            return Ok(WriteOutcome::Unchanged);
        }

        let next = match anchor {
            InjectAnchor::Append => {
                let mut next = existing.clone();
                if !next.is_empty() && !next.ends_with('\n') {
                    next.push('\n');
                }
                next.push_str(trimmed);
                next.push('\n');
                next
            }
            InjectAnchor::After(marker) | InjectAnchor::Before(marker) => {
                let before = matches!(anchor, InjectAnchor::Before(_));
                let mut out = String::with_capacity(existing.len() + body.len() + 1);
                let mut placed = false;
                for line in existing.lines() {
                    if before && !placed && line.contains(marker.as_str()) {
                        out.push_str(trimmed);
                        out.push('\n');
                        placed = true;
                    }
                    out.push_str(line);
                    out.push('\n');
                    if !before && !placed && line.contains(marker.as_str()) {
                        out.push_str(trimmed);
                        out.push('\n');
                        placed = true;
                    }
                }
                if !placed {
                    anyhow::bail!(
                        "inject anchor '{marker}' not found in {}",
                        full.display()
                    );
                }
                out
            }
        };

        if !self.dry_run {
            tokio::fs::write(&full, next)
                .await
                .with_context(|| format!("failed to write {}", full.display()))?;
        }
        Ok(WriteOutcome::Injected)
    }

    async fn delete(&self, path: &Path) -> anyhow::Result<bool> {
        let full = self.resolve(path);
        if !full.exists() {
            return Ok(false);
        }
        if !self.dry_run {
            tokio::fs::remove_file(&full)
                .await
                .with_context(|| format!("failed to delete {}", full.display()))?;
        }
        Ok(true)
    }
}
