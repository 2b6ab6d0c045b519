//! File emission sink: `artifacts/<kind>/<timestamp>-<slug>.<ext>`.

use super::{Artifact, Sink};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_SLUG: usize = 48;

pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Target path for `artifact`. Computed once per emission.
    pub fn path_for(&self, artifact: &Artifact) -> PathBuf {
        let stamp = artifact.created_at.format("%Y%m%dT%H%M%S%3fZ");
        let slug = slugify(&format!("{} {}", artifact.id, artifact.title));
        self.root
            .join(&artifact.kind)
            .join(format!("{stamp}-{slug}.{}", artifact.ext))
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn emit(&self, artifact: &Artifact) -> Result<String> {
        let path = absolute(&self.path_for(artifact))?;
        let body = artifact.render_markdown();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, body.as_bytes()))
            .await
            .context("File sink task panicked")??;
        debug!("Wrote artifact {}", path.display());
        Ok(path.display().to_string())
    }
}

/// Write to a temporary sibling, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp"));

    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result.with_context(|| format!("Failed to write {}", path.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("No current directory")?;
    Ok(cwd.join(path))
}

/// Lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len().min(MAX_SLUG));
    for c in text.chars() {
        if slug.len() >= MAX_SLUG {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".into()
    } else {
        slug
    }
}
