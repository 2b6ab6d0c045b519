//! Version-control sink: stage, commit with a templated message, push.
//!
//! The working tree must already be a git repository with the configured
//! remote. Failures surface as sink errors; they never abort the loop.

use super::{Artifact, Sink};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct GitSink {
    repo: PathBuf,
    remote: String,
    branch: String,
    push: bool,
    message_template: String,
}

impl GitSink {
    pub fn new(
        repo: impl Into<PathBuf>,
        remote: &str,
        branch: &str,
        push: bool,
        message_template: &str,
    ) -> Self {
        Self {
            repo: repo.into(),
            remote: remote.to_string(),
            branch: branch.to_string(),
            push,
            message_template: message_template.to_string(),
        }
    }

    pub fn commit_message(&self, artifact: &Artifact) -> String {
        self.message_template
            .replace("{kind}", &artifact.kind)
            .replace("{id}", &artifact.id.to_string())
            .replace("{title}", &artifact.title)
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .env("GIT_AUTHOR_NAME", "aether")
            .env("GIT_AUTHOR_EMAIL", "aether@localhost")
            .env("GIT_COMMITTER_NAME", "aether")
            .env("GIT_COMMITTER_EMAIL", "aether@localhost")
            .env("GIT_TERMINAL_PROMPT", "0")
            .current_dir(&self.repo)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }
}

#[async_trait]
impl Sink for GitSink {
    fn name(&self) -> &str {
        "vcs"
    }

    async fn emit(&self, artifact: &Artifact) -> Result<String> {
        let add = self.git(&["add", "-A", "."]).await?;
        if !add.status.success() {
            bail!("git add failed: {}", String::from_utf8_lossy(&add.stderr).trim());
        }

        let status = self.git(&["status", "--porcelain"]).await?;
        if String::from_utf8_lossy(&status.stdout).trim().is_empty() {
            debug!("No changes to commit in {}", self.repo.display());
            return Ok("nothing to commit".into());
        }

        let message = self.commit_message(artifact);
        let commit = self.git(&["commit", "-m", &message]).await?;
        if !commit.status.success() {
            bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit.stderr).trim()
            );
        }
        info!("Committed: {}", message);

        if self.push {
            let push = self.git(&["push", &self.remote, &self.branch]).await?;
            if !push.status.success() {
                let stderr = String::from_utf8_lossy(&push.stderr);
                warn!("git push to {} failed", self.remote);
                bail!("git push failed: {}", stderr.trim());
            }
        }

        Ok(message)
    }
}
