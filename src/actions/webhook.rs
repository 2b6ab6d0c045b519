//! Webhook sink (Discord-style embed envelope).

use super::{Artifact, Sink};
use crate::config::Secret;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const USERNAME: &str = "Aether Loop";

/// Bound on the `content` summary.
const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub title: &'a str,
    pub content: String,
    pub embeds: Vec<Embed<'a>>,
    pub username: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Embed<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub fields: Vec<EmbedField<'a>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct EmbedField<'a> {
    pub name: &'a str,
    pub value: &'a str,
    pub inline: bool,
}

impl<'a> Envelope<'a> {
    pub fn for_artifact(artifact: &'a Artifact) -> Self {
        let content = crate::provider::bound_text(&artifact.body, SUMMARY_CHARS);
        Self {
            title: &artifact.title,
            content,
            embeds: vec![Embed {
                title: &artifact.title,
                description: &artifact.body,
                fields: artifact
                    .fields
                    .iter()
                    .map(|(name, value)| EmbedField {
                        name: name.as_str(),
                        value: value.as_str(),
                        inline: true,
                    })
                    .collect(),
                timestamp: artifact.created_at,
            }],
            username: USERNAME,
        }
    }
}

pub struct WebhookSink {
    url: Secret,
    retry_delay: Duration,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: Secret, timeout: Duration, retry_delay: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            url,
            retry_delay,
            http,
        })
    }

    async fn post_once(&self, envelope: &Envelope<'_>) -> Result<()> {
        let resp = self
            .http
            .post(self.url.expose())
            .json(envelope)
            .send()
            .await
            // The URL is the secret; keep it out of the error text.
            .map_err(reqwest::Error::without_url)
            .context("Webhook request failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Webhook returned {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn emit(&self, artifact: &Artifact) -> Result<String> {
        let envelope = Envelope::for_artifact(artifact);
        if let Err(first) = self.post_once(&envelope).await {
            warn!("Webhook post failed, retrying in {:?}: {:#}", self.retry_delay, first);
            tokio::time::sleep(self.retry_delay).await;
            self.post_once(&envelope)
                .await
                .context("Webhook retry failed; dropping")?;
        }
        debug!("Webhook delivered: {}", artifact.title);
        Ok("delivered".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink(server: &MockServer) -> WebhookSink {
        WebhookSink::new(
            Secret::new(format!("{}/hook", server.uri())),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    fn artifact() -> Artifact {
        let mut a = Artifact::new("task", 3, "Task #3 completed", "Trim the slow stage");
        a.fields.push(("quality".into(), "0.812".into()));
        a
    }

    #[tokio::test]
    async fn posts_embed_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "title": "Task #3 completed",
                "username": "Aether Loop",
                "embeds": [{"fields": [{"name": "quality", "value": "0.812", "inline": true}]}]
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        sink(&server).emit(&artifact()).await.unwrap();
    }

    #[tokio::test]
    async fn retries_once_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        assert!(sink(&server).emit(&artifact()).await.is_err());
    }

    #[tokio::test]
    async fn retry_can_succeed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert_eq!(sink(&server).emit(&artifact()).await.unwrap(), "delivered");
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_the_url() {
        let sink = WebhookSink::new(
            Secret::new("http://127.0.0.1:9/api/webhooks/123/SECRETTOKEN"),
            Duration::from_secs(2),
            Duration::from_millis(10),
        )
        .unwrap();

        let err = sink.emit(&artifact()).await.unwrap_err();
        let text = format!("{err:#} {err:?}");
        assert!(!text.contains("SECRETTOKEN"), "{text}");
        assert!(!text.contains("/api/webhooks/"), "{text}");
    }
}
