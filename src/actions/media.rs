//! Media-generation sink: opaque remote call returning a URL or a path.

use super::{Artifact, Sink};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct MediaRequest<'a> {
    kind: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    url: Option<String>,
    path: Option<String>,
}

pub struct MediaSink {
    endpoint: String,
    http: reqwest::Client,
}

impl MediaSink {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            http,
        })
    }
}

#[async_trait]
impl Sink for MediaSink {
    fn name(&self) -> &str {
        "media"
    }

    async fn emit(&self, artifact: &Artifact) -> Result<String> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&MediaRequest {
                kind: &artifact.kind,
                prompt: &artifact.body,
            })
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Media request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Media endpoint returned {}", status);
        }

        let body: MediaResponse = resp
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse media response")?;
        match body.url.or(body.path) {
            Some(location) => {
                debug!("Media generated at {}", location);
                Ok(location)
            }
            None => bail!("Media response had neither url nor path"),
        }
    }
}
