//! HTTP client for a running gateway's admin endpoints.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{StatusCode, Url};

use super::admin::{CloseResponse, HealthResponse};
use super::error::ErrorResponse;
use crate::session::SessionInfo;

/// Request timeout for admin calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to the admin surface of a gateway at a given address.
#[derive(Debug, Clone)]
pub struct AdminClient {
    base: Url,
    http: reqwest::Client,
}

impl AdminClient {
    /// Creates a client for the gateway listening on `addr` (`host:port`).
    pub fn new(addr: &str) -> Result<Self> {
        let base = Url::parse(&format!("http://{}/", addr))
            .with_context(|| format!("Invalid gateway address: {}", addr))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { base, http })
    }

    /// Checks that the gateway is up.
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .http
            .get(self.url(&["health"])?)
            .send()
            .await
            .context("Gateway is not reachable")?;
        decode(response).await
    }

    /// Lists the gateway's sessions.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let response = self
            .http
            .get(self.url(&["api", "sessions"])?)
            .send()
            .await
            .context("Gateway is not reachable")?;
        decode(response).await
    }

    /// Fetches one session, or `None` if the gateway does not know it.
    pub async fn get_session(&self, id: &str) -> Result<Option<SessionInfo>> {
        let response = self
            .http
            .get(self.url(&["api", "sessions", id])?)
            .send()
            .await
            .context("Gateway is not reachable")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    /// Force-closes a session.
    pub async fn kill_session(&self, id: &str) -> Result<CloseResponse> {
        let response = self
            .http
            .delete(self.url(&["api", "sessions", id])?)
            .send()
            .await
            .context("Gateway is not reachable")?;
        decode(response).await
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Gateway address cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .context("Failed to decode gateway response");
    }

    match response.json::<ErrorResponse>().await {
        Ok(body) => bail!("{}", body.error),
        Err(_) => bail!("Gateway returned {}", status),
    }
}
