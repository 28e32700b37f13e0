//! Synchronous-style HTTP bootstrap used before the socket is usable.
//!
//! The auth engine fetches the API info and the server's RSA public key over
//! plain HTTP; everything else travels through the WebSocket.

use crate::command::Command;
use crate::config::LoxoneEndpoint;
use crate::error::{LoxoneError, Result};
use crate::message::LoxoneMessage;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Fetches a single command over HTTP and decodes the envelope.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, command: &Command) -> Result<LoxoneMessage>;
}

/// Default fetcher over a shared `reqwest` client.
pub struct ReqwestHttpFetcher {
    client: reqwest::Client,
    endpoint: LoxoneEndpoint,
}

impl ReqwestHttpFetcher {
    pub fn new(endpoint: LoxoneEndpoint) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("loxone-ws/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoxoneError::connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl HttpFetcher for ReqwestHttpFetcher {
    async fn get(&self, command: &Command) -> Result<LoxoneMessage> {
        let url = self.endpoint.http_url(command.command())?;
        debug!(%url, "fetching over HTTP");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(LoxoneError::connection(format!(
                "HTTP request for {} failed: {}",
                command.command(),
                response.status()
            )));
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
