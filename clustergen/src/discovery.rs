use std::time::Duration;

use common::DiscoveryToken;
use reqwest::{Client as HttpClient, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not build discovery client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("discovery request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("discovery service {url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("discovery service {url} returned an empty token")]
    Empty { url: String },
}

/// Where the etcd bootstrap token comes from. A failure here is fatal;
/// retrying is up to the implementation.
#[async_trait::async_trait]
pub trait TokenSource {
    /// Token for a cluster of `size` etcd members.
    async fn token(&self, size: usize) -> Result<DiscoveryToken, DiscoveryError>;
    fn name(self: &Self) -> String;
}

/// The public etcd discovery service, or anything speaking its protocol.
pub struct EtcdDiscovery {
    http: HttpClient,
    base_url: String,
}

impl EtcdDiscovery {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DiscoveryError> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(DiscoveryError::Client)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait::async_trait]
impl TokenSource for EtcdDiscovery {
    async fn token(&self, size: usize) -> Result<DiscoveryToken, DiscoveryError> {
        let url = format!("{}/new?size={size}", self.base_url.trim_end_matches('/'));
        debug!(%url, "requesting discovery token");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| DiscoveryError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status { url, status });
        }

        let body = response
            .text()
            .await
            .map_err(|source| DiscoveryError::Request {
                url: url.clone(),
                source,
            })?;
        let token = DiscoveryToken::new(body);
        if token.as_str().is_empty() {
            return Err(DiscoveryError::Empty { url });
        }

        info!(cluster_id = token.cluster_id(), "discovery token obtained");
        Ok(token)
    }

    fn name(self: &Self) -> String {
        self.base_url.clone()
    }
}

/// A token supplied up front by the operator.
pub struct StaticToken(DiscoveryToken);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(DiscoveryToken::new(token))
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn token(&self, _size: usize) -> Result<DiscoveryToken, DiscoveryError> {
        if self.0.as_str().is_empty() {
            return Err(DiscoveryError::Empty {
                url: self.name(),
            });
        }
        Ok(self.0.clone())
    }

    fn name(self: &Self) -> String {
        "preset token".to_owned()
    }
}
