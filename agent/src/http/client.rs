//! HTTP client implementation

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::Client;
use tracing::debug;

use crate::errors::AgentError;

/// Body of a response, delivered in chunks as it arrives
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, AgentError>>;

/// Response of a streaming GET
pub struct HttpResponse {
    pub status: u16,
    /// Length declared by the transfer, if any
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the whole body
    pub async fn bytes(self) -> Result<Vec<u8>, AgentError> {
        self.body.try_concat().await
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// HTTP fetch capability
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, AgentError>;
}

/// HTTP client for descriptor and firmware downloads
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client. Only connecting is bounded by
    /// `connect_timeout`; firmware transfers may run for a long time.
    pub fn new(connect_timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("fwagent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for HttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, AgentError> {
        debug!("GET {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();

        // Pull chunks until the body ends or the first error
        let body = stream::unfold(Some(response), |response| async move {
            let mut response = response?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(AgentError::from(e)), None)),
            }
        })
        .boxed();

        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}
