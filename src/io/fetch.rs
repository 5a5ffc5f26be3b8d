//! URL-fetch primitive.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use super::FetchError;

/// Default connect timeout, seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout, seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

/// User-Agent sent with every fetch.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A completed fetch with its body fully read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

/// Thin wrapper over a reusable `reqwest` client.
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: Client,
}

impl FetchClient {
    /// Builds a client with the given timeouts.
    ///
    /// # Errors
    ///
    /// [`FetchError::Client`] if the TLS backend cannot be initialised.
    pub fn new(connect_timeout_secs: u64, read_timeout_secs: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| FetchError::Client { source })?;
        Ok(Self { client })
    }

    /// Fetches `url` and reads the whole body.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for invalid URLs, connection failures,
    /// timeouts and non-success statuses.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().to_string();
        let mut body = Vec::with_capacity(
            response
                .content_length()
                .and_then(|len| usize::try_from(len).ok())
                .unwrap_or(0),
        );
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::network(url, e))?;
            body.extend_from_slice(&chunk);
        }

        debug!(status = status.as_u16(), bytes = body.len(), "fetch complete");
        Ok(FetchResponse {
            url: final_url,
            status: status.as_u16(),
            body,
        })
    }
}
