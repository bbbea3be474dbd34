//! HTTP client wrapper for transfer requests.
//!
//! Redirects are never followed and bodies are never decoded here; the
//! worker inspects every 3xx itself and counts raw bytes against
//! `Content-Length`.
//!
//! # Example
//!
//! ```no_run
//! use fetchkeeper_core::download::{HttpClient, TransferRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let response = client
//!     .send(&TransferRequest::new("https://example.com/file.zip").resume_from(1024, Some("\"v1\"")))
//!     .await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use reqwest::header::{ACCEPT_ENCODING, HeaderName, HeaderValue, IF_MATCH, RANGE};
use reqwest::{Client, ClientBuilder, Response, redirect};
use tracing::{debug, instrument, warn};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use crate::user_agent;

/// HTTP client for transfer requests.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default timeouts and user agent.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with custom connect and per-read timeouts (seconds).
    ///
    /// The read timeout applies to each read, so long transfers are not cut
    /// off as long as bytes keep arriving.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot be initialised.
    pub fn with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = base_client_builder(connect_timeout_secs, read_timeout_secs).build()?;
        Ok(Self { client })
    }

    /// Sends a GET built from `request`.
    ///
    /// Non-2xx responses are returned, not converted to errors.
    ///
    /// # Errors
    ///
    /// Returns the transport error when no response was received.
    #[instrument(skip(self, request), fields(uri = %request.uri, range = ?request.range))]
    pub async fn send(&self, request: &TransferRequest<'_>) -> Result<Response, reqwest::Error> {
        let mut builder = self
            .client
            .get(request.uri)
            .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        for (name, value) in request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!(header = %name, "skipping invalid request header"),
            }
        }

        if let Some((start, end)) = request.range {
            let value = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            builder = builder.header(RANGE, value);
        }
        if let Some(etag) = request.if_match {
            builder = builder.header(IF_MATCH, etag);
        }

        let response = builder.send().await?;
        debug!(status = response.status().as_u16(), "response received");
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// One outgoing request: target, caller headers and optional resume range.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub uri: &'a str,
    pub headers: &'a [(String, String)],
    /// Inclusive byte range; `None` end means "to the end".
    pub range: Option<(u64, Option<u64>)>,
    pub if_match: Option<&'a str>,
}

impl<'a> TransferRequest<'a> {
    #[must_use]
    pub fn new(uri: &'a str) -> Self {
        Self {
            uri,
            headers: &[],
            range: None,
            if_match: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: &'a [(String, String)]) -> Self {
        self.headers = headers;
        self
    }

    /// Requests the remainder of the resource from `offset`, guarded by `etag`.
    #[must_use]
    pub fn resume_from(mut self, offset: u64, etag: Option<&'a str>) -> Self {
        self.range = Some((offset, None));
        self.if_match = etag;
        self
    }

    /// Requests the inclusive range `start..=end`.
    #[must_use]
    pub fn segment(mut self, start: u64, end: u64) -> Self {
        self.range = Some((start, Some(end)));
        self
    }
}

fn base_client_builder(connect_timeout_secs: u64, read_timeout_secs: u64) -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .read_timeout(Duration::from_secs(read_timeout_secs))
        .redirect(redirect::Policy::none())
        .user_agent(user_agent::default_user_agent())
}
