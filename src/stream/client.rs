//! HTTP transport for the server-to-client event stream.
//!
//! `StreamClient` only opens connections. Supervision and reconnects live in
//! [`crate::stream::manager`].

use std::time::Duration;

use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const STREAM_PATH: &str = "/api/node/sse/";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens event-stream connections against one control-plane base address.
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: Client,
    base_url: String,
}

impl StreamClient {
    /// Creates a client with its own HTTP connection pool.
    pub fn new(base_url: impl Into<String>) -> Result<Self, StreamConnectError> {
        let http = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(StreamConnectError::Transport)?;
        Ok(Self::with_http(http, base_url))
    }

    /// Creates a client that shares an existing HTTP pool.
    ///
    /// The pool must not carry a whole-request timeout; streams stay open
    /// indefinitely.
    pub fn with_http(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_url(&self, token: &SecretString) -> String {
        format!("{}{}{}", self.base_url, STREAM_PATH, token.expose_secret())
    }

    /// Issues the streaming request and returns the open response.
    ///
    /// Anything but `200 OK` is a connect failure. This never retries.
    pub async fn open(&self, token: &SecretString) -> Result<Response, StreamConnectError> {
        let response = self
            .http
            .get(self.stream_url(token))
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(StreamConnectError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(StreamConnectError::HttpStatus { status });
        }
        Ok(response)
    }
}

/// Failures to open the event stream.
#[derive(Debug, Error)]
pub enum StreamConnectError {
    /// Request could not be sent or the connection failed.
    #[error("stream request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("stream connection failed with status {status}")]
    HttpStatus { status: StatusCode },

    /// The manager was disconnected while the attempt was in flight.
    #[error("stream connect cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::StreamClient;

    #[test]
    fn stream_url_embeds_token_in_path() {
        let client = StreamClient::new("http://verge.local:8080/").expect("client");
        let token = SecretString::new("T1".to_string());
        assert_eq!(
            client.stream_url(&token),
            "http://verge.local:8080/api/node/sse/T1"
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let client = StreamClient::new("https://verge.example//  \n").expect("client");
        assert_eq!(client.base_url(), "https://verge.example");
    }
}
