//! Outbound HTTP client shared by the token endpoints and the business API.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};

use crate::config::UpstreamConfig;

/// Default user agent for the application.
pub const USER_AGENT: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request timeout. Every upstream call is bounded by it.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin wrapper around a configured [`reqwest::Client`].
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    /// Create a new HTTP client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Client bounded by the upstream's configured timeout.
    pub fn from_config(upstream: &UpstreamConfig) -> Self {
        Self::builder().request_timeout(upstream.timeout()).build()
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Get the inner reqwest client.
    pub fn inner(&self) -> &Client {
        &self.inner
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`HttpClient`].
pub struct HttpClientBuilder {
    builder: ClientBuilder,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            builder: Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                // The authorize redirect is for browsers; the gateway itself
                // never follows upstream redirects.
                .redirect(reqwest::redirect::Policy::none()),
        }
    }
}

impl HttpClientBuilder {
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.builder = self.builder.user_agent(ua);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.connect_timeout(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.builder = self.builder.timeout(timeout);
        self
    }

    /// Build the client, falling back to reqwest defaults if the TLS backend
    /// rejects the configuration.
    pub fn build(self) -> HttpClient {
        let inner = match self.builder.build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build HTTP client with custom config; using defaults");
                Client::default()
            }
        };
        HttpClient { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_names_crate() {
        assert!(USER_AGENT.starts_with("tollgate/"));
    }

    #[test]
    fn test_from_config_builds() {
        let upstream = UpstreamConfig {
            timeout_secs: 5,
            ..Default::default()
        };
        let client = HttpClient::from_config(&upstream);
        // Building a request must not touch the network.
        let req = client.inner().get("http://127.0.0.1:1/").build().unwrap();
        assert_eq!(req.timeout(), None);
    }
}
