//! Authenticated calls to the upstream business API.
//!
//! [`AuthenticatedClient::execute`] attaches the account's bearer token and,
//! if the upstream answers 401, refreshes once and replays the request once.
//! Whatever the upstream answers after that is returned as-is.

use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use crate::credentials::{CredentialManager, CredentialResolver};
use crate::net::HttpClient;

/// A request to forward upstream.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    /// Account whose token to attach. `None` resolves to the default account.
    pub account_id: Option<String>,
    pub body: Option<serde_json::Value>,
    pub query: Vec<(String, String)>,
}

impl UpstreamRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            account_id: None,
            body: None,
            query: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }
}

/// The upstream's answer, fully buffered.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    fn from_parts(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Self {
            status,
            content_type,
            body,
        }
    }
}

/// Business API client that manages credentials on the caller's behalf.
#[derive(Clone)]
pub struct AuthenticatedClient {
    resolver: CredentialResolver,
    http: HttpClient,
}

impl AuthenticatedClient {
    pub fn new(resolver: CredentialResolver, http: HttpClient) -> Self {
        Self { resolver, http }
    }

    pub fn from_manager(manager: &CredentialManager, http: HttpClient) -> Self {
        Self::new(manager.resolver().clone(), http)
    }

    /// Send `request` with the resolved account's token.
    ///
    /// Without a resolvable token the request goes out unauthenticated and
    /// the upstream decides. A 401 triggers at most one refresh and one
    /// replay. Transport errors are returned unchanged.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn execute(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, reqwest::Error> {
        let account = self.resolver.resolve_account(request.account_id.as_deref());
        let token = match account.as_deref() {
            Some(account_id) => self.resolver.resolve(Some(account_id)).await,
            None => None,
        };
        if token.is_none() {
            debug!(account_id = ?account, "No credential resolved, sending unauthenticated");
        }

        let first = self.send(request, token.as_deref()).await?;
        if first.status != StatusCode::UNAUTHORIZED {
            return Ok(first);
        }
        let Some(account_id) = account else {
            return Ok(first);
        };

        let refreshed = self
            .resolver
            .refresher()
            .refresh_rejected(&account_id, token.as_deref())
            .await;
        if !refreshed {
            debug!(account_id = %account_id, "Upstream rejected token and no replacement is available");
            return Ok(first);
        }

        let retry_token = self.resolver.current_token(&account_id);
        info!(account_id = %account_id, "Retrying upstream request with refreshed token");
        self.send(request, retry_token.as_deref()).await
    }

    async fn send(&self, request: &UpstreamRequest, token: Option<&str>) -> Result<UpstreamResponse, reqwest::Error> {
        let mut builder = self
            .http
            .inner()
            .request(request.method.clone(), &request.url)
            .header(header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        debug!(%status, bytes = body.len(), "Upstream responded");
        Ok(UpstreamResponse::from_parts(status, &headers, body))
    }
}
