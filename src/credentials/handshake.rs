//! Three-legged authorization: the authorize redirect and the code exchange
//! that creates an account's first credential bundle.

use std::sync::Arc;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{info, instrument, warn};
use url::Url;

use super::bundle::CredentialBundle;
use super::store::CredentialStore;
use super::{CredentialError, TokenResponse};
use crate::config::UpstreamConfig;
use crate::net::HttpClient;

/// Query parameter the upstream uses to name the merchant account.
pub const ACCOUNT_PARAM: &str = "merchant_id";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("No account id supplied and no default account configured")]
    NoAccount,

    #[error("Token exchange failed with status {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    #[error("Token exchange request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed token exchange response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Storage(#[from] CredentialError),

    #[error("Invalid authorize URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result of a successful code exchange.
#[derive(Debug, Clone)]
pub struct CompletedHandshake {
    pub account_id: String,
    pub bundle: CredentialBundle,
}

#[derive(Serialize)]
struct CodeExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
}

pub struct AuthorizationHandshake {
    upstream: Arc<UpstreamConfig>,
    store: Arc<CredentialStore>,
    http: HttpClient,
}

impl AuthorizationHandshake {
    pub fn new(upstream: Arc<UpstreamConfig>, store: Arc<CredentialStore>, http: HttpClient) -> Self {
        Self {
            upstream,
            store,
            http,
        }
    }

    /// URL of the upstream consent page.
    ///
    /// Carries `client_id` and `redirect_uri`, plus the account when one is
    /// given or configured.
    pub fn authorize_url(&self, account_id: Option<&str>) -> Result<String, HandshakeError> {
        let mut params = vec![
            ("client_id", self.upstream.client_id.clone()),
            ("redirect_uri", self.upstream.redirect_uri()),
        ];
        if let Some(account) = self.account_for(account_id) {
            params.push((ACCOUNT_PARAM, account));
        }
        let url = Url::parse_with_params(&self.upstream.authorize_url(), &params)?;
        Ok(url.into())
    }

    /// Exchange a single-use authorization `code` for a credential bundle
    /// and store it under the account.
    ///
    /// The account is settled before the code is sent so that a request
    /// which could not be filed anywhere does not consume the code. A failed
    /// exchange is never retried.
    #[instrument(skip(self, code))]
    pub async fn complete(
        &self,
        code: &str,
        account_id: Option<&str>,
    ) -> Result<CompletedHandshake, HandshakeError> {
        let account_id = self.account_for(account_id).ok_or(HandshakeError::NoAccount)?;

        let response = self
            .http
            .inner()
            .post(self.upstream.token_url())
            .json(&CodeExchangeRequest {
                client_id: &self.upstream.client_id,
                client_secret: &self.upstream.client_secret,
                code,
            })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(account_id = %account_id, %status, %body, "Authorization code exchange rejected");
            return Err(HandshakeError::UpstreamRejected {
                status: status.as_u16(),
                body,
            });
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| HandshakeError::MalformedResponse(e.to_string()))?;
        let bundle = tokens
            .into_bundle(None, chrono::Utc::now().timestamp())
            .ok_or_else(|| HandshakeError::MalformedResponse("response has no access_token".into()))?;

        self.store.put(&account_id, &bundle)?;
        info!(account_id = %account_id, "Authorization completed, credentials stored");

        Ok(CompletedHandshake { account_id, bundle })
    }

    fn account_for(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .filter(|a| !a.is_empty())
            .or(self.upstream.default_account.as_deref())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handshake(token_base: &str, default: Option<&str>) -> (AuthorizationHandshake, Arc<CredentialStore>) {
        let upstream = UpstreamConfig {
            client_id: "app-1".into(),
            client_secret: "s3cret".into(),
            token_base_url: Some(token_base.to_string()),
            authorize_base_url: Some("https://auth.example.com".into()),
            site_url: "https://gw.example.com".into(),
            default_account: default.map(String::from),
            ..Default::default()
        };
        let store = Arc::new(CredentialStore::in_memory());
        (
            AuthorizationHandshake::new(Arc::new(upstream), Arc::clone(&store), HttpClient::new()),
            store,
        )
    }

    #[test]
    fn test_authorize_url_params() {
        let (hs, _) = handshake("http://127.0.0.1:1", None);
        let url = Url::parse(&hs.authorize_url(Some("M1")).unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("auth.example.com"));
        assert_eq!(url.path(), "/oauth/v2/authorize");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".into(), "app-1".into())));
        assert!(pairs.contains(&(
            "redirect_uri".into(),
            "https://gw.example.com/oauth/callback".into()
        )));
        assert!(pairs.contains(&("merchant_id".into(), "M1".into())));
    }

    #[test]
    fn test_authorize_url_without_account() {
        let (hs, _) = handshake("http://127.0.0.1:1", None);
        let url = hs.authorize_url(None).unwrap();
        assert!(!url.contains("merchant_id"));
        // redirect_uri is percent-encoded.
        assert!(url.contains("redirect_uri=https%3A%2F%2Fgw.example.com%2Foauth%2Fcallback"));
    }

    #[test]
    fn test_authorize_url_uses_configured_default() {
        let (hs, _) = handshake("http://127.0.0.1:1", Some("CFG"));
        assert!(hs.authorize_url(None).unwrap().contains("merchant_id=CFG"));
    }

    #[tokio::test]
    async fn test_complete_stores_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .and(body_json(json!({"client_id": "app-1", "client_secret": "s3cret", "code": "C1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A1",
                "refresh_token": "R1",
                "access_token_expiration": 1_900_000_000i64,
                "refresh_token_expiration": 1_990_000_000i64,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (hs, store) = handshake(&server.uri(), None);
        let done = hs.complete("C1", Some("M1")).await.unwrap();
        assert_eq!(done.account_id, "M1");

        let stored = store.get("M1").unwrap();
        assert_eq!(stored, done.bundle);
        assert_eq!(stored.access_token, "A1");
        assert_eq!(stored.refresh_token.as_deref(), Some("R1"));
        assert_eq!(stored.access_expiry, Some(1_900_000_000));
        assert_eq!(stored.refresh_expiry, Some(1_990_000_000));
    }

    #[tokio::test]
    async fn test_complete_falls_back_to_configured_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "A1"})))
            .expect(1)
            .mount(&server)
            .await;

        let (hs, store) = handshake(&server.uri(), Some("CFG"));
        let done = hs.complete("C1", None).await.unwrap();
        assert_eq!(done.account_id, "CFG");
        assert!(store.get("CFG").is_some());
    }

    #[tokio::test]
    async fn test_complete_rejection_is_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"message\":\"code used\"}"))
            .expect(1)
            .mount(&server)
            .await;

        let (hs, store) = handshake(&server.uri(), None);
        match hs.complete("C1", Some("M1")).await {
            Err(HandshakeError::UpstreamRejected { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "{\"message\":\"code used\"}");
            }
            other => panic!("expected UpstreamRejected, got {other:?}"),
        }
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_complete_without_account_keeps_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "A1"})))
            .expect(0)
            .mount(&server)
            .await;

        let (hs, _) = handshake(&server.uri(), None);
        assert!(matches!(
            hs.complete("C1", None).await,
            Err(HandshakeError::NoAccount)
        ));
    }

    #[tokio::test]
    async fn test_complete_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let (hs, store) = handshake(&server.uri(), None);
        assert!(matches!(
            hs.complete("C1", Some("M1")).await,
            Err(HandshakeError::MalformedResponse(_))
        ));
        assert!(store.get("M1").is_none());
    }
}
