pub mod health;
pub mod oauth;
pub mod proxy;

use axum::Router;
use axum::routing::{any, get, post};
use serde::Deserialize;

use crate::AppState;

/// Build the full router.
///
/// Route layout:
/// ```text
/// /                   GET
/// /health             GET
/// /oauth/authorize    GET    redirect to the upstream consent page
/// /oauth/callback     GET    code exchange
/// /oauth/refresh      POST   manual refresh
/// /oauth/tokens       GET    redacted credential listing
/// /api/status         GET    upstream connectivity probe
/// /api/{*path}        ANY    pass-through to the merchant API
/// ```
pub fn build_api_router() -> Router<AppState> {
    let oauth_routes = Router::new()
        .route("/authorize", get(oauth::authorize))
        .route("/callback", get(oauth::callback))
        .route("/refresh", post(oauth::refresh))
        .route("/tokens", get(oauth::tokens));

    Router::new()
        .route("/", get(health::index))
        .route("/health", get(health::health_check))
        .route("/api/status", get(proxy::api_status))
        .route("/api/{*path}", any(proxy::forward))
        .nest("/oauth", oauth_routes)
}

/// Account selector accepted on every route.
///
/// The upstream names the account `merchant_id` (or `merchantId` on app
/// launch); `account_id` is the gateway's own name and wins when several
/// are present.
#[derive(Debug, Default, Deserialize)]
pub struct AccountQuery {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default, rename = "merchantId")]
    pub merchant_id_camel: Option<String>,
}

impl AccountQuery {
    pub fn account(&self) -> Option<&str> {
        [&self.account_id, &self.merchant_id, &self.merchant_id_camel]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .find(|v| !v.is_empty())
    }
}
