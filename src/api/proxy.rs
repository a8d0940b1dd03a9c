//! Business API pass-through.
//!
//! Requests under `/api/` are forwarded to the merchant's resource tree on
//! the upstream through [`AuthenticatedClient`](crate::upstream::AuthenticatedClient).
//! The upstream's status and body come back unchanged.

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderValue, Method, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AccountQuery;
use crate::AppState;
use crate::error::AppError;
use crate::upstream::{UpstreamRequest, UpstreamResponse};

/// Query keys consumed by the gateway and not forwarded.
const GATEWAY_PARAMS: &[&str] = &["account_id", "merchant_id", "merchantId"];

#[derive(Debug, Serialize)]
pub struct ApiStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub account_id: String,
    pub api_version: String,
    pub environment: String,
}

#[derive(Deserialize)]
struct MerchantSummary {
    name: Option<String>,
}

/// GET /api/status
///
/// Fetches the merchant record to check the stored credentials work. The
/// probe's own outcome is reported in the body; the endpoint answers 200
/// unless no account is known at all.
pub async fn api_status(
    State(state): State<AppState>,
    Query(account): Query<AccountQuery>,
) -> Result<Json<ApiStatus>, AppError> {
    let account_id = resolve_account(&state, account.account())?;
    let upstream = state.credentials.upstream();
    let request = UpstreamRequest::get(upstream.merchant_url(&account_id, "")).account(&account_id);

    let (status, merchant_name, error) = match state.client.execute(&request).await {
        Ok(resp) if resp.is_success() => {
            let name = resp
                .json::<MerchantSummary>()
                .ok()
                .and_then(|m| m.name)
                .unwrap_or_else(|| "Unknown".to_string());
            ("connected", Some(name), None)
        }
        Ok(resp) => (
            "error",
            None,
            Some(format!("Upstream answered {}", resp.status)),
        ),
        Err(e) => ("error", None, Some(e.to_string())),
    };

    Ok(Json(ApiStatus {
        status: status.to_string(),
        merchant_name,
        error,
        account_id,
        api_version: upstream.api_version.clone(),
        environment: upstream.environment.to_string(),
    }))
}

/// ANY /api/{*path}
pub async fn forward(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(account): Query<AccountQuery>,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Result<Response, AppError> {
    let account_id = resolve_account(&state, account.account())?;

    let body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<serde_json::Value>(&body)?)
    };

    let url = state.credentials.upstream().merchant_url(&account_id, &path);
    debug!(%method, %url, account_id = %account_id, "Forwarding request");

    let mut request = UpstreamRequest::new(method, url)
        .account(&account_id)
        .query(forwarded_query(raw_query.as_deref()));
    request.body = body;

    let response = state.client.execute(&request).await?;
    Ok(relay(response))
}

fn resolve_account(state: &AppState, explicit: Option<&str>) -> Result<String, AppError> {
    state
        .credentials
        .resolver()
        .resolve_account(explicit)
        .ok_or_else(|| {
            AppError::NotConfigured(
                "No account id supplied and no authorized account found; complete /oauth/authorize first"
                    .to_string(),
            )
        })
}

/// Client query pairs minus the gateway's own parameters, in client order.
fn forwarded_query(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .filter(|(k, _)| !GATEWAY_PARAMS.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    })
    .unwrap_or_default()
}

fn relay(upstream: UpstreamResponse) -> Response {
    let mut response = (upstream.status, Body::from(upstream.body)).into_response();
    if let Some(value) = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}
