//! OAuth endpoints: authorize redirect, callback, manual refresh and the
//! redacted credential listing.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::AccountQuery;
use crate::AppState;
use crate::credentials::{CredentialBundle, RedactedBundle, RefreshOutcome, RefreshTrigger};
use crate::error::AppError;

/// Query parameters sent back by the upstream on the callback redirect.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Expiry summary returned after credentials change.
#[derive(Debug, Serialize)]
pub struct CredentialStatus {
    pub message: String,
    pub account_id: String,
    pub access_expiry: Option<i64>,
    pub refresh_expiry: Option<i64>,
}

impl CredentialStatus {
    fn new(message: &str, account_id: String, bundle: &CredentialBundle) -> Self {
        Self {
            message: message.to_string(),
            account_id,
            access_expiry: bundle.access_expiry,
            refresh_expiry: bundle.refresh_expiry,
        }
    }
}

/// GET /oauth/authorize
pub async fn authorize(
    State(state): State<AppState>,
    Query(account): Query<AccountQuery>,
) -> Result<Redirect, AppError> {
    let url = state.credentials.handshake().authorize_url(account.account())?;
    Ok(Redirect::temporary(&url))
}

/// GET /oauth/callback
///
/// An app launch from the upstream arrives here with only the account id;
/// that restarts the authorize redirect. With a code, the code is exchanged
/// and the resulting credentials stored.
pub async fn callback(
    State(state): State<AppState>,
    Query(account): Query<AccountQuery>,
    Query(params): Query<CallbackQuery>,
) -> Result<Response, AppError> {
    if let Some(error) = &params.error {
        let description = params.error_description.as_deref().unwrap_or("Unknown error");
        warn!(%error, "Authorization denied by upstream");
        return Err(AppError::BadRequest(format!(
            "Authorization failed: {error} - {description}"
        )));
    }

    let Some(code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        let url = state.credentials.handshake().authorize_url(account.account())?;
        return Ok(Redirect::temporary(&url).into_response());
    };

    let done = state
        .credentials
        .handshake()
        .complete(code, account.account())
        .await?;
    Ok(Json(CredentialStatus::new(
        "Authorization successful",
        done.account_id,
        &done.bundle,
    ))
    .into_response())
}

/// POST /oauth/refresh
///
/// Refreshes unconditionally, even if the current access token is valid.
pub async fn refresh(
    State(state): State<AppState>,
    Query(account): Query<AccountQuery>,
) -> Result<Json<CredentialStatus>, AppError> {
    let account_id = state
        .credentials
        .resolver()
        .resolve_account(account.account())
        .ok_or_else(|| {
            AppError::NotConfigured("No account id supplied and no stored account found".to_string())
        })?;

    let outcome = state
        .credentials
        .refresher()
        .refresh_with(&account_id, RefreshTrigger::Manual)
        .await
        .inspect_err(|e| warn!(account_id = %account_id, error = %e, "Manual refresh failed"))?;

    let bundle = match outcome {
        RefreshOutcome::Refreshed(bundle) => bundle,
        RefreshOutcome::Superseded => state
            .credentials
            .store()
            .get(&account_id)
            .ok_or_else(|| AppError::NotFound(format!("No credentials for account {account_id}")))?,
    };
    info!(account_id = %account_id, "Manual refresh succeeded");
    Ok(Json(CredentialStatus::new(
        "Token refreshed successfully",
        account_id,
        &bundle,
    )))
}

/// GET /oauth/tokens
pub async fn tokens(State(state): State<AppState>) -> Json<BTreeMap<String, RedactedBundle>> {
    let redacted = state
        .credentials
        .store()
        .list()
        .into_iter()
        .map(|(account_id, bundle)| (account_id, bundle.redacted()))
        .collect();
    Json(redacted)
}
