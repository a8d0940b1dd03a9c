//! Access token refresh against the upstream token endpoint.
//!
//! One refresh per account is in flight at a time. Callers racing on the
//! same expired token queue on a per-account gate and, once admitted,
//! re-check the stored bundle, so only the first of them contacts upstream.
//! The gate is an async mutex held across the network call; the store's
//! writer lock is only taken for the final read-modify-write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use super::bundle::{CredentialBundle, TokenKind, is_expired_at};
use super::store::CredentialStore;
use super::{CredentialError, TokenResponse};
use crate::config::UpstreamConfig;
use crate::net::HttpClient;

/// Why a refresh was requested. Decides which preconditions apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger<'a> {
    /// Routine check before use: a still-valid access token is left alone.
    Expiry,
    /// The upstream API rejected `token`. If the store already holds a
    /// different token another caller has refreshed in the meantime.
    Rejected(Option<&'a str>),
    /// Operator request: refresh regardless of the access token's expiry.
    Manual,
}

/// Successful result of [`TokenRefresher::refresh_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new access token was obtained and stored.
    Refreshed(CredentialBundle),
    /// The rejected token had already been replaced; nothing was sent upstream.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("No credentials stored for account")]
    NoBundle,

    #[error("Access token is still valid")]
    StillValid,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token has expired; re-authorization required")]
    RefreshTokenExpired,

    #[error("Token refresh failed with status {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    #[error("Token refresh request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed refresh response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Storage(#[from] CredentialError),
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    refresh_token: &'a str,
}

/// Performs refreshes and writes the results back through the store.
pub struct TokenRefresher {
    upstream: Arc<UpstreamConfig>,
    store: Arc<CredentialStore>,
    http: HttpClient,
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(upstream: Arc<UpstreamConfig>, store: Arc<CredentialStore>, http: HttpClient) -> Self {
        Self {
            upstream,
            store,
            http,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh the account's access token if it has expired.
    ///
    /// Returns `true` only when a new token was obtained and stored. Every
    /// failure is logged and reported as `false`.
    pub async fn refresh(&self, account_id: &str) -> bool {
        let result = self.refresh_with(account_id, RefreshTrigger::Expiry).await;
        report(account_id, result)
    }

    /// Recover from the upstream rejecting `rejected`.
    ///
    /// Returns `true` when the store now holds a different access token,
    /// whether this call refreshed it or a concurrent caller already had.
    pub async fn refresh_rejected(&self, account_id: &str, rejected: Option<&str>) -> bool {
        let result = self
            .refresh_with(account_id, RefreshTrigger::Rejected(rejected))
            .await;
        report(account_id, result)
    }

    /// Refresh with full error detail.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn refresh_with(
        &self,
        account_id: &str,
        trigger: RefreshTrigger<'_>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let current = self.store.get(account_id).ok_or(RefreshError::NoBundle)?;
        if let Some(outcome) = assess(&current, trigger, now())? {
            return Ok(outcome);
        }

        let gate = self.gate(account_id);
        let _permit = gate.lock().await;

        // Whoever held the gate before us may already have refreshed.
        let current = self.store.get(account_id).ok_or(RefreshError::NoBundle)?;
        if let Some(outcome) = assess(&current, trigger, now())? {
            return Ok(outcome);
        }
        let Some(refresh_token) = current.refresh_token.as_deref() else {
            return Err(RefreshError::NoRefreshToken);
        };

        let response = self.request_refresh(refresh_token).await?;
        if response.access_token.as_deref().is_none_or(str::is_empty) {
            return Err(RefreshError::MalformedResponse(
                "response has no access_token".to_string(),
            ));
        }

        let issued_at = now();
        let mut replaced = false;
        let stored = self.store.update(account_id, |latest| match latest {
            // A new grant was stored while this refresh was in flight.
            Some(latest) if latest.access_token != current.access_token => {
                replaced = true;
                None
            }
            latest => response.into_bundle(Some(latest.as_ref().unwrap_or(&current)), issued_at),
        })?;
        if replaced {
            debug!(account_id, "Credentials replaced during refresh, keeping newer grant");
            return Ok(RefreshOutcome::Superseded);
        }

        match stored {
            Some(bundle) => {
                info!(
                    account_id,
                    access_expiry = ?bundle.access_expiry,
                    "Access token refreshed"
                );
                Ok(RefreshOutcome::Refreshed(bundle))
            }
            None => Err(RefreshError::MalformedResponse(
                "response has no access_token".to_string(),
            )),
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenResponse, RefreshError> {
        let url = self.upstream.refresh_url();
        debug!(%url, "Requesting token refresh");

        let response = self
            .http
            .inner()
            .post(&url)
            .json(&RefreshRequest {
                client_id: &self.upstream.client_id,
                refresh_token,
            })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::UpstreamRejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))
    }

    fn gate(&self, account_id: &str) -> Arc<AsyncMutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("refresh_url", &self.upstream.refresh_url())
            .field("store", &self.store)
            .finish()
    }
}

/// Decide whether `bundle` needs a refresh for `trigger`.
///
/// `Ok(Some(_))` settles the request without contacting upstream, `Ok(None)`
/// means a refresh should be issued.
fn assess(
    bundle: &CredentialBundle,
    trigger: RefreshTrigger<'_>,
    now: i64,
) -> Result<Option<RefreshOutcome>, RefreshError> {
    match trigger {
        RefreshTrigger::Expiry if !is_expired_at(bundle, TokenKind::Access, now) => {
            return Err(RefreshError::StillValid);
        }
        RefreshTrigger::Rejected(Some(rejected)) if bundle.access_token != rejected => {
            return Ok(Some(RefreshOutcome::Superseded));
        }
        _ => {}
    }
    if !bundle.can_refresh() {
        return Err(RefreshError::NoRefreshToken);
    }
    if is_expired_at(bundle, TokenKind::Refresh, now) {
        return Err(RefreshError::RefreshTokenExpired);
    }
    Ok(None)
}

fn report(account_id: &str, result: Result<RefreshOutcome, RefreshError>) -> bool {
    match result {
        Ok(RefreshOutcome::Refreshed(_)) => true,
        Ok(RefreshOutcome::Superseded) => {
            debug!(account_id, "Rejected token already replaced");
            true
        }
        Err(RefreshError::StillValid) => false,
        Err(e @ (RefreshError::NoBundle | RefreshError::NoRefreshToken)) => {
            debug!(account_id, reason = %e, "Refresh not possible");
            false
        }
        Err(e) => {
            warn!(account_id, error = %e, "Token refresh failed");
            false
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
