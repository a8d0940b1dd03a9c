//! Credential bundles and the token validity evaluator.
//!
//! A [`CredentialBundle`] is the unit the record store persists per account.
//! The on-disk field names follow the upstream token response
//! (`access_token_expiration`, `refresh_token_expiration`) so that records
//! written by earlier deployments load unchanged.

use serde::{Deserialize, Serialize};

/// Safety margin for expiry checks (60 seconds).
///
/// A token is treated as expired this many seconds before its recorded
/// expiry so that it cannot lapse while a request is in flight.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// Number of leading characters kept when a token is redacted for display.
const REDACTED_PREFIX_LEN: usize = 6;

/// Which token of a bundle an expiry check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

/// The current credentials for one connected merchant account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialBundle {
    /// Bearer token attached to business API calls.
    pub access_token: String,

    /// Token used to mint new access tokens. A bundle without one cannot be
    /// refreshed and needs a new authorization handshake once it expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Unix timestamp after which `access_token` must not be used.
    #[serde(
        default,
        rename = "access_token_expiration",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_expiry: Option<i64>,

    /// Unix timestamp after which `refresh_token` is unusable.
    #[serde(
        default,
        rename = "refresh_token_expiration",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_expiry: Option<i64>,
}

impl CredentialBundle {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            access_expiry: None,
            refresh_expiry: None,
        }
    }

    pub fn with_access_expiry(mut self, expiry: Option<i64>) -> Self {
        self.access_expiry = expiry;
        self
    }

    pub fn with_refresh_expiry(mut self, expiry: Option<i64>) -> Self {
        self.refresh_expiry = expiry;
        self
    }

    /// Expiry of the given token, if recorded.
    pub fn expiry(&self, which: TokenKind) -> Option<i64> {
        match which {
            TokenKind::Access => self.access_expiry,
            TokenKind::Refresh => self.refresh_expiry,
        }
    }

    /// Whether `which` is expired right now. See [`is_expired_at`].
    #[must_use]
    pub fn is_expired(&self, which: TokenKind) -> bool {
        is_expired_at(self, which, chrono::Utc::now().timestamp())
    }

    /// Whether this bundle carries a refresh token at all.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Seconds until the access token expires, `None` when no expiry is known.
    pub fn access_expires_in(&self) -> Option<i64> {
        self.access_expiry
            .map(|exp| exp.saturating_sub(chrono::Utc::now().timestamp()).max(0))
    }

    /// Copy of this bundle safe to show to operators.
    pub fn redacted(&self) -> RedactedBundle {
        RedactedBundle {
            access_token: Some(redact(&self.access_token)),
            refresh_token: self.refresh_token.as_deref().map(redact),
            access_token_expiration: self.access_expiry,
            refresh_token_expiration: self.refresh_expiry,
        }
    }
}

/// Decide whether `which` token of `bundle` is expired at `now`.
///
/// An absent expiry never expires: some upstream responses omit it and the
/// token is then used until the API rejects it. A present expiry counts as
/// reached [`EXPIRY_SAFETY_MARGIN_SECS`] early.
#[must_use]
pub fn is_expired_at(bundle: &CredentialBundle, which: TokenKind, now: i64) -> bool {
    match bundle.expiry(which) {
        Some(exp) => now >= exp.saturating_sub(EXPIRY_SAFETY_MARGIN_SECS),
        None => false,
    }
}

/// Bundle view returned by the inspection endpoint. Expiries are shown in
/// full, tokens only as a short prefix.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RedactedBundle {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expiration: Option<i64>,
    pub refresh_token_expiration: Option<i64>,
}

fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{prefix}...")
}
