//! Account resolution and access token lookup.

use std::sync::Arc;

use tracing::debug;

use super::refresh::TokenRefresher;
use super::store::CredentialStore;

/// An account together with the token to present for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub account_id: String,
    pub access_token: String,
}

/// Hands out usable access tokens, refreshing stale ones on the way.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<CredentialStore>,
    refresher: Arc<TokenRefresher>,
    default_account: Option<String>,
}

impl CredentialResolver {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<TokenRefresher>,
        default_account: Option<String>,
    ) -> Self {
        Self {
            store,
            refresher,
            default_account: default_account.filter(|a| !a.is_empty()),
        }
    }

    /// Pick the account a request refers to.
    ///
    /// In order: the explicit value, the configured default, then whichever
    /// account the store reports first. Empty strings count as absent.
    pub fn resolve_account(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_account.clone())
            .or_else(|| self.store.default_account())
    }

    /// Usable access token for `account_id` (or the resolved default).
    ///
    /// Runs an expiry refresh first, which is a no-op for a valid token, then
    /// returns whatever the store holds. `None` means no credentials exist.
    pub async fn resolve(&self, account_id: Option<&str>) -> Option<String> {
        self.resolve_credential(account_id)
            .await
            .map(|c| c.access_token)
    }

    /// Like [`resolve`](Self::resolve), also reporting which account was used.
    pub async fn resolve_credential(&self, account_id: Option<&str>) -> Option<ResolvedCredential> {
        let account_id = self.resolve_account(account_id)?;
        self.refresher.refresh(&account_id).await;

        let access_token = self.current_token(&account_id)?;
        debug!(account_id = %account_id, "Credential resolved");
        Some(ResolvedCredential {
            account_id,
            access_token,
        })
    }

    /// The stored access token, without refreshing.
    pub fn current_token(&self, account_id: &str) -> Option<String> {
        self.store
            .get(account_id)
            .map(|b| b.access_token)
            .filter(|t| !t.is_empty())
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }
}
