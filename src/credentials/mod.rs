//! OAuth credential lifecycle for connected merchant accounts.
//!
//! # Architecture
//!
//! - [`CredentialStore`] - Durable account id -> [`CredentialBundle`] records
//!   (file, sqlite or memory backend)
//! - [`bundle`] - The bundle type and the expiry evaluator
//! - [`TokenRefresher`] - Refresh handshake, single-flighted per account
//! - [`CredentialResolver`] - Account resolution and "give me a usable token"
//! - [`AuthorizationHandshake`] - Authorize redirect and code exchange
//! - [`CredentialManager`] - Wires all of the above from [`Config`]
//!
//! Failures inside the refresher and resolver are logged and folded into
//! `bool`/`Option` results. Only the handshake and the manual refresh
//! endpoint see the detailed error types.

pub mod bundle;
pub mod handshake;
pub mod refresh;
pub mod resolver;
pub mod store;

pub use bundle::{CredentialBundle, RedactedBundle, TokenKind, is_expired_at};
pub use handshake::{AuthorizationHandshake, CompletedHandshake, HandshakeError};
pub use refresh::{RefreshError, RefreshOutcome, RefreshTrigger, TokenRefresher};
pub use resolver::{CredentialResolver, ResolvedCredential};
pub use store::{
    CredentialStore, FileRecordBackend, MemoryRecordBackend, RecordBackend, RecordSet,
    SqliteRecordBackend,
};

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::config::{Config, StorageBackend, StorageConfig, UpstreamConfig};
use crate::net::HttpClient;

// =============================================================================
// CredentialError
// =============================================================================

/// Errors raised by the record store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The storage medium could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The storage medium was readable but its contents were not.
    #[error("Corrupt credential store: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

// =============================================================================
// Token endpoint response
// =============================================================================

/// Body returned by the upstream token and refresh endpoints.
///
/// Every field is optional on the wire; a response without an access token
/// is malformed.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token_expiration: Option<i64>,
    #[serde(default)]
    pub refresh_token_expiration: Option<i64>,
    /// Relative lifetime in seconds, used when no absolute expiry is given.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Merge this response into a bundle.
    ///
    /// The access token and its expiry are always replaced. The refresh token
    /// is replaced only when the response carries one; otherwise the prior
    /// token and its expiry are kept. Returns `None` if the response has no
    /// usable access token.
    pub(crate) fn into_bundle(
        self,
        prior: Option<&CredentialBundle>,
        now: i64,
    ) -> Option<CredentialBundle> {
        let access_token = self.access_token.filter(|t| !t.is_empty())?;
        let access_expiry = self
            .access_token_expiration
            .or_else(|| self.expires_in.map(|secs| now.saturating_add(secs)));

        let supplied_refresh = self.refresh_token.filter(|t| !t.is_empty());
        let (refresh_token, refresh_expiry) = match (supplied_refresh, prior) {
            (Some(token), _) => (Some(token), self.refresh_token_expiration),
            (None, Some(prior)) => (
                prior.refresh_token.clone(),
                self.refresh_token_expiration.or(prior.refresh_expiry),
            ),
            (None, None) => (None, self.refresh_token_expiration),
        };

        Some(
            CredentialBundle::new(access_token, refresh_token)
                .with_access_expiry(access_expiry)
                .with_refresh_expiry(refresh_expiry),
        )
    }
}

// =============================================================================
// CredentialManager
// =============================================================================

/// Owns the credential store and every component operating on it.
pub struct CredentialManager {
    upstream: Arc<UpstreamConfig>,
    store: Arc<CredentialStore>,
    refresher: Arc<TokenRefresher>,
    resolver: CredentialResolver,
    handshake: AuthorizationHandshake,
}

impl CredentialManager {
    pub fn new(upstream: Arc<UpstreamConfig>, store: Arc<CredentialStore>, http: HttpClient) -> Self {
        let refresher = Arc::new(TokenRefresher::new(
            Arc::clone(&upstream),
            Arc::clone(&store),
            http.clone(),
        ));
        let resolver = CredentialResolver::new(
            Arc::clone(&store),
            Arc::clone(&refresher),
            upstream.default_account.clone(),
        );
        let handshake = AuthorizationHandshake::new(Arc::clone(&upstream), Arc::clone(&store), http);

        Self {
            upstream,
            store,
            refresher,
            resolver,
            handshake,
        }
    }

    /// Create a manager using the storage backend from config.
    pub fn from_config(config: &Config, http: HttpClient) -> Result<Self, CredentialError> {
        let store = Arc::new(open_store(&config.storage)?);
        info!(backend = store.backend_name(), "Credential store opened");
        Ok(Self::new(Arc::new(config.upstream.clone()), store, http))
    }

    pub fn upstream(&self) -> &UpstreamConfig {
        &self.upstream
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    pub fn handshake(&self) -> &AuthorizationHandshake {
        &self.handshake
    }
}

/// Open the record store selected by `[storage]`.
pub fn open_store(storage: &StorageConfig) -> Result<CredentialStore, CredentialError> {
    let store = match storage.backend {
        StorageBackend::File => CredentialStore::new(FileRecordBackend::new(storage.path.clone())),
        StorageBackend::Sqlite => CredentialStore::new(SqliteRecordBackend::open(&storage.path)?),
        StorageBackend::Memory => CredentialStore::in_memory(),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_keeps_prior_refresh_token() {
        let prior = CredentialBundle::new("A1", Some("R1".into()))
            .with_access_expiry(Some(10))
            .with_refresh_expiry(Some(5_000));
        let resp = TokenResponse {
            access_token: Some("A2".into()),
            access_token_expiration: Some(3_600),
            ..Default::default()
        };
        let merged = resp.into_bundle(Some(&prior), 0).unwrap();
        assert_eq!(merged.access_token, "A2");
        assert_eq!(merged.refresh_token.as_deref(), Some("R1"));
        assert_eq!(merged.access_expiry, Some(3_600));
        assert_eq!(merged.refresh_expiry, Some(5_000));
    }

    #[test]
    fn test_token_response_replaces_refresh_token() {
        let prior = CredentialBundle::new("A1", Some("R1".into())).with_refresh_expiry(Some(5_000));
        let resp = TokenResponse {
            access_token: Some("A2".into()),
            refresh_token: Some("R2".into()),
            ..Default::default()
        };
        let merged = resp.into_bundle(Some(&prior), 0).unwrap();
        assert_eq!(merged.refresh_token.as_deref(), Some("R2"));
        // A new refresh token without an expiry has an unknown expiry.
        assert_eq!(merged.refresh_expiry, None);
    }

    #[test]
    fn test_token_response_expires_in_fallback() {
        let resp = TokenResponse {
            access_token: Some("A".into()),
            expires_in: Some(3_600),
            ..Default::default()
        };
        let bundle = resp.into_bundle(None, 1_000).unwrap();
        assert_eq!(bundle.access_expiry, Some(4_600));

        let resp = TokenResponse {
            access_token: Some("A".into()),
            access_token_expiration: Some(42),
            expires_in: Some(3_600),
            ..Default::default()
        };
        assert_eq!(resp.into_bundle(None, 1_000).unwrap().access_expiry, Some(42));
    }

    #[test]
    fn test_token_response_huge_expires_in_saturates() {
        let resp = TokenResponse {
            access_token: Some("A".into()),
            expires_in: Some(i64::MAX),
            ..Default::default()
        };
        let bundle = resp.into_bundle(None, 1_700_000_000).unwrap();
        assert_eq!(bundle.access_expiry, Some(i64::MAX));
        assert!(!bundle.is_expired(TokenKind::Access));
    }

    #[test]
    fn test_token_response_without_access_token() {
        assert!(TokenResponse::default().into_bundle(None, 0).is_none());
        let resp = TokenResponse {
            access_token: Some(String::new()),
            ..Default::default()
        };
        assert!(resp.into_bundle(None, 0).is_none());
    }

    #[test]
    fn test_open_store_backends() {
        let dir = tempfile::tempdir().unwrap();

        let file = open_store(&StorageConfig {
            backend: StorageBackend::File,
            path: dir.path().join("tokens.json"),
        })
        .unwrap();
        assert_eq!(file.backend_name(), "file");

        let sqlite = open_store(&StorageConfig {
            backend: StorageBackend::Sqlite,
            path: dir.path().join("tokens.db"),
        })
        .unwrap();
        assert_eq!(sqlite.backend_name(), "sqlite");

        let memory = open_store(&StorageConfig {
            backend: StorageBackend::Memory,
            path: dir.path().join("unused"),
        })
        .unwrap();
        assert_eq!(memory.backend_name(), "memory");
    }

    #[test]
    fn test_manager_from_config_uses_default_account() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.upstream.default_account = Some("M1".into());
        let manager = CredentialManager::from_config(&config, HttpClient::new()).unwrap();
        assert_eq!(manager.store().backend_name(), "memory");
        assert_eq!(manager.resolver().resolve_account(None).as_deref(), Some("M1"));
    }
}
