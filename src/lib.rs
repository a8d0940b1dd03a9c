pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod net;
pub mod upstream;

use crate::config::Config;
use crate::credentials::{CredentialError, CredentialManager, CredentialStore};
use crate::net::HttpClient;
use crate::upstream::AuthenticatedClient;

use std::sync::Arc;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialManager>,
    pub client: AuthenticatedClient,
}

impl AppState {
    /// Build state with the storage backend named in `config`.
    pub fn from_config(config: Config) -> Result<Self, CredentialError> {
        let http = HttpClient::from_config(&config.upstream);
        let credentials = CredentialManager::from_config(&config, http.clone())?;
        Ok(Self::assemble(config, credentials, http))
    }

    /// Build state around an already opened store.
    pub fn with_store(config: Config, store: Arc<CredentialStore>) -> Self {
        let http = HttpClient::from_config(&config.upstream);
        let credentials = CredentialManager::new(Arc::new(config.upstream.clone()), store, http.clone());
        Self::assemble(config, credentials, http)
    }

    fn assemble(config: Config, credentials: CredentialManager, http: HttpClient) -> Self {
        let client = AuthenticatedClient::from_manager(&credentials, http);
        Self {
            config: Arc::new(config),
            credentials: Arc::new(credentials),
            client,
        }
    }
}
