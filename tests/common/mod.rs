#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate::AppState;
use tollgate::api::build_api_router;
use tollgate::config::Config;
use tollgate::credentials::{CredentialBundle, CredentialStore};

pub const CLIENT_ID: &str = "app-test";
pub const CLIENT_SECRET: &str = "secret-test";

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Config pointing every upstream endpoint at `server`.
pub fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.upstream.client_id = CLIENT_ID.into();
    config.upstream.client_secret = CLIENT_SECRET.into();
    config.upstream.api_base_url = Some(server.uri());
    config.upstream.authorize_base_url = Some(server.uri());
    config.upstream.token_base_url = Some(server.uri());
    config.upstream.site_url = "https://gateway.test".into();
    config
}

pub fn state_for(server: &MockServer) -> (AppState, Arc<CredentialStore>) {
    let store = Arc::new(CredentialStore::in_memory());
    (AppState::with_store(config_for(server), Arc::clone(&store)), store)
}

pub fn expired_bundle(access: &str, refresh: &str) -> CredentialBundle {
    CredentialBundle::new(access, Some(refresh.to_string())).with_access_expiry(Some(now() - 1000))
}

pub fn valid_bundle(access: &str, refresh: &str) -> CredentialBundle {
    CredentialBundle::new(access, Some(refresh.to_string())).with_access_expiry(Some(now() + 3600))
}

/// Mount a refresh endpoint answering with `access` and no refresh token.
pub async fn mount_refresh(server: &MockServer, access: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/v2/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access,
            "access_token_expiration": now() + 3600,
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn send(state: AppState, request: Request<Body>) -> Response<Body> {
    build_api_router()
        .with_state(state)
        .oneshot(request)
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
