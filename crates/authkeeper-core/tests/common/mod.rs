//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use authkeeper_core::auth::{CredentialStore, LoginRedirect};
use authkeeper_core::storage::{KeyValueStore, MemoryStorage};
use authkeeper_core::sync::TabChannel;
use authkeeper_core::{ApiClient, Config};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use wiremock::MockServer;

pub const LOGIN_URL: &str = "https://login.example.com/";

/// Build an unsigned token whose `exp` lies `lifetime` from now.
pub fn token_expiring_in(lifetime: chrono::Duration, subject: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = json!({ "sub": subject, "exp": (Utc::now() + lifetime).timestamp() });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, payload)
}

/// A token that will not need renewing during a test
pub fn long_lived(subject: &str) -> String {
    token_expiring_in(chrono::Duration::hours(1), subject)
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Records every login redirect instead of navigating.
#[derive(Default)]
pub struct RecordingRedirect {
    urls: Mutex<Vec<String>>,
}

impl RecordingRedirect {
    pub fn count(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

impl LoginRedirect for RecordingRedirect {
    fn redirect_to_login(&self, login_url: &str) {
        self.urls.lock().push(login_url.to_string());
    }
}

pub fn config_for(server: &MockServer) -> Config {
    Config {
        api_base_url: server.uri(),
        login_url: LOGIN_URL.to_string(),
        tenant_id: Some("acme".to_string()),
        locale: "fr".to_string(),
        request_timeout_secs: 5,
        ..Config::default()
    }
}

/// One client instance with inspectable storage tiers.
pub struct Tab {
    pub client: ApiClient,
    pub durable: Arc<dyn KeyValueStore>,
    pub session: Arc<MemoryStorage>,
    pub redirect: Arc<RecordingRedirect>,
}

impl Tab {
    pub fn new(server: &MockServer, channel: Arc<dyn TabChannel>) -> Self {
        Self::with_durable(server, Arc::new(MemoryStorage::new()), channel)
    }

    /// A tab sharing `durable` with its siblings, with its own session tier.
    pub fn with_durable(
        server: &MockServer,
        durable: Arc<dyn KeyValueStore>,
        channel: Arc<dyn TabChannel>,
    ) -> Self {
        let session = Arc::new(MemoryStorage::new());
        let redirect = Arc::new(RecordingRedirect::default());
        let store = CredentialStore::new(durable.clone(), session.clone(), channel);
        let client = ApiClient::with_redirect(config_for(server), store, redirect.clone())
            .expect("client should build");
        Self {
            client,
            durable,
            session,
            redirect,
        }
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Wait until the mock server has seen `count` requests.
pub async fn received_at_least(server: &MockServer, count: usize) -> bool {
    for _ in 0..100 {
        let seen = server.received_requests().await.map_or(0, |r| r.len());
        if seen >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
