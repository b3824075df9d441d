//! Session lifecycle against real storage and proactive renewal.

mod common;

use std::sync::Arc;
use std::time::Duration;

use authkeeper_core::auth::{REMEMBER_ME_KEY, TOKEN_KEY};
use authkeeper_core::renewal::RenewalError;
use authkeeper_core::storage::{FileStorage, KeyValueStore, MemoryStorage};
use authkeeper_core::sync::{CrossTabMessage, LocalHub, NullChannel, TabChannel};
use authkeeper_core::AuthState;
use common::{eventually, long_lived, received_at_least, token_expiring_in, Tab};
use futures::StreamExt;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_remembered_session_resumes_from_file() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let token = long_lived("erin");

    let first = Tab::with_durable(
        &server,
        Arc::new(FileStorage::in_dir(dir.path())),
        Arc::new(NullChannel),
    );
    first.client.login(&token, true);
    assert_eq!(first.durable.get(REMEMBER_ME_KEY).unwrap().as_deref(), Some("true"));

    // A new process opening the same file picks the session up
    let second = Tab::with_durable(
        &server,
        Arc::new(FileStorage::in_dir(dir.path())),
        Arc::new(NullChannel),
    );
    assert_eq!(second.client.auth_state(), AuthState::Authenticated);
    let resumed = second.client.resume().unwrap();
    assert_eq!(resumed.token(), token);
    assert!(second.client.scheduler().is_armed());

    second.client.logout();
    assert!(!dir.path().join("storage.json").exists());
    assert!(first.client.credential().is_none());
}

#[tokio::test]
async fn test_session_only_login_leaves_durable_tier_untouched() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let tab = Tab::with_durable(
        &server,
        Arc::new(FileStorage::in_dir(dir.path())),
        Arc::new(NullChannel),
    );
    tab.client.login(&long_lived("frank"), false);

    assert!(tab.session.get(TOKEN_KEY).unwrap().is_some());
    assert!(!dir.path().join("storage.json").exists());
}

#[tokio::test]
async fn test_resume_without_credential() {
    let server = MockServer::start().await;
    let tab = Tab::new(&server, Arc::new(NullChannel));

    assert!(tab.client.resume().is_none());
    assert_eq!(tab.client.auth_state(), AuthState::Unauthenticated);
    assert!(!tab.client.scheduler().is_armed());
}

#[tokio::test]
async fn test_opaque_token_is_used_but_never_scheduled() {
    let server = MockServer::start().await;
    let tab = Tab::new(&server, Arc::new(NullChannel));

    let credential = tab.client.login("not-a-jwt", false);
    assert_eq!(credential.expires_at(), None);
    assert_eq!(tab.client.auth_state(), AuthState::Authenticated);
    assert!(!tab.client.scheduler().is_armed());
}

#[tokio::test]
async fn test_token_near_expiry_renewed_immediately() {
    let server = MockServer::start().await;
    let fresh = long_lived("fresh");

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": fresh })))
        .expect(1)
        .mount(&server)
        .await;

    let tab = Tab::new(&server, Arc::new(NullChannel));
    tab.client.login(&token_expiring_in(chrono::Duration::seconds(60), "old"), true);

    assert!(eventually(|| tab.client.credential().is_some_and(|c| c.token() == fresh)).await);
    // Re-armed from the renewed credential's expiry
    assert!(eventually(|| tab.client.scheduler().is_armed()).await);
    assert_eq!(tab.durable.get(TOKEN_KEY).unwrap().as_deref(), Some(fresh.as_str()));
}

#[tokio::test]
async fn test_proactive_renewal_failure_is_silent() {
    let server = MockServer::start().await;
    let stale = token_expiring_in(chrono::Duration::seconds(60), "old");

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let tab = Tab::new(&server, Arc::new(NullChannel));
    tab.client.login(&stale, false);

    assert!(received_at_least(&server, 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!tab.client.scheduler().is_armed());
    assert_eq!(tab.client.credential().unwrap().token(), stale);
    assert_eq!(tab.client.auth_state(), AuthState::Authenticated);
    assert_eq!(tab.redirect.count(), 0);
}

#[tokio::test]
async fn test_session_only_login_forgets_remembered_token() {
    let server = MockServer::start().await;
    let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStorage::new());
    let tab = Tab::with_durable(&server, durable.clone(), Arc::new(NullChannel));

    tab.client.login(&long_lived("grace"), true);
    let current = long_lived("heidi");
    tab.client.login(&current, false);

    assert_eq!(durable.get(TOKEN_KEY).unwrap(), None);
    assert_eq!(tab.client.credential().unwrap().token(), current);

    // A later process must not pick the old remembered token back up
    let next = Tab::with_durable(&server, durable, Arc::new(NullChannel));
    assert!(next.client.resume().is_none());
    assert_eq!(next.client.auth_state(), AuthState::Unauthenticated);
}

#[tokio::test]
async fn test_logout_during_renewal_stays_logged_out() {
    let server = MockServer::start().await;
    let hub = LocalHub::new();
    let observer = hub.join();
    let mut observed = observer.subscribe();

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "token": long_lived("renewed") }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let tab = Tab::new(&server, Arc::new(hub.join()));
    tab.client.login(&long_lived("ivan"), false);

    let renewal = tokio::spawn(tab.client.renew());
    tokio::time::sleep(Duration::from_millis(50)).await;
    tab.client.logout();

    assert_eq!(renewal.await.unwrap(), Err(RenewalError::Superseded));
    assert!(tab.client.credential().is_none());
    assert!(tab.session.get(TOKEN_KEY).unwrap().is_none());
    assert_eq!(tab.client.auth_state(), AuthState::Unauthenticated);
    assert!(!tab.client.scheduler().is_armed());
    assert_eq!(tab.redirect.count(), 0);

    // Siblings saw the login and the logout, never the discarded token
    assert!(matches!(observed.next().await, Some(CrossTabMessage::Token { .. })));
    assert_eq!(observed.next().await, Some(CrossTabMessage::Logout));
    assert!(tokio::time::timeout(Duration::from_millis(150), observed.next()).await.is_err());
}

#[tokio::test]
async fn test_renewal_publishes_credential_revision() {
    let server = MockServer::start().await;
    let fresh = long_lived("fresh");

    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": fresh })))
        .mount(&server)
        .await;

    let tab = Tab::new(&server, Arc::new(NullChannel));
    tab.client.login(&long_lived("judy"), false);
    let mut revision = tab.client.subscribe_credential();

    tab.client.renew().await.unwrap();

    assert!(revision.has_changed().unwrap());
    revision.borrow_and_update();
    assert_eq!(tab.client.credential().unwrap().token(), fresh);
    assert_eq!(tab.client.auth_state(), AuthState::Authenticated);
}
