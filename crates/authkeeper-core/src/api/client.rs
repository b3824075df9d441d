//! API client that carries the session credential on every request.
//!
//! `ApiClient` is the per-tab session object. It owns the credential store,
//! the renewal coordinator and the renewal scheduler, and intercepts every
//! request: tenant headers and the bearer token go out, and a 401 comes back
//! as exactly one renewal-and-retry before the caller sees it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::auth::{Credential, CredentialStore, LogRedirect, LoginRedirect};
use crate::config::{Config, TenantContext};
use crate::renewal::{
    RenewalCoordinator, RenewalError, RenewalResult, RenewalScheduler, RenewalTarget,
};
use crate::sync::CrossTabMessage;

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the tenant identifier
pub const TENANT_HEADER: HeaderName = HeaderName::from_static("x-tenant-id");

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Whether this tab currently holds a usable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Authenticated,
    Unauthenticated,
}

/// Per-request interception flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Send without a bearer token and never attempt renewal
    pub skip_auth: bool,
    /// This request is the renewal call itself
    pub renewal: bool,
    /// This request has already been retried once after a renewal
    pub retried: bool,
}

impl RequestOptions {
    pub fn anonymous() -> Self {
        Self {
            skip_auth: true,
            ..Self::default()
        }
    }

    fn renewal() -> Self {
        Self {
            renewal: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RenewalResponse {
    #[serde(alias = "access_token")]
    token: Option<String>,
}

/// API client for one tab.
/// Clone is cheap - all state is shared behind an `Arc`.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: Client,
    config: Config,
    tenant: TenantContext,
    store: CredentialStore,
    renewal: RenewalCoordinator,
    scheduler: RenewalScheduler,
    redirect: Arc<dyn LoginRedirect>,
    auth_state: watch::Sender<AuthState>,
    // Bumped whenever the stored credential changes
    revision: watch::Sender<u64>,
}

impl ApiClient {
    /// Create a client whose terminal failures are only logged
    pub fn new(config: Config, store: CredentialStore) -> Result<Self, ApiError> {
        Self::with_redirect(config, store, Arc::new(LogRedirect))
    }

    pub fn with_redirect(
        config: Config,
        store: CredentialStore,
        redirect: Arc<dyn LoginRedirect>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        let initial = if store.has_credential() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        let (auth_state, _) = watch::channel(initial);
        let (revision, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                tenant: config.tenant(),
                config,
                store,
                renewal: RenewalCoordinator::new(),
                scheduler: RenewalScheduler::new(),
                redirect,
                auth_state,
                revision,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &RenewalScheduler {
        &self.inner.scheduler
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.store.get_credential()
    }

    pub fn auth_state(&self) -> AuthState {
        *self.inner.auth_state.borrow()
    }

    /// Watch for authentication state changes
    pub fn subscribe_auth_state(&self) -> watch::Receiver<AuthState> {
        self.inner.auth_state.subscribe()
    }

    /// Watch for credential changes: login, renewal, a token from another tab
    /// or logout. The value is a revision counter.
    pub fn subscribe_credential(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn credential_changed(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    /// Returns true if the state actually changed
    fn set_auth_state(&self, state: AuthState) -> bool {
        self.inner.auth_state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Accept a freshly issued token and start renewing it.
    pub fn login(&self, token: &str, remember_me: bool) -> Credential {
        self.inner.store.begin_session(remember_me);
        let credential = self.inner.store.set_credential(token, true);
        self.inner.scheduler.arm(&self.inner);
        self.set_auth_state(AuthState::Authenticated);
        self.credential_changed();
        info!(remember_me, expires_at = ?credential.expires_at(), "Session started");
        credential
    }

    /// Re-derive session state from storage, e.g. when a tab opens.
    pub fn resume(&self) -> Option<Credential> {
        match self.inner.store.get_credential() {
            Some(credential) => {
                self.inner.scheduler.arm(&self.inner);
                self.set_auth_state(AuthState::Authenticated);
                debug!(expires_at = ?credential.expires_at(), "Session resumed from storage");
                Some(credential)
            }
            None => {
                self.inner.scheduler.cancel();
                self.set_auth_state(AuthState::Unauthenticated);
                None
            }
        }
    }

    /// End the session in this tab and all siblings.
    pub fn logout(&self) {
        self.inner.store.clear(true);
        self.inner.scheduler.cancel();
        self.set_auth_state(AuthState::Unauthenticated);
        self.credential_changed();
        info!("Logged out");
    }

    /// Clear everything and send the user back to the login entry point.
    fn terminate(&self) {
        self.inner.store.clear(true);
        self.inner.scheduler.cancel();
        self.set_auth_state(AuthState::Unauthenticated);
        self.credential_changed();
        self.inner.redirect.redirect_to_login(&self.inner.config.login_url);
    }

    /// Apply a message published by a sibling tab. Never rebroadcasts.
    pub fn apply_cross_tab(&self, message: CrossTabMessage) {
        match message {
            CrossTabMessage::Token { value } => {
                let unchanged = self
                    .inner
                    .store
                    .get_credential()
                    .is_some_and(|current| current.token() == value);
                if !unchanged {
                    self.inner.store.set_credential(&value, false);
                }
                // Re-arming replaces any timer, so repeated messages never stack
                self.inner.scheduler.arm(&self.inner);
                let signed_in = self.set_auth_state(AuthState::Authenticated);
                if !unchanged {
                    self.credential_changed();
                }
                if signed_in || !unchanged {
                    info!("Credential updated by another tab");
                }
            }
            CrossTabMessage::Logout => {
                self.inner.store.clear(false);
                self.inner.scheduler.cancel();
                if self.set_auth_state(AuthState::Unauthenticated) {
                    self.credential_changed();
                    info!("Logged out by another tab");
                }
            }
        }
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Renew the credential, joining a renewal already in flight.
    pub fn renew(&self) -> BoxFuture<'static, RenewalResult> {
        let client = self.clone();
        self.inner
            .renewal
            .renew(move || async move { client.call_renewal_endpoint().await })
            .boxed()
    }

    async fn call_renewal_endpoint(&self) -> RenewalResult {
        let epoch = self.inner.store.epoch();
        info!("Renewing credential");
        let request = self
            .inner
            .http
            .post(self.inner.config.renewal_url())
            .build()
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        let response = self.execute(request, RequestOptions::renewal()).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Renewal endpoint returned an error");
            return Err(RenewalError::Status {
                status: status.as_u16(),
            });
        }

        let body: RenewalResponse = response
            .json()
            .await
            .map_err(|e| RenewalError::Protocol(e.to_string()))?;
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RenewalError::Protocol("missing token field".to_string()))?;

        // A logout while the call was in flight wins over its result
        let Some(credential) = self.inner.store.set_credential_if_epoch(&token, true, epoch) else {
            info!("Session ended during renewal, discarding renewed credential");
            return Err(RenewalError::Superseded);
        };
        self.inner.scheduler.arm(&self.inner);
        self.set_auth_state(AuthState::Authenticated);
        self.credential_changed();
        info!(expires_at = ?credential.expires_at(), "Credential renewed");
        Ok(credential)
    }

    // =========================================================================
    // Request interception
    // =========================================================================

    /// Start building a request to a path under the API base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.inner.http.request(method, self.inner.config.url_for(path))
    }

    pub async fn send(
        &self,
        builder: RequestBuilder,
        options: RequestOptions,
    ) -> Result<Response, ApiError> {
        self.execute(builder.build()?, options).await
    }

    /// Send a request with session headers attached.
    ///
    /// Any status other than 401 is returned to the caller as-is. A 401 is
    /// answered with one renewal and one retry; a request whose body cannot
    /// be replayed is not retried.
    pub async fn execute(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Response, ApiError> {
        let replay = request.try_clone();
        let response = self.dispatch(request, &options).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if options.retried || options.skip_auth {
            debug!(url = %response.url(), "Unauthorized, not retrying");
            return Err(ApiError::Unauthorized);
        }

        if options.renewal {
            warn!("Renewal endpoint rejected the credential, ending session");
            self.terminate();
            return Err(ApiError::Unauthorized);
        }

        let Some(replay) = replay else {
            warn!(url = %response.url(), "Unauthorized and request body cannot be replayed");
            return Err(ApiError::Unauthorized);
        };

        debug!(url = %replay.url(), "Unauthorized, renewing credential before retry");
        match self.renew().await {
            Ok(_) => {
                let retry_options = RequestOptions {
                    retried: true,
                    ..options
                };
                let response = self.dispatch(replay, &retry_options).await?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    warn!(url = %response.url(), "Still unauthorized after renewal");
                    return Err(ApiError::Unauthorized);
                }
                Ok(response)
            }
            Err(e) => {
                // Either the renewal endpoint's rejection already ended the
                // session, or it ended some other way while renewing
                if !matches!(e, RenewalError::Unauthorized | RenewalError::Superseded) {
                    warn!(error = %e, "Renewal failed, ending session");
                    self.terminate();
                }
                Err(ApiError::SessionExpired(e))
            }
        }
    }

    async fn dispatch(
        &self,
        mut request: Request,
        options: &RequestOptions,
    ) -> Result<Response, ApiError> {
        self.attach_headers(request.headers_mut(), options)?;
        Ok(self.inner.http.execute(request).await?)
    }

    fn attach_headers(
        &self,
        headers: &mut HeaderMap,
        options: &RequestOptions,
    ) -> Result<(), ApiError> {
        let tenant = &self.inner.tenant;
        if let Some(ref tenant_id) = tenant.tenant_id {
            headers.insert(TENANT_HEADER, HeaderValue::from_str(tenant_id)?);
        }
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_str(&tenant.locale)?);

        headers.remove(header::AUTHORIZATION);
        if !options.skip_auth {
            if let Some(credential) = self.inner.store.get_credential() {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", credential.token()))?;
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        Ok(())
    }

    // =========================================================================
    // JSON helpers
    // =========================================================================

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send_with_backoff(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.send(build(), RequestOptions::default()).await?;
            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .send_with_backoff(|| self.request(Method::GET, path))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .send_with_backoff(|| self.request(Method::POST, path).json(body))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        let response = self
            .send_with_backoff(|| self.request(Method::GET, path))
            .await?;
        Ok(response.text().await?)
    }
}

impl RenewalTarget for ClientInner {
    fn credential_expiry(&self) -> Option<DateTime<Utc>> {
        self.store.get_credential()?.expires_at()
    }

    fn scheduler(&self) -> &RenewalScheduler {
        &self.scheduler
    }

    fn renew(self: Arc<Self>) -> BoxFuture<'static, Result<(), RenewalError>> {
        ApiClient { inner: self }
            .renew()
            .map(|result| result.map(|_| ()))
            .boxed()
    }
}
