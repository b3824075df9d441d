//! Session credential lifecycle for an authenticated API client.
//!
//! Stores a bearer token in one of two storage tiers, renews it ahead of
//! expiry, recovers from 401 responses with a single shared renewal, and keeps
//! sibling tabs in step through a publish/subscribe channel.

pub mod api;
pub mod auth;
pub mod config;
pub mod renewal;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, ApiError, AuthState, RequestOptions};
pub use auth::{Credential, CredentialStore, LoginRedirect};
pub use config::Config;
pub use sync::{CrossTabMessage, CrossTabSync, TabChannel};
