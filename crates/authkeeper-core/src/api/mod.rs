//! HTTP access to the application API.
//!
//! `ApiClient` attaches tenant and bearer headers to every request and turns
//! a 401 into a single renewal-and-retry. A failed renewal ends the session.

pub mod client;
pub mod error;

pub use client::{ApiClient, AuthState, RequestOptions, TENANT_HEADER};
pub use error::ApiError;
