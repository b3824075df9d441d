//! Credential handling for a single tab.
//!
//! This module provides:
//! - `Credential`: a bearer token with its decoded, unverified expiry
//! - `CredentialStore`: two-tier storage selected by the "remember me" policy
//! - `LoginRedirect`: the hook invoked when a session cannot be recovered

pub mod redirect;
pub mod store;
pub mod token;

pub use redirect::{LogRedirect, LoginRedirect};
pub use store::{CredentialStore, StorageTier, REMEMBER_ME_KEY, TOKEN_KEY};
pub use token::{decode_expiry, Credential};
