//! Credential renewal: single-flight coordination and proactive scheduling.
//!
//! - `RenewalCoordinator` collapses concurrent renewal requests into one call
//! - `RenewalScheduler` renews ahead of expiry on a timer
//!
//! Failures in scheduled renewals are swallowed; a later 401 on a real
//! request drives recovery instead.

pub mod coordinator;
pub mod scheduler;

pub use coordinator::{RenewalCoordinator, RenewalResult, SharedRenewal};
pub use scheduler::{RenewalScheduler, RenewalTarget, RENEWAL_BUFFER_MINUTES};

use thiserror::Error;

use crate::api::ApiError;

/// Why a renewal attempt failed. Cloneable so every waiter on a shared
/// renewal receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("Renewal response carried no usable credential: {0}")]
    Protocol(String),

    #[error("Renewal endpoint rejected the credential")]
    Unauthorized,

    #[error("Renewal endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Renewal request failed: {0}")]
    Transport(String),

    #[error("Session ended while renewal was in flight")]
    Superseded,
}

impl From<ApiError> for RenewalError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => RenewalError::Unauthorized,
            ApiError::SessionExpired(inner) => inner,
            ApiError::AccessDenied(_) => RenewalError::Status { status: 403 },
            ApiError::NotFound(_) => RenewalError::Status { status: 404 },
            ApiError::RateLimited => RenewalError::Status { status: 429 },
            ApiError::InvalidResponse(msg) => RenewalError::Protocol(msg),
            other => RenewalError::Transport(other.to_string()),
        }
    }
}
