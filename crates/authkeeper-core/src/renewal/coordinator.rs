use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use super::RenewalError;
use crate::auth::Credential;

pub type RenewalResult = Result<Credential, RenewalError>;

/// A renewal in flight, awaitable by any number of callers.
pub type SharedRenewal = Shared<BoxFuture<'static, RenewalResult>>;

enum RenewalState {
    Idle,
    Renewing(SharedRenewal),
}

/// Ensures at most one renewal call is in flight per tab.
///
/// Callers arriving while a renewal is running await the same outcome. The
/// state returns to idle before waiters observe the result, so a caller
/// reacting to a failure can immediately start a fresh attempt.
pub struct RenewalCoordinator {
    state: Arc<Mutex<RenewalState>>,
}

impl RenewalCoordinator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RenewalState::Idle)),
        }
    }

    pub fn is_renewing(&self) -> bool {
        matches!(*self.state.lock(), RenewalState::Renewing(_))
    }

    /// Join the in-flight renewal, or start one by calling `start`.
    ///
    /// `start` is only invoked when no renewal is running.
    pub fn renew<F, Fut>(&self, start: F) -> SharedRenewal
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RenewalResult> + Send + 'static,
    {
        let mut state = self.state.lock();
        if let RenewalState::Renewing(flight) = &*state {
            debug!("Joining in-flight renewal");
            return flight.clone();
        }

        let slot = Arc::clone(&self.state);
        let attempt = start();
        let flight = async move {
            let result = attempt.await;
            *slot.lock() = RenewalState::Idle;
            result
        }
        .boxed()
        .shared();

        *state = RenewalState::Renewing(flight.clone());
        flight
    }
}

impl Default for RenewalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
