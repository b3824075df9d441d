use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::token::Credential;
use crate::storage::KeyValueStore;
use crate::sync::{CrossTabMessage, TabChannel};

/// Storage key holding the bearer token
pub const TOKEN_KEY: &str = "auth_token";

/// Storage key holding the "remember me" flag (durable tier only)
pub const REMEMBER_ME_KEY: &str = "remember_me";

/// Which storage tier a value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    /// Survives restarts
    Durable,
    /// Lives as long as the tab
    Session,
}

impl StorageTier {
    pub fn other(self) -> Self {
        match self {
            StorageTier::Durable => StorageTier::Session,
            StorageTier::Session => StorageTier::Durable,
        }
    }
}

/// Holder of the current bearer token for one tab.
///
/// The "remember me" policy picks the tier credentials are written to.
/// Reads check the active tier first and fall back to the other one, so a
/// session survives a policy change made after the token was stored.
/// Storage failures are logged and read as "no credential".
///
/// Every login and every clear starts a new epoch. Work begun in one epoch
/// (a renewal in flight) can only store its result while that epoch lasts.
#[derive(Clone)]
pub struct CredentialStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    channel: Arc<dyn TabChannel>,
    epoch: Arc<Mutex<u64>>,
}

impl CredentialStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        channel: Arc<dyn TabChannel>,
    ) -> Self {
        Self {
            durable,
            session,
            channel,
            epoch: Arc::new(Mutex::new(0)),
        }
    }

    /// Current session epoch
    pub fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    pub fn channel(&self) -> &Arc<dyn TabChannel> {
        &self.channel
    }

    fn tier(&self, tier: StorageTier) -> &dyn KeyValueStore {
        match tier {
            StorageTier::Durable => self.durable.as_ref(),
            StorageTier::Session => self.session.as_ref(),
        }
    }

    /// Tier selected by the current storage policy.
    pub fn active_tier(&self) -> StorageTier {
        if self.remember_me() {
            StorageTier::Durable
        } else {
            StorageTier::Session
        }
    }

    pub fn remember_me(&self) -> bool {
        match self.durable.get(REMEMBER_ME_KEY) {
            Ok(value) => value.as_deref() == Some("true"),
            Err(e) => {
                warn!(error = %e, "Failed to read storage policy, assuming session-only");
                false
            }
        }
    }

    pub fn set_remember_me(&self, remember: bool) {
        let result = if remember {
            self.durable.set(REMEMBER_ME_KEY, "true")
        } else {
            self.durable.remove(REMEMBER_ME_KEY)
        };
        if let Err(e) = result {
            warn!(error = %e, remember, "Failed to persist storage policy");
        }
    }

    fn read_token(&self, tier: StorageTier) -> Option<String> {
        match self.tier(tier).get(TOKEN_KEY) {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(error = %e, ?tier, "Failed to read credential");
                None
            }
        }
    }

    /// Current credential, if any tier holds one.
    pub fn get_credential(&self) -> Option<Credential> {
        let active = self.active_tier();
        if let Some(token) = self.read_token(active) {
            return Some(Credential::new(token));
        }

        let fallback = self.read_token(active.other())?;
        debug!(tier = ?active.other(), "Credential found in alternate tier");
        Some(Credential::new(fallback))
    }

    pub fn has_credential(&self) -> bool {
        self.get_credential().is_some()
    }

    /// Start a new session under the given storage policy.
    ///
    /// A token left in the tier the policy no longer selects is removed, so
    /// the fallback read cannot bring back an earlier session.
    pub fn begin_session(&self, remember_me: bool) {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        self.set_remember_me(remember_me);

        let inactive = self.active_tier().other();
        if let Err(e) = self.tier(inactive).remove(TOKEN_KEY) {
            warn!(error = %e, tier = ?inactive, "Failed to drop credential from inactive tier");
        }
    }

    /// Like [`set_credential`](Self::set_credential), but only while `epoch`
    /// is still current. Returns `None` when the session ended meanwhile.
    pub fn set_credential_if_epoch(
        &self,
        token: &str,
        broadcast: bool,
        epoch: u64,
    ) -> Option<Credential> {
        let current = self.epoch.lock();
        if *current != epoch {
            debug!(expected = epoch, current = *current, "Session ended, credential discarded");
            return None;
        }
        Some(self.set_credential(token, broadcast))
    }

    /// Store a token in the active tier, announcing it to sibling tabs when
    /// `broadcast` is set.
    pub fn set_credential(&self, token: &str, broadcast: bool) -> Credential {
        let tier = self.active_tier();
        if let Err(e) = self.tier(tier).set(TOKEN_KEY, token) {
            warn!(error = %e, ?tier, "Failed to persist credential");
        }

        if broadcast {
            self.channel.publish(CrossTabMessage::Token {
                value: token.to_string(),
            });
        }

        let credential = Credential::new(token);
        debug!(?tier, expires_at = ?credential.expires_at(), broadcast, "Credential stored");
        credential
    }

    /// Remove the credential from both tiers along with the storage policy.
    pub fn clear(&self, broadcast: bool) {
        {
            let mut epoch = self.epoch.lock();
            *epoch += 1;
            for tier in [StorageTier::Durable, StorageTier::Session] {
                for key in [TOKEN_KEY, REMEMBER_ME_KEY] {
                    if let Err(e) = self.tier(tier).remove(key) {
                        warn!(error = %e, ?tier, key, "Failed to clear storage key");
                    }
                }
            }
        }

        if broadcast {
            self.channel.publish(CrossTabMessage::Logout);
        }
        debug!(broadcast, "Credential cleared");
    }
}
