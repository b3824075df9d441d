//! Bearer token decoding.
//!
//! Only the expiry claim is extracted, and the signature is never verified:
//! the expiry is used for scheduling renewals, not for trusting the token.

use std::fmt;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};

/// Standard alphabet, tolerant of missing or present padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Number of `.`-separated segments in a well-formed token
const TOKEN_SEGMENTS: usize = 3;

/// Extract the expiry instant from a bearer token.
///
/// Returns `None` for any token that is not three segments, whose payload is
/// not decodable or not a JSON object, or which carries no numeric `exp`.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != TOKEN_SEGMENTS {
        return None;
    }

    let payload = segments[1].replace('-', "+").replace('_', "/");
    let bytes = PAYLOAD_ENGINE.decode(payload.as_bytes()).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;

    let exp_secs = claims.as_object()?.get("exp")?.as_f64()?;
    if !exp_secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((exp_secs * 1000.0) as i64)
}

/// A bearer token plus its decoded (unverified) expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = decode_expiry(&token);
        Self { token, expires_at }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry decoded from the token, if it carried one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| Utc::now() >= exp).unwrap_or(false)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|exp| (exp - Utc::now()).num_minutes().max(0))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
