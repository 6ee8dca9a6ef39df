//! Pairing token primitives shared by the server's pairing service and the
//! mobile client.

use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::model::SessionId;

pub const PAIRING_TOKEN_LEN: usize = 32;

/// Generate a fresh pairing token.
pub fn generate_pairing_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(PAIRING_TOKEN_LEN)
        .collect()
}

/// Hash a token using SHA-256. Stores key tokens by digest only.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Payload encoded into the QR code shown on the desktop.
pub fn qr_payload(public_base_url: &str, token: &str) -> String {
    format!("{}/m/{}", public_base_url.trim_end_matches('/'), token)
}

/// What a stored token resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub session_id: SessionId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingRecord {
    pub fn new(session_id: SessionId, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            session_id,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    /// Returns `Ok(())` if the token has not yet expired.
    pub fn ensure_not_expired(&self, now: DateTime<Utc>) -> Result<(), PairingError> {
        if now > self.expires_at {
            Err(PairingError::TokenExpired)
        } else {
            Ok(())
        }
    }
}

/// Returned to the desktop when it asks for a pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingGrant {
    pub token: String,
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
    pub qr_payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("pairing token is unknown")]
    TokenUnknown,
    #[error("pairing token has expired")]
    TokenExpired,
    #[error("pairing token belongs to a different session")]
    SessionMismatch,
    #[error("pairing store error: {0}")]
    Backend(String),
}

impl PairingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PairingError::TokenUnknown | PairingError::TokenExpired => ErrorKind::NotFound,
            PairingError::SessionMismatch => ErrorKind::Forbidden,
            PairingError::Backend(_) => ErrorKind::CollaboratorFailure,
        }
    }
}
