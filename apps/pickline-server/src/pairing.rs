//! Pairing token issue and redemption.
//!
//! Tokens are stored under their SHA-256 digest. Expiry is checked when a
//! token is redeemed; nothing sweeps the in-memory store in the background.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use pickline_core::pairing::{generate_pairing_token, qr_payload, token_digest};
use pickline_core::{PairingError, PairingGrant, PairingRecord, SessionId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::telemetry::METRIC_PAIRING_REDEEM;

#[async_trait]
pub trait PairingStore: Send + Sync {
    async fn put(
        &self,
        digest: &str,
        record: &PairingRecord,
        ttl: Duration,
    ) -> Result<(), PairingError>;
    async fn get(&self, digest: &str) -> Result<Option<PairingRecord>, PairingError>;
    async fn remove(&self, digest: &str) -> Result<(), PairingError>;
}

#[derive(Default)]
pub struct InMemoryPairingStore {
    records: DashMap<String, PairingRecord>,
}

impl InMemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PairingStore for InMemoryPairingStore {
    async fn put(
        &self,
        digest: &str,
        record: &PairingRecord,
        _ttl: Duration,
    ) -> Result<(), PairingError> {
        self.records.insert(digest.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, digest: &str) -> Result<Option<PairingRecord>, PairingError> {
        Ok(self.records.get(digest).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, digest: &str) -> Result<(), PairingError> {
        self.records.remove(digest);
        Ok(())
    }
}

/// Redis-backed store. Keys carry the TTL as a safety net; the stored
/// `expires_at` stays authoritative.
#[derive(Clone)]
pub struct RedisPairingStore {
    redis: ConnectionManager,
}

impl RedisPairingStore {
    pub async fn connect(redis_url: &str) -> Result<Self, PairingError> {
        let client = redis::Client::open(redis_url).map_err(backend)?;
        let redis = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { redis })
    }

    fn key(digest: &str) -> String {
        format!("pickline:pairing:{digest}")
    }
}

#[async_trait]
impl PairingStore for RedisPairingStore {
    async fn put(
        &self,
        digest: &str,
        record: &PairingRecord,
        ttl: Duration,
    ) -> Result<(), PairingError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(record).map_err(backend)?;
        conn.set_ex::<_, _, ()>(Self::key(digest), value, ttl.as_secs().max(1))
            .await
            .map_err(backend)
    }

    async fn get(&self, digest: &str) -> Result<Option<PairingRecord>, PairingError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(Self::key(digest)).await.map_err(backend)?;
        value
            .map(|json| serde_json::from_str(&json).map_err(backend))
            .transpose()
    }

    async fn remove(&self, digest: &str) -> Result<(), PairingError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(Self::key(digest)).await.map_err(backend)
    }
}

fn backend(err: impl std::fmt::Display) -> PairingError {
    PairingError::Backend(err.to_string())
}

/// Picks Redis when configured and reachable, otherwise memory.
pub async fn build_pairing_store(redis_url: Option<&str>) -> Arc<dyn PairingStore> {
    if let Some(url) = redis_url {
        match RedisPairingStore::connect(url).await {
            Ok(store) => return Arc::new(store),
            Err(err) => {
                warn!(error = %err, "redis pairing store unavailable; falling back to memory")
            }
        }
    }
    Arc::new(InMemoryPairingStore::new())
}

#[derive(Clone)]
pub struct PairingService {
    store: Arc<dyn PairingStore>,
    ttl: Duration,
    public_base_url: String,
}

impl PairingService {
    pub fn new(store: Arc<dyn PairingStore>, ttl: Duration, public_base_url: String) -> Self {
        Self {
            store,
            ttl,
            public_base_url,
        }
    }

    pub async fn issue(&self, session_id: SessionId) -> Result<PairingGrant, PairingError> {
        let token = generate_pairing_token();
        let ttl = chrono::Duration::from_std(self.ttl).map_err(backend)?;
        let record = PairingRecord::new(session_id, ttl);
        self.store
            .put(&token_digest(&token), &record, self.ttl)
            .await?;
        debug!(session = %session_id, expires_at = %record.expires_at, "pairing token issued");
        Ok(PairingGrant {
            qr_payload: qr_payload(&self.public_base_url, &token),
            token,
            session_id,
            expires_at: record.expires_at,
        })
    }

    /// Resolves a token to its session. Redeeming twice before expiry is
    /// allowed.
    pub async fn redeem(&self, token: &str) -> Result<SessionId, PairingError> {
        let result = self.resolve(token).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(PairingError::TokenUnknown) => "unknown",
            Err(PairingError::TokenExpired) => "expired",
            Err(PairingError::SessionMismatch) => "mismatch",
            Err(PairingError::Backend(_)) => "backend_error",
        };
        counter!(METRIC_PAIRING_REDEEM, 1, "result" => label);
        result
    }

    /// Redeems `token` and checks it belongs to `session_id`.
    pub async fn redeem_for(&self, token: &str, session_id: SessionId) -> Result<(), PairingError> {
        if self.redeem(token).await? != session_id {
            return Err(PairingError::SessionMismatch);
        }
        Ok(())
    }

    async fn resolve(&self, token: &str) -> Result<SessionId, PairingError> {
        let digest = token_digest(token);
        let record = self
            .store
            .get(&digest)
            .await?
            .ok_or(PairingError::TokenUnknown)?;
        if let Err(err) = record.ensure_not_expired(Utc::now()) {
            self.store.remove(&digest).await?;
            return Err(err);
        }
        Ok(record.session_id)
    }
}
