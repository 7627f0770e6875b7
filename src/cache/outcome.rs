//! Cached outcomes, lock records, and the degrade-safe store wrapper.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{KeyValueStore, StoreError};
use crate::idempotency::REPLAY_HEADER;
use crate::idempotency::fingerprint::{DedupKey, LockKey, PayloadHash};
use crate::{Response, StatusCode};

/// Response headers that are recorded with an outcome and echoed on replay.
pub const ECHOED_HEADERS: &[&str] = &["content-type", "x-request-id"];

/// Default upper bound on a single store round trip.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// The persisted result of the first execution under a dedup key.
///
/// Written once, never replaced, read until its TTL runs out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedOutcome {
    pub status_code: StatusCode,
    #[serde(with = "body_encoding")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_hash: Option<PayloadHash>,
}

impl CachedOutcome {
    /// Capture a handler's response.
    pub fn capture(response: &Response, request_hash: Option<PayloadHash>) -> Self {
        Self {
            status_code: response.status(),
            body: response.content().to_vec(),
            content_type: response.content_type().map(str::to_owned),
            created_at: Utc::now(),
            headers: response.headers().subset(ECHOED_HEADERS),
            request_hash,
        }
    }

    /// The outcome recorded when the handler failed without producing a response.
    pub fn handler_failure(request_hash: Option<PayloadHash>) -> Self {
        let status = StatusCode::InternalServerError;
        let body = serde_json::json!({
            "statusCode": status.as_u16(),
            "message": status.canonical_reason(),
        });
        Self {
            status_code: status,
            body: body.to_string().into_bytes(),
            content_type: Some("application/json".to_owned()),
            created_at: Utc::now(),
            headers: BTreeMap::new(),
            request_hash,
        }
    }

    /// Whether an attempt carrying `hash` may be served this outcome. Only a
    /// known mismatch refuses; if either side is unknown the outcome is served.
    pub fn admits(&self, hash: Option<&PayloadHash>) -> bool {
        match (&self.request_hash, hash) {
            (Some(recorded), Some(incoming)) => recorded == incoming,
            _ => true,
        }
    }

    /// Rebuild the original response, marked as a replay.
    pub fn to_replay(&self) -> Response {
        let mut response = Response::new(self.status_code).body_bytes(self.body.clone());
        for (name, value) in &self.headers {
            if name != "content-type" {
                response.add_header(name.as_str(), value.as_str());
            }
        }
        if let Some(content_type) = self
            .content_type
            .as_deref()
            .or_else(|| self.headers.get("content-type").map(String::as_str))
        {
            response.add_header("Content-Type", content_type);
        }
        response.add_header(REPLAY_HEADER, "1");
        response
    }
}

mod body_encoding {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Value stored under a lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub acquired_at: DateTime<Utc>,
}

/// Result of [`OutcomeStore::read_outcome`].
#[derive(Debug)]
pub enum Lookup {
    Hit(CachedOutcome),
    Miss,
    /// The store could not be reached. Already logged.
    Unavailable,
}

/// Result of [`OutcomeStore::write_outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    /// Not written: an outcome already exists, or the store failed.
    Skipped,
}

/// Result of [`OutcomeStore::acquire_lock`].
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockGuard),
    /// A peer holds the lock.
    Contended,
    /// The store could not be reached. Already logged.
    Unavailable,
}

/// Degrade-safe access to outcomes and locks.
///
/// No method returns an error: backend failures and timeouts are logged here
/// and surface as [`Lookup::Unavailable`], [`WriteStatus::Skipped`] or
/// [`LockAttempt::Unavailable`].
#[derive(Clone)]
pub struct OutcomeStore {
    backend: Arc<dyn KeyValueStore>,
    op_timeout: Duration,
}

impl OutcomeStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Bound every store round trip by `op_timeout`.
    #[must_use]
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.op_timeout)))
    }

    /// Fetch the outcome recorded under `key`.
    ///
    /// A record that cannot be decoded is logged and treated as absent.
    pub async fn read_outcome(&self, key: &DedupKey) -> Lookup {
        let raw = match self.bounded(self.backend.get(key.as_str())).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                error!(store_op = "read_outcome", key = %key.redacted(), error = %e, "idempotency store unavailable");
                return Lookup::Unavailable;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(outcome) => Lookup::Hit(outcome),
            Err(e) => {
                warn!(key = %key.redacted(), error = %e, "discarding undecodable cached outcome");
                Lookup::Miss
            }
        }
    }

    /// Record `outcome` under `key` unless one is already there.
    ///
    /// Best-effort: a failure only costs future replays, never the current
    /// response. A second write carrying a different request hash is rejected
    /// and logged.
    pub async fn write_outcome(
        &self,
        key: &DedupKey,
        outcome: &CachedOutcome,
        ttl: Duration,
    ) -> WriteStatus {
        let serialized = match serde_json::to_string(outcome) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!(key = %key.redacted(), error = %e, "failed to serialize outcome");
                return WriteStatus::Skipped;
            }
        };

        match self
            .bounded(self.backend.set_if_absent(key.as_str(), &serialized, ttl))
            .await
        {
            Ok(true) => {
                debug!(key = %key.redacted(), status = outcome.status_code.as_u16(), ttl_secs = ttl.as_secs(), "cached outcome");
                WriteStatus::Written
            }
            Ok(false) => {
                if let Lookup::Hit(existing) = self.read_outcome(key).await {
                    if !existing.admits(outcome.request_hash.as_ref()) {
                        warn!(key = %key.redacted(), "rejected conflicting outcome write");
                    } else {
                        debug!(key = %key.redacted(), "outcome already recorded");
                    }
                }
                WriteStatus::Skipped
            }
            Err(e) => {
                warn!(store_op = "write_outcome", key = %key.redacted(), error = %e, "failed to cache outcome");
                WriteStatus::Skipped
            }
        }
    }

    /// Try to take the lock for `key` with one atomic set-if-absent.
    pub async fn acquire_lock(&self, key: &LockKey, ttl: Duration) -> LockAttempt {
        let record = LockRecord {
            acquired_at: Utc::now(),
        };
        let value = serde_json::to_string(&record).unwrap_or_default();

        match self
            .bounded(self.backend.set_if_absent(key.as_str(), &value, ttl))
            .await
        {
            Ok(true) => LockAttempt::Acquired(LockGuard {
                store: self.clone(),
                key: key.clone(),
                released: false,
            }),
            Ok(false) => LockAttempt::Contended,
            Err(e) => {
                error!(store_op = "acquire_lock", key = %key.redacted(), error = %e, "idempotency store unavailable");
                LockAttempt::Unavailable
            }
        }
    }

    /// Delete the lock for `key`. Failures are logged; the TTL still bounds it.
    pub async fn release_lock(&self, key: &LockKey) {
        if let Err(e) = self.bounded(self.backend.delete(key.as_str())).await {
            warn!(store_op = "release_lock", key = %key.redacted(), error = %e, "failed to release lock; it will expire by TTL");
        }
    }
}

/// Exclusive hold on a lock key.
///
/// Call [`release`](Self::release) on every normal exit. If the guard is dropped
/// unreleased (a panic unwinding through its owner), a release is scheduled on
/// the current runtime.
pub struct LockGuard {
    store: OutcomeStore,
    key: LockKey,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub async fn release(mut self) {
        self.released = true;
        self.store.release_lock(&self.key).await;
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key.redacted())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { store.release_lock(&key).await });
            }
            Err(_) => {
                warn!(key = %key.redacted(), "lock guard dropped outside a runtime; lock will expire by TTL");
            }
        }
    }
}
