//! Distributed cache & lock store.
//!
//! The idempotency layer coordinates concurrent attempts only through a shared
//! key-value store, so it holds across every backend instance that points at
//! the same store. This module defines:
//!
//! - [`KeyValueStore`]: the four primitives a backend must provide: `get`,
//!   `set` with a TTL, an atomic `set_if_absent` with a TTL, and `delete`.
//! - [`MemoryStore`]: an in-process backend with lazy TTL expiry, suitable for
//!   single-instance deployments and tests.
//! - [`OutcomeStore`]: the degrade-safe wrapper the coordinator talks to. It
//!   never propagates backend errors; it logs them and reports `Unavailable`
//!   so that deployment policy can decide between failing open and closed.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod outcome;

pub use memory::MemoryStore;
pub use outcome::{CachedOutcome, LockAttempt, LockGuard, LockRecord, Lookup, OutcomeStore, WriteStatus};

/// Errors a backend may report. The coordinator never sees these directly.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A key-value store with per-key expiry.
///
/// # Contract
///
/// - `set_if_absent` **must** be a single atomic operation (e.g. Redis
///   `SET key value NX EX ttl`). Emulating it with `get` followed by `set`
///   reintroduces the race the lock exists to close.
/// - Expired keys **must** behave as absent for every operation.
/// - Implementations must be shareable across tasks (`Send + Sync`).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Return the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value, expiring after `ttl`.
    ///
    /// The [`Coordinator`](crate::idempotency::Coordinator) never calls this:
    /// outcome writes go through [`set_if_absent`](Self::set_if_absent) so a
    /// recorded outcome is never replaced. It is part of the contract for
    /// maintenance tooling and backends shared with other callers.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Store `value` under `key` only if no live value exists. Returns `true`
    /// when this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Remove `key`. Returns `true` if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
