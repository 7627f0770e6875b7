//! Retry-safe mutating requests.
//!
//! A client that may resend a POST, PUT, PATCH or DELETE (after a timeout, a
//! dropped connection, a proxy retry) attaches an `Idempotency-Key` header. The
//! [`Coordinator`] makes sure the handler behind it runs at most once per
//! `(caller, verb, path, key)` within the replay window:
//!
//! - the first attempt takes a short-lived lock in the shared store, runs the
//!   handler, records the outcome and releases the lock;
//! - a retry after completion gets the recorded outcome back verbatim, marked
//!   with [`REPLAY_HEADER`];
//! - a retry while the first attempt is still running waits briefly for its
//!   outcome, then gets `409 Conflict`;
//! - a retry with the same key but a different body gets `409 Conflict`.
//!
//! Coordination happens only through a [`KeyValueStore`](crate::cache::KeyValueStore),
//! so it holds across every instance sharing that store.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;

pub use config::{IdempotencyConfig, RouteOptions, StorePolicy, WaitPolicy};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{ErrorKind, IdempotencyError};
pub use fingerprint::{
    CallerScope, DedupKey, Fingerprint, IdempotencyToken, LockKey, PayloadHash, TokenError,
    validate_token,
};

/// Set to `1` on every response served from a cached outcome.
pub const REPLAY_HEADER: &str = "X-Idempotency-Replay";
