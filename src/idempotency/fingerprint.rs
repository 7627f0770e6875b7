//! Request fingerprints: dedup key, lock key and payload hash.
//!
//! Everything here is pure. Token validation in particular happens before any
//! store access, so a malformed token never costs a network round trip.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::Method;
use crate::context::{Context, Principal};

/// Version segment of every key. Bumping it lets the key scheme evolve without
/// colliding with entries written by older instances.
pub const KEY_VERSION: &str = "v1";

/// Namespace of cached outcomes.
pub const OUTCOME_NAMESPACE: &str = "idem";

/// Namespace of lock records.
pub const LOCK_NAMESPACE: &str = "idemlock";

pub const MIN_TOKEN_LEN: usize = 10;
pub const MAX_TOKEN_LEN: usize = 200;

// Number of token characters kept when a token appears in logs.
const REDACTED_PREFIX_LEN: usize = 20;

/// Reasons a caller-supplied token is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("key must be {MIN_TOKEN_LEN}-{MAX_TOKEN_LEN} characters long, got {0}")]
    Length(usize),

    #[error("key must contain printable ASCII characters only")]
    Charset,
}

/// A validated idempotency token: 10–200 printable ASCII characters.
///
/// # Examples
///
/// ```
/// use rttp_idempotency::idempotency::IdempotencyToken;
///
/// assert!(IdempotencyToken::parse("ABCDEFGHIJ").is_ok());
/// assert!(IdempotencyToken::parse("ABCDEFGHI").is_err());
/// assert!(IdempotencyToken::parse("ABCDEFGHIJ\u{e9}").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Validate `raw` after trimming surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let token = raw.trim();
        if !token.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(TokenError::Charset);
        }
        if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len()) {
            return Err(TokenError::Length(token.len()));
        }
        Ok(Self(token.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The token shortened for log output.
    pub fn redacted(&self) -> &str {
        // ASCII only, so any byte index is a char boundary.
        &self.0[..self.0.len().min(REDACTED_PREFIX_LEN)]
    }
}

impl FromStr for IdempotencyToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Validate a raw header value as an [`IdempotencyToken`].
pub fn validate_token(raw: &str) -> Result<IdempotencyToken, TokenError> {
    IdempotencyToken::parse(raw)
}

/// The tenant/user segment of a key: `tenant:user`, `user` or `anonymous`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerScope(String);

impl CallerScope {
    pub fn anonymous() -> Self {
        Self("anonymous".to_owned())
    }

    pub fn from_principal(principal: Option<&Principal>) -> Self {
        match principal {
            Some(p) if !p.user_id.is_empty() => Self(p.to_string()),
            _ => Self::anonymous(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hex-encoded SHA-256 digest of a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadHash(String);

impl PayloadHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request payload as available to the fingerprinting step.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// The exact bytes the client sent.
    Raw(&'a [u8]),
    /// A structured body decoded upstream, used when the raw bytes are gone.
    ///
    /// Hashing its canonical re-serialization is weaker than hashing raw bytes:
    /// two bodies that differ only in key order or whitespace hash equal, and a
    /// body whose decoding was lossy can hash differently from what was sent.
    Structured(&'a serde_json::Value),
}

impl<'a> Payload<'a> {
    /// Prefer the raw body; fall back to an upstream-decoded body when the raw
    /// bytes are empty.
    pub fn from_context(ctx: &'a Context) -> Self {
        let raw: &[u8] = ctx.request().body();
        match ctx.parsed_body() {
            Some(value) if raw.is_empty() => Payload::Structured(value),
            _ => Payload::Raw(raw),
        }
    }
}

/// Digest a payload.
pub fn hash_payload(payload: Payload<'_>) -> PayloadHash {
    let mut hasher = Sha256::new();
    match payload {
        Payload::Raw(bytes) => hasher.update(bytes),
        // serde_json's default map is ordered by key, so `to_vec` is canonical.
        Payload::Structured(value) => hasher.update(serde_json::to_vec(value).unwrap_or_default()),
    }
    PayloadHash(hex::encode(hasher.finalize()))
}

// Text of a namespaced key plus where its token segment starts, for redaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopedKey {
    text: String,
    token_at: usize,
}

impl ScopedKey {
    fn build(namespace: &str, scope: &CallerScope, method: &Method, path: &str, token: &IdempotencyToken) -> Self {
        let prefix = format!("{namespace}:{KEY_VERSION}:{}:{}:{path}:", scope.as_str(), method.as_str());
        Self {
            token_at: prefix.len(),
            text: prefix + token.as_str(),
        }
    }

    fn redacted(&self) -> String {
        let token = &self.text[self.token_at..];
        let cut = token.len().min(REDACTED_PREFIX_LEN);
        let ellipsis = if cut < token.len() { "..." } else { "" };
        format!("{}{}{ellipsis}", &self.text[..self.token_at], &token[..cut])
    }
}

/// Key of a cached outcome: `idem:v1:{scope}:{VERB}:{path}:{token}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(ScopedKey);

/// Key of the lock guarding a [`DedupKey`]: `idemlock:v1:{scope}:{VERB}:{path}:{token}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(ScopedKey);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    pub fn redacted(&self) -> String {
        self.0.redacted()
    }
}

impl LockKey {
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    pub fn redacted(&self) -> String {
        self.0.redacted()
    }
}

/// Everything the deriver reads from an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintInput<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub scope: &'a CallerScope,
    pub token: &'a IdempotencyToken,
    pub payload: Payload<'a>,
}

/// The identity of one logical attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub dedup_key: DedupKey,
    pub lock_key: LockKey,
    pub payload_hash: PayloadHash,
}

/// Strip the query string and any trailing slash (except on the root).
pub fn normalize_path(path: &str) -> &str {
    let path = path.split_once('?').map_or(path, |(p, _)| p);
    match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    }
}

/// Derive the dedup key, lock key and payload hash of a request.
///
/// # Examples
///
/// ```
/// use rttp_idempotency::Method;
/// use rttp_idempotency::idempotency::fingerprint::{self, CallerScope, FingerprintInput, Payload};
/// use rttp_idempotency::idempotency::IdempotencyToken;
///
/// let token = IdempotencyToken::parse("ABCDEFGHIJ").unwrap();
/// let scope = CallerScope::anonymous();
/// let fp = fingerprint::derive(FingerprintInput {
///     method: &Method::Post,
///     path: "/orders?x=1",
///     scope: &scope,
///     token: &token,
///     payload: Payload::Raw(b"{}"),
/// });
/// assert_eq!(fp.dedup_key.as_str(), "idem:v1:anonymous:POST:/orders:ABCDEFGHIJ");
/// assert_eq!(fp.lock_key.as_str(), "idemlock:v1:anonymous:POST:/orders:ABCDEFGHIJ");
/// ```
pub fn derive(input: FingerprintInput<'_>) -> Fingerprint {
    let path = normalize_path(input.path);
    Fingerprint {
        dedup_key: DedupKey(ScopedKey::build(OUTCOME_NAMESPACE, input.scope, input.method, path, input.token)),
        lock_key: LockKey(ScopedKey::build(LOCK_NAMESPACE, input.scope, input.method, path, input.token)),
        payload_hash: hash_payload(input.payload),
    }
}
