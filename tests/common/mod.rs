//! Shared fixtures: store doubles, request builders and handler chains.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rttp_idempotency::cache::{KeyValueStore, MemoryStore, StoreError};
use rttp_idempotency::context::Context;
use rttp_idempotency::idempotency::{Coordinator, IdempotencyConfig, WaitPolicy};
use rttp_idempotency::middleware::{MiddlewareHandler, Next, endpoint};
use rttp_idempotency::{Request, Response, StatusCode};

pub const TOKEN: &str = "ABCDEFGHIJ";

/// Install a log subscriber once; `RUST_LOG=rttp_idempotency=debug` shows the
/// state machine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A [`MemoryStore`] that records every operation it serves.
///
/// Setting `offline` makes every call fail as if the store were unreachable.
/// `set_offline_after(n)` lets the first `n` calls through and fails the rest.
pub struct RecordingStore {
    inner: MemoryStore,
    ops: Mutex<Vec<String>>,
    offline: AtomicBool,
    healthy_ops: AtomicUsize,
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self {
            inner: MemoryStore::new(),
            ops: Mutex::default(),
            offline: AtomicBool::new(false),
            healthy_ops: AtomicUsize::new(usize::MAX),
        }
    }
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn op_count(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_offline_after(&self, healthy_ops: usize) {
        self.healthy_ops.store(healthy_ops, Ordering::SeqCst);
    }

    pub fn backend(&self) -> &MemoryStore {
        &self.inner
    }

    fn record(&self, op: &str, key: &str) -> Result<(), StoreError> {
        let served = {
            let mut ops = self.ops.lock().unwrap();
            ops.push(format!("{op} {key}"));
            ops.len()
        };
        if self.offline.load(Ordering::SeqCst) || served > self.healthy_ops.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.record("get", key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.record("set", key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.record("set_if_absent", key)?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.record("delete", key)?;
        self.inner.delete(key).await
    }
}

/// A store that never answers within any reasonable timeout.
pub struct HangingStore;

#[async_trait]
impl KeyValueStore for HangingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        std::future::pending().await
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool, StoreError> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        std::future::pending().await
    }
}

/// Configuration with a short wait budget so contention tests stay fast.
pub fn fast_config() -> IdempotencyConfig {
    IdempotencyConfig {
        wait: WaitPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts: 5,
        },
        store_timeout: Duration::from_millis(200),
        ..IdempotencyConfig::default()
    }
}

pub fn request(method: &str, path: &str, token: Option<&str>, body: &str) -> Context {
    let token_line = token
        .map(|t| format!("Idempotency-Key: {t}\r\n"))
        .unwrap_or_default();
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: api.test\r\nContent-Type: application/json\r\n{token_line}Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    Context::new(Request::parse(raw.as_bytes()).unwrap().0)
}

pub fn post(token: &str, body: &str) -> Context {
    request("POST", "/orders", Some(token), body)
}

/// A terminal handler that counts its invocations and answers with `status`
/// and a body naming the invocation, after `delay`.
#[derive(Clone)]
pub struct CountingHandler {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
    delay: Duration,
}

impl CountingHandler {
    pub fn new(status: StatusCode) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            status,
            delay: Duration::ZERO,
        }
    }

    pub fn slow(status: StatusCode, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(status)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn handler(&self) -> MiddlewareHandler {
        let this = self.clone();
        endpoint(move |_ctx| {
            let this = this.clone();
            async move {
                let n = this.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if !this.delay.is_zero() {
                    tokio::time::sleep(this.delay).await;
                }
                Response::new(this.status)
                    .header("Content-Type", "application/json")
                    .header("X-Request-Id", format!("req-{n}"))
                    .body(format!(r#"{{"order":{n}}}"#))
            }
        })
    }
}

pub fn chain(coordinator: &Coordinator, handler: MiddlewareHandler) -> Next {
    Next::new(vec![coordinator.clone().into_handler(), handler])
}

pub fn body_json(response: &Response) -> serde_json::Value {
    serde_json::from_slice(response.content()).unwrap()
}
