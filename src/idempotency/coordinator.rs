//! The idempotency state machine.
//!
//! ```text
//! CLASSIFY ──bypass──────────────────────────────────────────► next.run
//!    │
//!  token ──missing/invalid──► 400
//!    │
//! LOOKUP ──hit──► REPLAY (409 on payload mismatch)
//!    │
//!  LOCK ──contended──► WAIT-FOR-PEER ──► REPLAY | 409 in progress
//!    │
//! RECHECK ──hit──► release, REPLAY
//!    │
//! EXECUTE ──► cache write (if cacheable) ──► release ──► response
//! ```
//!
//! A store that cannot be reached at LOOKUP or LOCK is handled by
//! [`StorePolicy`]: the handler runs unprotected, or the request is rejected.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::config::{IdempotencyConfig, RouteOptions, StorePolicy};
use super::error::IdempotencyError;
use super::fingerprint::{self, CallerScope, Fingerprint, FingerprintInput, IdempotencyToken, Payload};
use crate::cache::{CachedOutcome, KeyValueStore, LockAttempt, LockGuard, Lookup, OutcomeStore};
use crate::context::Context;
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::router::RouteTable;
use crate::{Method, Response, StatusCode};

/// Deduplicates mutating requests that carry an idempotency token.
///
/// Cheap to clone; every clone shares the same store, configuration and route
/// table. Mount it in a middleware chain ahead of the handlers it protects.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_idempotency::{Method, Request, Response, StatusCode};
/// use rttp_idempotency::cache::MemoryStore;
/// use rttp_idempotency::context::Context;
/// use rttp_idempotency::idempotency::{Coordinator, RouteOptions, REPLAY_HEADER};
/// use rttp_idempotency::middleware::{Next, endpoint};
///
/// # #[tokio::main]
/// # async fn main() {
/// let coordinator = Coordinator::builder(Arc::new(MemoryStore::new()))
///     .route(Method::Post, "/orders", RouteOptions::new().required())
///     .build();
///
/// let chain = || Next::new(vec![
///     coordinator.clone().into_handler(),
///     endpoint(|_ctx| async { Response::new(StatusCode::Created).body("order-1") }),
/// ]);
/// let request = || {
///     let raw = b"POST /orders HTTP/1.1\r\nIdempotency-Key: order-7f3a9c21\r\nContent-Length: 2\r\n\r\n{}";
///     Context::new(Request::parse(raw).unwrap().0)
/// };
///
/// let first = chain().run(request()).await;
/// let retry = chain().run(request()).await;
/// assert_eq!(first.status(), StatusCode::Created);
/// assert_eq!(retry.content(), b"order-1");
/// assert_eq!(retry.headers().get(REPLAY_HEADER), Some("1"));
/// # }
/// ```
#[derive(Clone)]
pub struct Coordinator {
    store: OutcomeStore,
    config: Arc<IdempotencyConfig>,
    routes: Arc<RouteTable<RouteOptions>>,
}

/// Builder returned by [`Coordinator::builder`].
pub struct CoordinatorBuilder {
    backend: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
    routes: RouteTable<RouteOptions>,
}

impl CoordinatorBuilder {
    /// Replace the default deployment configuration.
    #[must_use]
    pub fn config(mut self, config: IdempotencyConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare the options of requests with `method` whose path matches
    /// `pattern`. The first matching declaration wins.
    #[must_use]
    pub fn route(mut self, method: Method, pattern: &str, options: RouteOptions) -> Self {
        self.routes.insert(method, pattern, options);
        self
    }

    pub fn build(self) -> Coordinator {
        let store = OutcomeStore::new(self.backend).with_op_timeout(self.config.store_timeout);
        Coordinator {
            store,
            config: Arc::new(self.config),
            routes: Arc::new(self.routes),
        }
    }
}

// How an EXECUTE span ended, reported back from its task.
enum Execution {
    Completed(Response),
    Panicked(Box<dyn Any + Send + 'static>),
    Aborted,
}

impl Coordinator {
    pub fn builder(backend: Arc<dyn KeyValueStore>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            backend,
            config: IdempotencyConfig::default(),
            routes: RouteTable::new(),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Wrap this coordinator as a chain entry.
    pub fn into_handler(self) -> MiddlewareHandler {
        from_middleware(Arc::new(self))
    }

    /// Run one request through the state machine.
    ///
    /// `next` is invoked at most once, and never when the request is replayed or
    /// rejected.
    ///
    /// # Errors
    ///
    /// - [`IdempotencyError::MissingToken`] / [`IdempotencyError::InvalidToken`]:
    ///   rejected before any store access.
    /// - [`IdempotencyError::PayloadMismatch`]: the token was used with a
    ///   different payload.
    /// - [`IdempotencyError::InProgress`]: a peer still holds the lock after
    ///   the wait budget.
    /// - [`IdempotencyError::StoreUnavailable`]: the store failed under
    ///   [`StorePolicy::FailClosed`]. Rendered as a 400 like the other caller
    ///   rejections.
    ///
    /// # Panics
    ///
    /// A panic in the downstream handler is resumed here after the lock has
    /// been released.
    pub async fn coordinate(&self, ctx: Context, next: Next) -> Result<Response, IdempotencyError> {
        let method = ctx.request().method().clone();
        if !method.has_side_effects() {
            return Ok(next.run(ctx).await);
        }

        let path = fingerprint::normalize_path(ctx.request().path()).to_owned();
        let options = match self.routes.resolve(&method, &path) {
            Some(options) => *options,
            None if self.config.protect_undeclared_routes => RouteOptions::default(),
            None => return Ok(next.run(ctx).await),
        };

        let raw_token = ctx
            .request()
            .headers()
            .get(&self.config.header_name)
            .map(str::trim)
            .filter(|raw| !raw.is_empty());
        let token = match raw_token {
            Some(raw) => IdempotencyToken::parse(raw)?,
            None if options.is_required() || self.config.require_token => {
                return Err(IdempotencyError::MissingToken {
                    header: self.config.header_name.clone(),
                });
            }
            None => {
                warn!(%method, %path, "mutating request without idempotency key; executing unprotected");
                return Ok(next.run(ctx).await);
            }
        };

        let scope = CallerScope::from_principal(ctx.principal());
        let fp = fingerprint::derive(FingerprintInput {
            method: &method,
            path: &path,
            scope: &scope,
            token: &token,
            payload: Payload::from_context(&ctx),
        });
        let ttl = options.ttl_override().unwrap_or(self.config.default_ttl);

        match self.store.read_outcome(&fp.dedup_key).await {
            Lookup::Hit(outcome) => return self.replay(&fp, &outcome),
            Lookup::Miss => {}
            Lookup::Unavailable => return self.run_unprotected(&fp, ctx, next).await,
        }

        let guard = match self.store.acquire_lock(&fp.lock_key, self.config.lock_ttl).await {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Contended => return self.wait_for_peer(&fp).await,
            LockAttempt::Unavailable => return self.run_unprotected(&fp, ctx, next).await,
        };

        // A peer may have finished between the lookup and the lock.
        match self.store.read_outcome(&fp.dedup_key).await {
            Lookup::Hit(outcome) => {
                guard.release().await;
                return self.replay(&fp, &outcome);
            }
            Lookup::Miss => {}
            Lookup::Unavailable if self.config.store_policy == StorePolicy::FailClosed => {
                guard.release().await;
                return Err(IdempotencyError::StoreUnavailable);
            }
            // The lock is held, so executing still excludes concurrent peers.
            Lookup::Unavailable => {
                warn!(key = %fp.dedup_key.redacted(), store_policy = "fail-open", "recheck failed; executing under the lock");
            }
        }

        Ok(self.execute(ctx, next, fp, guard, options, ttl).await)
    }

    fn replay(&self, fp: &Fingerprint, outcome: &CachedOutcome) -> Result<Response, IdempotencyError> {
        if !outcome.admits(Some(&fp.payload_hash)) {
            warn!(key = %fp.dedup_key.redacted(), "idempotency key reused with a different payload");
            return Err(IdempotencyError::PayloadMismatch);
        }
        debug!(
            key = %fp.dedup_key.redacted(),
            status = outcome.status_code.as_u16(),
            "replaying cached outcome"
        );
        Ok(outcome.to_replay())
    }

    async fn run_unprotected(
        &self,
        fp: &Fingerprint,
        ctx: Context,
        next: Next,
    ) -> Result<Response, IdempotencyError> {
        match self.config.store_policy {
            StorePolicy::FailOpen => {
                warn!(key = %fp.dedup_key.redacted(), store_policy = "fail-open", "store unavailable; executing without deduplication");
                Ok(next.run(ctx).await)
            }
            StorePolicy::FailClosed => Err(IdempotencyError::StoreUnavailable),
        }
    }

    async fn wait_for_peer(&self, fp: &Fingerprint) -> Result<Response, IdempotencyError> {
        debug!(key = %fp.dedup_key.redacted(), "lock held by a peer; waiting for its outcome");
        for delay in self.config.wait.delays() {
            tokio::time::sleep(delay).await;
            match self.store.read_outcome(&fp.dedup_key).await {
                Lookup::Hit(outcome) => return self.replay(fp, &outcome),
                Lookup::Miss => {}
                Lookup::Unavailable => {
                    if self.config.store_policy == StorePolicy::FailClosed {
                        return Err(IdempotencyError::StoreUnavailable);
                    }
                }
            }
        }
        info!(key = %fp.dedup_key.redacted(), "peer still processing after wait budget");
        Err(IdempotencyError::InProgress)
    }

    // The span runs on its own task so a dropped caller neither cancels the
    // handler nor releases the lock early. The handler gets a nested task so a
    // panic is caught and the lock released before the panic resumes.
    async fn execute(
        &self,
        ctx: Context,
        next: Next,
        fp: Fingerprint,
        guard: LockGuard,
        options: RouteOptions,
        ttl: Duration,
    ) -> Response {
        let store = self.store.clone();
        let key = fp.dedup_key.redacted();

        let span = tokio::spawn(async move {
            let execution = match tokio::spawn(next.run(ctx)).await {
                Ok(response) => {
                    if options.is_cacheable(response.status()) {
                        let outcome = CachedOutcome::capture(&response, Some(fp.payload_hash));
                        store.write_outcome(&fp.dedup_key, &outcome, ttl).await;
                    } else {
                        debug!(key = %fp.dedup_key.redacted(), status = response.status().as_u16(), "outcome not cacheable");
                    }
                    Execution::Completed(response)
                }
                Err(join_error) => {
                    if options.caches_errors() {
                        let outcome = CachedOutcome::handler_failure(Some(fp.payload_hash));
                        store.write_outcome(&fp.dedup_key, &outcome, ttl).await;
                    }
                    match join_error.try_into_panic() {
                        Ok(payload) => Execution::Panicked(payload),
                        Err(_) => Execution::Aborted,
                    }
                }
            };
            guard.release().await;
            execution
        });

        match span.await {
            Ok(Execution::Completed(response)) => response,
            Ok(Execution::Panicked(payload)) => {
                error!(%key, "handler panicked; lock released");
                std::panic::resume_unwind(payload)
            }
            Ok(Execution::Aborted) | Err(_) => {
                error!(%key, "handler task aborted");
                Response::new(StatusCode::InternalServerError)
            }
        }
    }
}

impl Middleware for Coordinator {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let coordinator = self.clone();
        Box::pin(async move {
            match coordinator.coordinate(ctx, next).await {
                Ok(response) => response,
                Err(e) => {
                    if matches!(e, IdempotencyError::StoreUnavailable) {
                        error!(store_policy = "fail-closed", error = %e, "rejecting request");
                    } else {
                        debug!(error = %e, code = e.code(), "rejecting request");
                    }
                    e.into_response()
                }
            }
        })
    }
}
