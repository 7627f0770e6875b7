//! # rttp-idempotency
//!
//! Exactly-once execution of retried HTTP mutations, as a middleware layer for
//! the rttp request pipeline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_idempotency::{Method, Request, Response, StatusCode};
//! use rttp_idempotency::cache::MemoryStore;
//! use rttp_idempotency::context::Context;
//! use rttp_idempotency::idempotency::{Coordinator, IdempotencyConfig, RouteOptions};
//! use rttp_idempotency::middleware::{LoggerMiddleware, Next, endpoint, from_middleware};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = Coordinator::builder(Arc::new(MemoryStore::new()))
//!         .config(IdempotencyConfig::from_env())
//!         .route(Method::Post, "/payments", RouteOptions::new().required())
//!         .build();
//!
//!     let raw = b"POST /payments HTTP/1.1\r\nIdempotency-Key: pay-2f9c81d7e4\r\nContent-Length: 2\r\n\r\n{}";
//!     let (request, _) = Request::parse(raw)?;
//!
//!     let chain = Next::new(vec![
//!         from_middleware(Arc::new(LoggerMiddleware)),
//!         coordinator.into_handler(),
//!         endpoint(|_ctx| async { Response::new(StatusCode::Created).body("charged") }),
//!     ]);
//!     let response = chain.run(Context::new(request)).await;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod idempotency;
pub mod middleware;
pub mod router;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use idempotency::{Coordinator, IdempotencyConfig, IdempotencyError, RouteOptions};
