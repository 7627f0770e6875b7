mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use rttp_idempotency::cache::KeyValueStore;
use rttp_idempotency::context::Principal;
use rttp_idempotency::idempotency::{
    Coordinator, IdempotencyConfig, REPLAY_HEADER, RouteOptions, StorePolicy,
};
use rttp_idempotency::middleware::endpoint;
use rttp_idempotency::{Method, Response, StatusCode};

const OUTCOME_KEY: &str = "idem:v1:anonymous:POST:/orders:ABCDEFGHIJ";
const LOCK_KEY: &str = "idemlock:v1:anonymous:POST:/orders:ABCDEFGHIJ";

fn coordinator_over(store: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Coordinator {
    Coordinator::builder(store)
        .config(config)
        .route(Method::Post, "/orders", RouteOptions::new().required())
        .build()
}

// ── Replay ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn retry_after_completion_replays_first_outcome() {
    init_tracing();
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    let first = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    let retry = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(first.status(), StatusCode::Created);
    assert_eq!(retry.status(), StatusCode::Created);
    assert_eq!(retry.content(), first.content());
    assert_eq!(retry.content_type(), Some("application/json"));
    assert_eq!(retry.headers().get("x-request-id"), Some("req-1"));
    assert_eq!(retry.headers().get(REPLAY_HEADER), Some("1"));
    assert!(!first.headers().contains(REPLAY_HEADER));
}

#[tokio::test]
async fn store_sees_versioned_keys_and_lock_release() {
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    let ops = store.ops();
    assert_eq!(ops[0], format!("get {OUTCOME_KEY}"));
    assert_eq!(ops[1], format!("set_if_absent {LOCK_KEY}"));
    assert!(ops.contains(&format!("set_if_absent {OUTCOME_KEY}")));
    assert_eq!(ops.last(), Some(&format!("delete {LOCK_KEY}")));
    // Outcomes are only ever written conditionally.
    assert!(!ops.iter().any(|op| op.starts_with("set ")));
    assert_eq!(store.backend().get(LOCK_KEY).await.unwrap(), None);
    assert!(store.backend().get(OUTCOME_KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn tenant_scope_is_part_of_the_key() {
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    let ctx = post(TOKEN, "{}").with_principal(Principal::user("u-1").in_tenant("acme"));
    chain(&coordinator, handler.handler()).run(ctx).await;

    assert_eq!(store.ops()[0], "get idem:v1:acme:u-1:POST:/orders:ABCDEFGHIJ");

    // Same token from another tenant is a different attempt.
    let ctx = post(TOKEN, "{}").with_principal(Principal::user("u-1").in_tenant("globex"));
    chain(&coordinator, handler.handler()).run(ctx).await;
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn ttl_override_bounds_the_replay_window() {
    let coordinator = Coordinator::builder(RecordingStore::new())
        .config(fast_config())
        .route(
            Method::Post,
            "/orders",
            RouteOptions::new().ttl(Duration::from_millis(50)),
        )
        .build();
    let handler = CountingHandler::new(StatusCode::Created);

    chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(handler.calls(), 2);
    assert!(!later.headers().contains(REPLAY_HEADER));
}

#[tokio::test]
async fn unbounded_ttl_override_still_replays() {
    let coordinator = Coordinator::builder(RecordingStore::new())
        .config(fast_config())
        .route(Method::Post, "/orders", RouteOptions::new().ttl(Duration::MAX))
        .build();
    let handler = CountingHandler::new(StatusCode::Created);

    let first = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    let retry = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(first.status(), StatusCode::Created);
    assert_eq!(retry.status(), StatusCode::Created);
    assert_eq!(retry.headers().get(REPLAY_HEADER), Some("1"));
    assert_eq!(handler.calls(), 1);
}

// ── Conflicts ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn same_token_different_payload_conflicts() {
    let coordinator = coordinator_over(RecordingStore::new(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    chain(&coordinator, handler.handler())
        .run(post(TOKEN, r#"{"amount":10}"#))
        .await;
    let mismatch = chain(&coordinator, handler.handler())
        .run(post(TOKEN, r#"{"amount":99}"#))
        .await;

    assert_eq!(mismatch.status(), StatusCode::Conflict);
    assert!(!mismatch.headers().contains(REPLAY_HEADER));
    assert_eq!(body_json(&mismatch)["error"], "IDEMPOTENCY_KEY_REUSED");
    assert_eq!(body_json(&mismatch)["statusCode"], 409);

    // The original payload still replays.
    let original = chain(&coordinator, handler.handler())
        .run(post(TOKEN, r#"{"amount":10}"#))
        .await;
    assert_eq!(original.status(), StatusCode::Created);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn lock_held_by_peer_without_result_conflicts() {
    let store = RecordingStore::new();
    store
        .backend()
        .set_if_absent(LOCK_KEY, "{}", Duration::from_secs(60))
        .await
        .unwrap();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(response.status(), StatusCode::Conflict);
    assert_eq!(body_json(&response)["error"], "IDEMPOTENCY_IN_PROGRESS");
    assert_eq!(handler.calls(), 0);
    // One lookup, one lock attempt, then one poll per configured delay.
    let polls = store.ops().iter().filter(|op| op.starts_with("get ")).count();
    assert_eq!(polls, 1 + fast_config().wait.max_attempts as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attempts_execute_once() {
    let mut config = fast_config();
    config.wait.max_attempts = 30;
    let coordinator = coordinator_over(RecordingStore::new(), config);
    let handler = CountingHandler::slow(StatusCode::Created, Duration::from_millis(150));

    let mut attempts = Vec::new();
    for _ in 0..8 {
        let next = chain(&coordinator, handler.handler());
        attempts.push(tokio::spawn(next.run(post(TOKEN, r#"{"sku":"A-1"}"#))));
    }

    let mut responses = Vec::new();
    for attempt in attempts {
        responses.push(attempt.await.unwrap());
    }

    assert_eq!(handler.calls(), 1);
    for response in &responses {
        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(response.content(), br#"{"order":1}"#);
    }
    let replays = responses
        .iter()
        .filter(|r| r.headers().contains(REPLAY_HEADER))
        .count();
    assert_eq!(replays, 7);
}

#[tokio::test]
async fn different_payload_while_peer_runs_conflicts_once_it_finishes() {
    let mut config = fast_config();
    config.wait.max_attempts = 20;
    let coordinator = coordinator_over(RecordingStore::new(), config);
    let handler = CountingHandler::slow(StatusCode::Created, Duration::from_millis(60));

    let first = tokio::spawn(
        chain(&coordinator, handler.handler()).run(post(TOKEN, r#"{"amount":10}"#)),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = chain(&coordinator, handler.handler())
        .run(post(TOKEN, r#"{"amount":99}"#))
        .await;

    assert_eq!(second.status(), StatusCode::Conflict);
    assert_eq!(body_json(&second)["error"], "IDEMPOTENCY_KEY_REUSED");
    assert!(!second.headers().contains(REPLAY_HEADER));

    let first = first.await.unwrap();
    assert_eq!(first.status(), StatusCode::Created);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn peer_that_outlasts_the_wait_budget_yields_in_progress() {
    let coordinator = coordinator_over(RecordingStore::new(), fast_config());
    let handler = CountingHandler::slow(StatusCode::Created, Duration::from_millis(500));

    let first = tokio::spawn(chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    assert_eq!(second.status(), StatusCode::Conflict);

    assert_eq!(first.await.unwrap().status(), StatusCode::Created);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn dropped_caller_keeps_the_lock_until_the_handler_finishes() {
    let coordinator = coordinator_over(RecordingStore::new(), fast_config());
    let handler = CountingHandler::slow(StatusCode::Created, Duration::from_millis(300));

    let first = tokio::spawn(chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")));
    tokio::time::sleep(Duration::from_millis(30)).await;
    first.abort();

    let during = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    assert_eq!(during.status(), StatusCode::Conflict);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let after = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    assert_eq!(after.status(), StatusCode::Created);
    assert_eq!(after.headers().get(REPLAY_HEADER), Some("1"));
    assert_eq!(handler.calls(), 1);
}

// ── Validation and bypass ─────────────────────────────────────────────────────

#[tokio::test]
async fn missing_mandatory_token_is_rejected_without_store_access() {
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    let response = chain(&coordinator, handler.handler())
        .run(request("POST", "/orders", None, "{}"))
        .await;

    assert_eq!(response.status(), StatusCode::BadRequest);
    assert_eq!(body_json(&response)["error"], "IDEMPOTENCY_KEY_REQUIRED");
    assert_eq!(store.op_count(), 0);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn malformed_tokens_are_rejected_without_store_access() {
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    for token in ["a".repeat(9), "a".repeat(201), "ABCDEFGHI\u{e9}".to_owned()] {
        let response = chain(&coordinator, handler.handler())
            .run(post(&token, "{}"))
            .await;
        assert_eq!(response.status(), StatusCode::BadRequest, "token {token:?}");
        assert_eq!(body_json(&response)["error"], "IDEMPOTENCY_KEY_INVALID");
    }

    assert_eq!(store.op_count(), 0);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn safe_verbs_never_touch_the_store() {
    let store = RecordingStore::new();
    store.set_offline(true);
    let config = IdempotencyConfig {
        require_token: true,
        store_policy: StorePolicy::FailClosed,
        ..fast_config()
    };
    let coordinator = coordinator_over(store.clone(), config);
    let handler = CountingHandler::new(StatusCode::Ok);

    for method in ["GET", "HEAD", "OPTIONS"] {
        let response = chain(&coordinator, handler.handler())
            .run(request(method, "/orders", Some(TOKEN), ""))
            .await;
        assert_eq!(response.status(), StatusCode::Ok);
    }

    assert_eq!(store.op_count(), 0);
    assert_eq!(handler.calls(), 3);
}

// ── Handler failures ──────────────────────────────────────────────────────────

fn panics_once(calls: Arc<AtomicUsize>) -> rttp_idempotency::middleware::MiddlewareHandler {
    endpoint(move |_ctx| {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("ledger write failed");
            }
            Response::new(StatusCode::Created).body("ok")
        }
    })
}

#[tokio::test]
async fn panicking_handler_releases_the_lock() {
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = tokio::spawn(chain(&coordinator, panics_once(calls.clone())).run(post(TOKEN, "{}")));
    assert!(first.await.unwrap_err().is_panic());
    assert_eq!(store.backend().get(LOCK_KEY).await.unwrap(), None);

    let retry = chain(&coordinator, panics_once(calls.clone()))
        .run(post(TOKEN, "{}"))
        .await;
    assert_eq!(retry.status(), StatusCode::Created);
    assert!(!retry.headers().contains(REPLAY_HEADER));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panic_on_cache_errors_route_is_replayed_as_500() {
    let coordinator = Coordinator::builder(RecordingStore::new())
        .config(fast_config())
        .route(Method::Post, "/orders", RouteOptions::new().cache_errors())
        .build();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = tokio::spawn(chain(&coordinator, panics_once(calls.clone())).run(post(TOKEN, "{}")));
    assert!(first.await.unwrap_err().is_panic());

    let retry = chain(&coordinator, panics_once(calls.clone()))
        .run(post(TOKEN, "{}"))
        .await;
    assert_eq!(retry.status(), StatusCode::InternalServerError);
    assert_eq!(retry.headers().get(REPLAY_HEADER), Some("1"));
    assert_eq!(body_json(&retry)["statusCode"], 500);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn error_responses_are_not_cached_by_default() {
    let coordinator = coordinator_over(RecordingStore::new(), fast_config());
    let handler = CountingHandler::new(StatusCode::UnprocessableEntity);

    for _ in 0..2 {
        let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
        assert_eq!(response.status(), StatusCode::UnprocessableEntity);
        assert!(!response.headers().contains(REPLAY_HEADER));
    }
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn redirects_are_cached_by_default() {
    let coordinator = coordinator_over(RecordingStore::new(), fast_config());
    let handler = CountingHandler::new(StatusCode::SeeOther);

    let first = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    let retry = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(first.status(), StatusCode::SeeOther);
    assert_eq!(retry.status(), StatusCode::SeeOther);
    assert_eq!(retry.headers().get(REPLAY_HEADER), Some("1"));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn error_responses_replay_when_the_route_opts_in() {
    let coordinator = Coordinator::builder(RecordingStore::new())
        .config(fast_config())
        .route(
            Method::Post,
            "/orders",
            RouteOptions::new().required().cache_errors(),
        )
        .build();
    let handler = CountingHandler::new(StatusCode::UnprocessableEntity);

    chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
    let retry = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(retry.status(), StatusCode::UnprocessableEntity);
    assert_eq!(retry.headers().get(REPLAY_HEADER), Some("1"));
    assert_eq!(handler.calls(), 1);
}

// ── Store availability ────────────────────────────────────────────────────────

#[tokio::test]
async fn unavailable_store_fails_open_by_default() {
    let store = RecordingStore::new();
    store.set_offline(true);
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    for _ in 0..2 {
        let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;
        assert_eq!(response.status(), StatusCode::Created);
    }
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn unavailable_store_fails_closed_when_configured() {
    let store = RecordingStore::new();
    store.set_offline(true);
    let config = IdempotencyConfig {
        store_policy: StorePolicy::FailClosed,
        ..fast_config()
    };
    let coordinator = coordinator_over(store.clone(), config);
    let handler = CountingHandler::new(StatusCode::Created);

    let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(response.status(), StatusCode::BadRequest);
    assert_eq!(body_json(&response)["error"], "IDEMPOTENCY_UNAVAILABLE");
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn failed_recheck_fails_closed_and_releases_the_lock() {
    let store = RecordingStore::new();
    // Lookup and lock succeed; the recheck is the first failure.
    store.set_offline_after(2);
    let config = IdempotencyConfig {
        store_policy: StorePolicy::FailClosed,
        ..fast_config()
    };
    let coordinator = coordinator_over(store.clone(), config);
    let handler = CountingHandler::new(StatusCode::Created);

    let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(response.status(), StatusCode::BadRequest);
    assert_eq!(body_json(&response)["error"], "IDEMPOTENCY_UNAVAILABLE");
    assert_eq!(handler.calls(), 0);
    let ops = store.ops();
    assert_eq!(ops[2], format!("get {OUTCOME_KEY}"));
    assert_eq!(ops.last(), Some(&format!("delete {LOCK_KEY}")));
}

#[tokio::test]
async fn failed_recheck_fails_open_under_the_lock() {
    let store = RecordingStore::new();
    store.set_offline_after(2);
    let coordinator = coordinator_over(store.clone(), fast_config());
    let handler = CountingHandler::new(StatusCode::Created);

    let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(response.status(), StatusCode::Created);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn store_timeout_is_treated_as_unavailable() {
    let config = IdempotencyConfig {
        store_policy: StorePolicy::FailClosed,
        store_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let coordinator = coordinator_over(Arc::new(HangingStore), config);
    let handler = CountingHandler::new(StatusCode::Created);

    let response = chain(&coordinator, handler.handler()).run(post(TOKEN, "{}")).await;

    assert_eq!(response.status(), StatusCode::BadRequest);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn store_dropping_out_mid_flight_does_not_block_the_response() {
    let store = RecordingStore::new();
    let coordinator = coordinator_over(store.clone(), fast_config());
    let store_for_handler = store.clone();
    let handler = endpoint(move |_ctx| {
        let store = store_for_handler.clone();
        async move {
            // The store drops out after the lock was taken.
            store.set_offline(true);
            Response::new(StatusCode::Created).body("made")
        }
    });

    let response = chain(&coordinator, handler).run(post(TOKEN, "{}")).await;
    assert_eq!(response.status(), StatusCode::Created);
    assert_eq!(response.content(), b"made");
}
