use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::body::to_bytes;
use axum::extract::ConnectInfo;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::http::header::RETRY_AFTER;
use axum::response::Response;
use longshot_limit::Admission;
use longshot_limit::Algorithm;
use longshot_limit::FixedWindow;
use longshot_limit::MemoryStore;
use longshot_limit::Permit;
use longshot_limit::Reason;
use longshot_limit::SlidingWindow;
use longshot_limit::Strategy;
use longshot_limit::TokenBucket;
use serde_json::Value;
use tokio::time::Instant;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;

use super::*;
use crate::app::with_boundary;

use futures::future::Ready;
use futures::future::ready;

#[derive(Clone)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl Service<Request<Body>> for MockService {
    type Response = Response;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<Body>) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(Response::new(Body::from("ok"))))
    }
}

// A mock strategy that always gives the same answer
#[derive(Debug)]
struct FixedOutcome(ControlFlow<Reason, Permit>);

impl Strategy for FixedOutcome {
    fn process(&self, _key: &str) -> ControlFlow<Reason, Permit> {
        self.0.clone()
    }

    fn limit(&self) -> usize {
        7
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Distributed
    }
}

fn request(client: &str) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header(headers::CLIENT_ID, client)
        .body(Body::empty())
        .unwrap()
}

macro_rules! test_limiter_service {
    ($name:ident, $strategy_init:expr) => {
        #[cfg(test)]
        mod $name {
            use super::*;

            #[tokio::test]
            async fn test_rejects_then_recovers() {
                let (clock, mock) = quanta::Clock::mock();
                let capacity = NonZeroUsize::new(2).unwrap();
                let interval = Duration::from_millis(100);

                let strategy = ($strategy_init)(capacity, interval, clock);

                let count = Arc::new(AtomicUsize::new(0));
                let mock_svc = MockService {
                    count: Arc::clone(&count),
                };
                let mut service = RateLimitService::new(mock_svc, Arc::new(strategy));

                // 1. Burst up to capacity
                for remaining in ["1", "0"] {
                    let res = service.ready().await.unwrap().call(request("a")).await.unwrap();
                    assert_eq!(res.status(), StatusCode::OK);
                    assert_eq!(res.headers()[headers::LIMIT], "2");
                    assert_eq!(res.headers()[headers::REMAINING], remaining);
                }

                // 2. The next one never reaches the inner service
                let res = service.ready().await.unwrap().call(request("a")).await.unwrap();
                assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(res.headers()[RETRY_AFTER], "1");
                assert_eq!(count.load(Ordering::SeqCst), 2);

                // 3. Another client has its own allowance
                let res = service.ready().await.unwrap().call(request("b")).await.unwrap();
                assert_eq!(res.status(), StatusCode::OK);

                // 4. Advance time
                mock.increment(interval);

                // 5. Now it should succeed
                let res = service.ready().await.unwrap().call(request("a")).await.unwrap();
                assert_eq!(res.status(), StatusCode::OK);
                assert_eq!(count.load(Ordering::SeqCst), 4);
            }
        }
    };
}

// --- Applying the Macro to the local Strategies ---

test_limiter_service!(fixed_window_tests, FixedWindow::with_clock);

test_limiter_service!(sliding_window_tests, SlidingWindow::with_clock);

test_limiter_service!(
    token_bucket_tests,
    |capacity, interval, clock| TokenBucket::with_clock(capacity, capacity, interval, clock)
);

#[tokio::test]
async fn degraded_permits_are_flagged() {
    let strategy = FixedOutcome(ControlFlow::Continue(Permit {
        remaining: 0,
        degraded: true,
    }));
    let count = Arc::new(AtomicUsize::new(0));
    let svc = RateLimitLayer::new(Arc::new(strategy)).layer(MockService {
        count: Arc::clone(&count),
    });

    let res = svc.oneshot(request("a")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[headers::DEGRADED], "store-unavailable");
    assert_eq!(res.headers()[headers::ALGORITHM], "distributed");
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unavailable_store_is_a_503() {
    let strategy = FixedOutcome(ControlFlow::Break(Reason::Unavailable));
    let count = Arc::new(AtomicUsize::new(0));
    let svc = RateLimitLayer::new(Arc::new(strategy)).layer(MockService {
        count: Arc::clone(&count),
    });

    let res = svc.oneshot(request("a")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()[headers::LIMIT], "7");
    assert!(res.headers().get(RETRY_AFTER).is_none());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

// --- Router ---

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<MemoryStore>,
}

fn test_app(config: Config) -> TestApp {
    let state = AppState::from_config(&config);
    let store = Arc::new(MemoryStore::new());
    let limiters = Limiters::with_store(&config, store.clone()).unwrap();
    TestApp {
        router: router(state.clone(), &limiters),
        state,
        store,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let res = router.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_as(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(headers::CLIENT_ID, client)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn status_answers_at_once_when_newer() {
    let app = test_app(Config::default());
    app.state.events.mutate("EVENT#00", 42).unwrap();

    let uri = "/status?eventId=EVENT%2300&last_updated=0";
    let (status, _, body) = send(&app.router, get(uri)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["item"]["id"], "EVENT#00");
    assert_eq!(body["data"]["item"]["score"], 42);
    assert!(body["data"]["item"]["updatedAt"].as_u64().unwrap() > 0);
    assert_eq!(app.state.events.stats().registered, 0);
}

#[tokio::test(start_paused = true)]
async fn status_waits_for_the_next_mutation() {
    let app = test_app(Config::default());
    let start = Instant::now();

    let router = app.router.clone();
    let pending = tokio::spawn(async move {
        let res = send(&router, get("/status?eventId=EVENT%2300&last_updated=0")).await;
        (res, Instant::now())
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(app.state.events.waiting("EVENT#00"), 1);
    app.state.events.mutate("EVENT#00", 42).unwrap();

    let ((status, _, body), answered_at) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["item"]["score"], 42);
    assert_eq!(answered_at - start, Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn status_times_out_with_a_408() {
    let app = test_app(Config::default());
    let start = Instant::now();

    let uri = "/status?eventId=EVENT%2301&last_updated=0";
    let (status, _, body) = send(&app.router, get(uri)).await;

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Request timed out");
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_eq!(app.state.events.waiting("EVENT#01"), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_event_is_a_404_without_waiting() {
    let app = test_app(Config::default());
    let start = Instant::now();

    let uri = "/status?eventId=EVENT%2399&last_updated=0";
    let (status, _, body) = send(&app.router, get(uri)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Event not found");
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(app.state.events.stats().registered, 0);
}

#[tokio::test]
async fn bad_status_parameters_are_a_400() {
    let app = test_app(Config::default());

    for uri in [
        "/status",
        "/status?eventId=EVENT%2300",
        "/status?last_updated=0",
        "/status?eventId=EVENT%2300&last_updated=yesterday",
        "/status?eventId=EVENT%2300&last_updated=-5",
    ] {
        let (status, _, body) = send(&app.router, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["success"], false, "{uri}");
    }
    assert_eq!(app.state.events.stats().registered, 0);
}

#[tokio::test]
async fn events_can_be_listed_and_updated() {
    let app = test_app(Config::default());

    let (status, _, body) = send(&app.router, get("/events")).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["data"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[2]["id"], "EVENT#02");
    assert_eq!(items[2]["updatedAt"], 0);

    let update = Request::builder()
        .method("POST")
        .uri("/events/EVENT%2302")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"score": 9}"#))
        .unwrap();
    let (status, _, body) = send(&app.router, update).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["item"]["score"], 9);
    assert_eq!(app.state.events.snapshot("EVENT#02").unwrap().value, 9);

    let missing = Request::builder()
        .method("POST")
        .uri("/events/nope")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"score": 9}"#))
        .unwrap();
    let (status, _, _) = send(&app.router, missing).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_bucket_route_denies_the_sixth_request() {
    let app = test_app(Config::default());

    for remaining in (0..5).rev() {
        let (status, headers, body) =
            send(&app.router, get_as("/api/token-bucket", "c")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[headers::LIMIT], "5");
        assert_eq!(headers[headers::REMAINING], remaining.to_string().as_str());
        assert_eq!(headers[headers::ALGORITHM], "token-bucket");
        assert_eq!(body["algorithm"], "token-bucket");
    }

    let (status, headers, body) = send(&app.router, get_as("/api/token-bucket", "c")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[RETRY_AFTER], "1");
    assert_eq!(headers[headers::REMAINING], "0");
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["algorithm"], "token-bucket");
    assert_eq!(body["limit"], 5);
    assert_eq!(body["retryAfter"], 1);
}

#[tokio::test]
async fn fixed_window_route_reports_the_rest_of_the_window() {
    let mut config = Config::default();
    config.fixed_window = WindowConfig {
        max_requests: 6,
        window_ms: 20_000,
    };
    let app = test_app(config);

    for _ in 0..6 {
        let (status, _, _) = send(&app.router, get_as("/api/fixed-window", "c")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = send(&app.router, get_as("/api/fixed-window", "c")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[RETRY_AFTER], "20");
    assert_eq!(body["retryAfter"], 20);
}

#[tokio::test]
async fn clients_are_limited_separately() {
    let mut config = Config::default();
    config.sliding_window.max_requests = 1;
    let app = test_app(config);

    let peer = |ip: [u8; 4]| {
        let mut req = get("/api/sliding-window");
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 5000))));
        req
    };

    assert_eq!(send(&app.router, peer([10, 0, 0, 1])).await.0, StatusCode::OK);
    assert_eq!(send(&app.router, peer([10, 0, 0, 2])).await.0, StatusCode::OK);
    assert_eq!(
        send(&app.router, peer([10, 0, 0, 1])).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );

    // The header identity takes precedence over the address.
    let mut req = get_as("/api/sliding-window", "alice");
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 5000))));
    assert_eq!(send(&app.router, req).await.0, StatusCode::OK);
}

#[tokio::test]
async fn distributed_route_fails_closed_by_default() {
    let app = test_app(Config::default());

    let (status, headers, _) = send(&app.router, get_as("/api/distributed", "c")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[headers::REMAINING], "4");

    app.store.set_available(false);
    let (status, headers, body) = send(&app.router, get_as("/api/distributed", "c")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[headers::ALGORITHM], "distributed");
    assert_eq!(body["error"], "Service Unavailable");
}

#[tokio::test]
async fn distributed_route_can_fail_open() {
    let mut config = Config::default();
    config.distributed.on_store_failure = FailureMode::Open;
    let app = test_app(config);
    app.store.set_available(false);

    for _ in 0..10 {
        let (status, headers, _) = send(&app.router, get_as("/api/distributed", "c")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[headers::DEGRADED], "store-unavailable");
    }
}

#[tokio::test]
async fn every_algorithm_has_a_route() {
    let app = test_app(Config::default());

    for algorithm in Algorithm::ALL {
        let uri = format!("/api/{algorithm}");
        let (status, headers, _) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(headers[headers::ALGORITHM], algorithm.as_str());
    }
}

async fn explode() -> &'static str {
    panic!("handler exploded")
}

#[tokio::test]
async fn panics_become_a_generic_500() {
    let app = with_boundary(Router::new().route("/explode", axum::routing::get(explode)));

    let (status, _, body) = send(&app, get("/explode")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Internal server error");
}

#[tokio::test]
async fn malformed_score_update_is_a_400() {
    let app = test_app(Config::default());

    for body in [r#"{"score": "nine"}"#, "not json", "{}"] {
        let update = Request::builder()
            .method("POST")
            .uri("/events/EVENT%2300")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let (status, _, reply) = send(&app.router, update).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(reply["success"], false, "{body}");
        assert!(reply["message"].is_string(), "{body}");
    }
    assert_eq!(app.state.events.snapshot("EVENT#00").unwrap().updated_at, 0);
}

#[tokio::test]
async fn idle_eviction_covers_the_shared_store() {
    let mut config = Config::default();
    config.distributed.window_ms = 1;
    let store = Arc::new(MemoryStore::new());
    let limiters = Limiters::with_store(&config, store.clone()).unwrap();

    for client in ["a", "b", "c"] {
        assert!(limiters.distributed.check(client).await.is_continue());
    }
    assert_eq!(store.keys(), 3);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(limiters.evict_idle(Duration::from_secs(600)), 3);
    assert_eq!(store.keys(), 0);
}

#[tokio::test]
async fn unreachable_store_at_startup_is_not_fatal() {
    let mut config = Config::default();
    // Nothing listens on port 1
    config.distributed.redis_url = Some("redis://127.0.0.1:1/".to_string());
    let limiters = Limiters::from_config(&config).unwrap();
    let app = router(AppState::from_config(&config), &limiters);

    let (status, _, _) = send(&app, get_as("/api/distributed", "c")).await;
    if cfg!(feature = "redis") {
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    } else {
        // Without the redis feature the url is ignored in favour of the memory store
        assert_eq!(status, StatusCode::OK);
    }
}
