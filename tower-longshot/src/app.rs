use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use longshot_limit::Admission;
use longshot_limit::Algorithm;
use longshot_limit::Distributed;
use longshot_limit::FixedWindow;
use longshot_limit::MemoryStore;
use longshot_limit::SharedStore;
use longshot_limit::SlidingWindow;
use longshot_limit::TokenBucket;
use longshot_poll::Coordinator;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::Config;
use crate::config::non_zero;
use crate::error::ApiError;
use crate::error::ConfigError;
use crate::layer::RateLimitLayer;
use crate::longpoll;
use crate::longpoll::LongPollMetrics;

/// Shared state behind the long-poll routes.
#[derive(Clone, Debug)]
pub struct AppState {
    pub events: Coordinator<i64>,
    pub poll_timeout: Duration,
    pub(crate) metrics: LongPollMetrics,
}

impl AppState {
    pub fn new(events: Coordinator<i64>, poll_timeout: Duration) -> Self {
        Self {
            events,
            poll_timeout,
            metrics: LongPollMetrics::new(),
        }
    }

    /// A coordinator seeded with the configured events.
    pub fn from_config(config: &Config) -> Self {
        let events = Coordinator::new();
        for id in config.long_poll.event_ids() {
            events.insert(id, config.long_poll.initial_score);
        }
        Self::new(events, config.long_poll.timeout())
    }
}

/// One limiter per `/api/{algorithm}` route.
#[derive(Clone, Debug)]
pub struct Limiters {
    pub token_bucket: Arc<TokenBucket>,
    pub fixed_window: Arc<FixedWindow>,
    pub sliding_window: Arc<SlidingWindow>,
    pub distributed: Arc<Distributed<Arc<dyn SharedStore>>>,
}

impl Limiters {
    /// Build the local limiters from `config` and the distributed one on top of `store`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero capacity.
    pub fn with_store(
        config: &Config,
        store: Arc<dyn SharedStore>,
    ) -> Result<Self, ConfigError> {
        let tb = &config.token_bucket;
        let dist = &config.distributed;
        Ok(Self {
            token_bucket: Arc::new(TokenBucket::new(
                non_zero(tb.capacity, "token_bucket.capacity")?,
                non_zero(tb.refill, "token_bucket.refill")?,
                Duration::from_millis(tb.interval_ms),
            )),
            fixed_window: Arc::new(FixedWindow::new(
                non_zero(config.fixed_window.max_requests, "fixed_window.max_requests")?,
                config.fixed_window.window(),
            )),
            sliding_window: Arc::new(SlidingWindow::new(
                non_zero(config.sliding_window.max_requests, "sliding_window.max_requests")?,
                config.sliding_window.window(),
            )),
            distributed: Arc::new(
                Distributed::new(
                    store,
                    non_zero(dist.max_requests, "distributed.max_requests")?,
                    dist.window(),
                )
                .with_failure_policy(dist.on_store_failure.into())
                .with_prefix(dist.key_prefix.clone()),
            ),
        })
    }

    /// Build every limiter, backed by Redis if the `redis` feature is enabled and a url is
    /// configured. The Redis connection is made on first use, so an unreachable server is
    /// handled by `distributed.on_store_failure` rather than failing here.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero capacity or a malformed Redis url.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::with_store(config, open_store(config)?)
    }

    pub fn get(&self, algorithm: Algorithm) -> Arc<dyn Admission> {
        match algorithm {
            Algorithm::TokenBucket => self.token_bucket.clone(),
            Algorithm::FixedWindow => self.fixed_window.clone(),
            Algorithm::SlidingWindow => self.sliding_window.clone(),
            Algorithm::Distributed => self.distributed.clone(),
        }
    }

    /// Drop state for clients idle at least `idle`, and shared store logs that have left
    /// their window. Returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.token_bucket.evict_idle(idle)
            + self.fixed_window.evict_idle(idle)
            + self.sliding_window.evict_idle(idle)
            + self.distributed.evict_expired()
    }
}

#[cfg(feature = "redis")]
fn open_store(config: &Config) -> Result<Arc<dyn SharedStore>, ConfigError> {
    match &config.distributed.redis_url {
        Some(url) => {
            let store = longshot_limit::RedisStore::open(url)
                .map_err(|e| ConfigError::Invalid(format!("distributed.redis_url: {e}")))?;
            tracing::info!(%url, "distributed limiter backed by redis");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
fn open_store(config: &Config) -> Result<Arc<dyn SharedStore>, ConfigError> {
    if config.distributed.redis_url.is_some() {
        tracing::warn!("redis_url is set but the redis feature is disabled, using memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}

/// The full HTTP surface: long polling plus one rate limited route per algorithm.
///
/// A panic in any route is answered with a generic `500`.
pub fn router(state: AppState, limiters: &Limiters) -> Router {
    let mut app = Router::new()
        .route("/status", get(longpoll::status))
        .route("/events", get(longpoll::list_events))
        .route("/events/{id}", post(longpoll::update_event))
        .with_state(state);

    for algorithm in Algorithm::ALL {
        let handler = get(move || async move {
            Json(json!({
                "success": true,
                "message": "Request allowed",
                "algorithm": algorithm.as_str(),
            }))
        })
        .layer(RateLimitLayer::new(limiters.get(algorithm)));
        app = app.route(&format!("/api/{algorithm}"), handler);
    }

    with_boundary(app)
}

pub(crate) fn with_boundary(app: Router) -> Router {
    app.layer(CatchPanicLayer::custom(panic_response))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    };
    ApiError::Internal(detail).into_response()
}
