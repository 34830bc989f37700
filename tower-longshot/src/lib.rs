//! # Tower Longshot
//!
//! `tower-longshot` puts the [`longshot_limit`] strategies and the [`longshot_poll`]
//! coordinator behind HTTP, using [Tower](https://github.com/tower-rs/tower) and
//! [axum](https://github.com/tokio-rs/axum).
//!
//! ## Rate Limiting
//! [`RateLimitLayer`] wraps any axum route with an [`Admission`](longshot_limit::Admission)
//! check keyed on the caller (`X-Client-Id`, else the peer IP):
//!
//! 1. **Admitted** requests reach the route and leave with `X-RateLimit-Limit`,
//!    `X-RateLimit-Remaining` and `X-RateLimit-Algorithm` headers.
//! 2. **Rejected** requests are answered with `429 Too Many Requests` and a `Retry-After`.
//! 3. **Store outages** of a distributed limiter answer `503`, or pass with an
//!    `X-RateLimit-Degraded` header when the limiter fails open.
//!
//! ## Long Polling
//! `GET /status?eventId=..&last_updated=..` is held open until the event changes or the
//! configured timeout passes (`408`).
//!
//! See [`router`] for the complete surface and [`Config`] for its settings.

mod app;
mod config;
mod error;
pub mod headers;
mod key;
mod layer;
mod longpoll;
mod service;

#[cfg(test)]
mod tests;

pub use app::AppState;
pub use app::Limiters;
pub use app::router;
pub use config::Config;
pub use config::DistributedConfig;
pub use config::FailureMode;
pub use config::LongPollConfig;
pub use config::ServerConfig;
pub use config::TokenBucketConfig;
pub use config::WindowConfig;
pub use error::ApiError;
pub use error::ConfigError;
pub use key::client_key;
pub use layer::RateLimitLayer;
pub use longpoll::Item;
pub use service::RateLimitService;
