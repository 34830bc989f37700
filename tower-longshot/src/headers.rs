//! Rate limit response headers.

use axum::http::HeaderMap;
use axum::http::HeaderName;
use axum::http::HeaderValue;
use longshot_limit::Algorithm;

pub const LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const ALGORITHM: HeaderName = HeaderName::from_static("x-ratelimit-algorithm");
pub const DEGRADED: HeaderName = HeaderName::from_static("x-ratelimit-degraded");

/// Client supplied identity, preferred over the peer address.
pub const CLIENT_ID: HeaderName = HeaderName::from_static("x-client-id");

pub(crate) const STORE_UNAVAILABLE: HeaderValue = HeaderValue::from_static("store-unavailable");

pub(crate) fn set_limits(
    headers: &mut HeaderMap,
    algorithm: Algorithm,
    limit: usize,
    remaining: usize,
) {
    headers.insert(LIMIT, HeaderValue::from(limit));
    headers.insert(REMAINING, HeaderValue::from(remaining));
    headers.insert(ALGORITHM, HeaderValue::from_static(algorithm.as_str()));
}
