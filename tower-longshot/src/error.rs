use std::time::Duration;

use axum::Json;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header::RETRY_AFTER;
use axum::response::IntoResponse;
use axum::response::Response;
use longshot_limit::Algorithm;
use longshot_limit::Reason;
use longshot_poll::PollError;
use serde_json::json;

use crate::headers;

/// Errors produced by the longshot HTTP surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The requested resource does not exist.
    ///
    /// Converts to `404 Not Found`.
    #[error("{0}")]
    NotFound(String),

    /// A query parameter or body was missing or malformed.
    ///
    /// Converts to `400 Bad Request`.
    #[error("{0}")]
    InvalidArgument(String),

    /// A long-poll wait reached its deadline with nothing new to report.
    ///
    /// Converts to `408 Request Timeout`.
    #[error("Request timed out")]
    Timeout,

    /// The request was rejected due to rate limiting.
    ///
    /// Converts to `429 Too Many Requests` with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        algorithm: Algorithm,
        limit: usize,
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// The store behind a limiter could not be reached and the limiter fails closed.
    ///
    /// Converts to `503 Service Unavailable`.
    #[error("Rate limit store is unavailable")]
    ServiceUnavailable { algorithm: Algorithm, limit: usize },

    /// An unexpected error. The detail is logged, never sent to the client.
    ///
    /// Converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PollError> for ApiError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::NotFound(_) => Self::NotFound("Event not found".to_string()),
            PollError::InvalidArgument(msg) => Self::InvalidArgument(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        match self {
            Self::RateLimited {
                algorithm,
                limit,
                retry_after,
            } => {
                let secs = Reason::Overloaded { retry_after }
                    .retry_after_secs()
                    .unwrap_or_default()
                    .max(1);
                let body = json!({
                    "error": "Too Many Requests",
                    "message": format!("Rate limit exceeded. Try again in {secs} seconds."),
                    "algorithm": algorithm.as_str(),
                    "limit": limit,
                    "retryAfter": secs,
                });
                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                headers::set_limits(headers, algorithm, limit, 0);
                headers.insert(RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            Self::ServiceUnavailable { algorithm, limit } => {
                let body = json!({
                    "error": "Service Unavailable",
                    "message": "Rate limit store is unavailable. Try again later.",
                    "algorithm": algorithm.as_str(),
                    "limit": limit,
                });
                let mut response = (status, Json(body)).into_response();
                headers::set_limits(response.headers_mut(), algorithm, limit, 0);
                response
            }
            Self::Internal(detail) => {
                tracing::error!(%detail, "internal error");
                let body = json!({ "success": false, "message": "Internal server error" });
                (status, Json(body)).into_response()
            }
            other => {
                let body = json!({ "success": false, "message": other.to_string() });
                (status, Json(body)).into_response()
            }
        }
    }
}

/// Errors raised while loading a [`Config`](crate::Config).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    async fn body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_rounds_retry_after_up() {
        let response = ApiError::RateLimited {
            algorithm: Algorithm::FixedWindow,
            limit: 6,
            retry_after: Duration::from_millis(15_800),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "16");
        assert_eq!(response.headers()[headers::LIMIT], "6");
        assert_eq!(response.headers()[headers::REMAINING], "0");
        assert_eq!(response.headers()[headers::ALGORITHM], "fixed-window");

        let body = body(response).await;
        assert_eq!(body["algorithm"], "fixed-window");
        assert_eq!(body["limit"], 6);
        assert_eq!(body["retryAfter"], 16);
    }

    #[tokio::test]
    async fn retry_after_is_at_least_one_second() {
        let response = ApiError::RateLimited {
            algorithm: Algorithm::TokenBucket,
            limit: 1,
            retry_after: Duration::ZERO,
        }
        .into_response();
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }

    #[tokio::test]
    async fn internal_errors_hide_their_detail() {
        let response = ApiError::Internal("db password rejected".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Internal server error");
    }

    #[tokio::test]
    async fn poll_errors_map_to_client_errors() {
        let not_found = ApiError::from(PollError::NotFound("EVENT#99".to_string()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(not_found.into_response()).await["message"], "Event not found");

        let invalid = ApiError::from(PollError::InvalidArgument("bad".to_string()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
