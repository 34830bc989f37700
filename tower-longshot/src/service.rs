use std::convert::Infallible;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use axum::http::Request;
use axum::response::IntoResponse;
use axum::response::Response;
use longshot_limit::Admission;
use longshot_limit::Reason;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::Service;

use crate::error::ApiError;
use crate::headers;
use crate::key::client_key;

#[derive(Clone, Debug)]
struct RateLimitServiceMetrics {
    admitted: Counter<u64>,
    rejected: Counter<u64>,
    degraded: Counter<u64>,
}

impl RateLimitServiceMetrics {
    fn new() -> Self {
        let meter = global::meter("rate_limit_service");
        Self {
            admitted: meter.u64_counter("admitted").build(),
            rejected: meter.u64_counter("rejected").build(),
            degraded: meter.u64_counter("degraded").build(),
        }
    }
}

/// Checks every request against an [`Admission`] for the caller's key.
///
/// Admitted requests reach the inner service and get `X-RateLimit-*` headers on the way
/// out. Rejected ones are answered directly with `429` (or `503` when a fail-closed store
/// is down) and never reach it.
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<dyn Admission>,
    instruments: RateLimitServiceMetrics,
}

impl<S> RateLimitService<S> {
    pub fn new(inner: S, limiter: Arc<dyn Admission>) -> Self {
        Self {
            inner,
            limiter,
            instruments: RateLimitServiceMetrics::new(),
        }
    }
}

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // The ready clone is the one that must be called
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let instruments = self.instruments.clone();

        Box::pin(async move {
            let key = client_key(&req);
            let algorithm = limiter.algorithm();
            let limit = limiter.limit();
            let attrs = [KeyValue::new("algorithm", algorithm.as_str())];

            match limiter.check(&key).await {
                ControlFlow::Continue(permit) => {
                    instruments.admitted.add(1, &attrs);
                    let mut response = inner.call(req).await?;
                    let headers = response.headers_mut();
                    headers::set_limits(headers, algorithm, limit, permit.remaining);
                    if permit.degraded {
                        instruments.degraded.add(1, &attrs);
                        headers.insert(headers::DEGRADED, headers::STORE_UNAVAILABLE);
                    }
                    tracing::debug!(%key, %algorithm, remaining = permit.remaining, "admitted");
                    Ok(response)
                }
                ControlFlow::Break(Reason::Overloaded { retry_after }) => {
                    instruments.rejected.add(1, &attrs);
                    tracing::debug!(%key, %algorithm, ?retry_after, "rate limited");
                    Ok(ApiError::RateLimited {
                        algorithm,
                        limit,
                        retry_after,
                    }
                    .into_response())
                }
                ControlFlow::Break(Reason::Unavailable) => {
                    instruments.rejected.add(1, &attrs);
                    Ok(ApiError::ServiceUnavailable { algorithm, limit }.into_response())
                }
            }
        })
    }
}
