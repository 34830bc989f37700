use std::sync::Arc;

use longshot_limit::Admission;
use tower::Layer;

use crate::service::RateLimitService;

/// Applies keyed rate limiting to requests.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: Arc<dyn Admission>,
}

impl RateLimitLayer {
    /// Create a RateLimitLayer
    pub fn new(limiter: Arc<dyn Admission>) -> Self {
        RateLimitLayer { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService::new(service, Arc::clone(&self.limiter))
    }
}
