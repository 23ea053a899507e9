//! Rate limiter for the MBTA v3 API.
//!
//! Anonymous callers get 20 requests/minute upstream; a registered API key
//! raises that to 1000/minute. Both tiers are read-only.

use governor::{Quota, RateLimiter as GovLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Read-side limiter sized to the caller's MBTA tier.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    read_limiter: Arc<
        GovLimiter<
            governor::state::NotKeyed,
            governor::state::InMemoryState,
            governor::clock::DefaultClock,
        >,
    >,
}

impl RateLimiter {
    /// Limits for a request carrying an API key.
    pub fn keyed() -> Self {
        Self::with_per_minute(1000)
    }

    /// Limits for anonymous requests.
    pub fn anonymous() -> Self {
        Self::with_per_minute(20)
    }

    /// Create with a custom per-minute budget.
    pub fn with_per_minute(reads_per_min: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(reads_per_min.max(1)).unwrap());
        Self {
            read_limiter: Arc::new(GovLimiter::direct(quota)),
        }
    }

    /// Wait until a read slot is available.
    pub async fn wait_read(&self) {
        self.read_limiter.until_ready().await;
    }

    /// Try to acquire a read slot without waiting. Returns true if acquired.
    pub fn try_read(&self) -> bool {
        self.read_limiter.check().is_ok()
    }
}
