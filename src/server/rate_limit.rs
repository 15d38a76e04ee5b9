//! Per-IP rate limiting for the webhook route
//!
//! Keyed token-bucket limiter; misconfigured or runaway alert senders get a
//! 429 with a Retry-After hint instead of filling the signal table.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use super::{ApiError, AppState};

// Type alias for the keyed limiter to simplify signatures
pub type WebhookRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

pub fn new_limiter(requests_per_minute: u32) -> Arc<WebhookRateLimiter> {
    let quota = Quota::per_minute(
        NonZeroU32::new(requests_per_minute.max(1)).expect("max(1) is non-zero"),
    );
    Arc::new(RateLimiter::keyed(quota))
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();

    match state.limiter.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(not_until) => {
            let retry_after = not_until
                .wait_time_from(state.limiter_clock.now())
                .as_secs()
                .max(1);

            warn!(ip = %ip, retry_after_secs = retry_after, "Rate limit exceeded");

            ApiError::RateLimited {
                retry_after_secs: retry_after,
            }
            .into_response()
        }
    }
}
