// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Per-IP token-bucket rate limiting for the whole HTTP surface. Requests
//! over the budget get the standard 429 answer. Connections without a peer
//! address (in-process test clients) pass through.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

pub type IpRateLimiter = DefaultKeyedRateLimiter<IpAddr>;

pub fn ip_rate_limiter(requests_per_minute: u32) -> Arc<IpRateLimiter> {
    let per_minute = NonZeroU32::new(requests_per_minute.max(1)).expect("clamped above zero");
    Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)))
}

pub async fn rate_limit_middleware<B>(
    State(limiter): State<Arc<IpRateLimiter>>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    if let Some(ip) = peer_ip {
        if limiter.check_key(&ip).is_err() {
            tracing::debug!(%ip, "rate limit exceeded");
            return (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced_per_ip() {
        let limiter = ip_rate_limiter(2);
        let a: IpAddr = "198.51.100.1".parse().unwrap();
        let b: IpAddr = "198.51.100.2".parse().unwrap();

        assert!(limiter.check_key(&a).is_ok());
        assert!(limiter.check_key(&a).is_ok());
        assert!(limiter.check_key(&a).is_err());

        // An unrelated peer still has its own budget.
        assert!(limiter.check_key(&b).is_ok());
    }
}
