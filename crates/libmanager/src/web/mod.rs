// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! HTTP surface of the manager. `entry` composes the per-resource routers,
//! the CORS layer built from configuration, and the per-IP rate limiter,
//! then binds the server.

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use axum::{
    http::{HeaderValue, Method, StatusCode},
    middleware,
    Router,
};
use dal::Stores;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::ratelimit::{self, IpRateLimiter};

pub mod api;
pub mod manager;
pub mod runner;
pub mod task;

#[cfg(test)]
mod tests;

pub type WebError = (StatusCode, String);

#[derive(Clone)]
pub struct AppState {
    pub stores: Arc<Stores>,
}

/// Build the full application router. Split out of `entry` so tests can
/// drive it without binding a socket.
pub fn app(stores: Arc<Stores>, limiter: Arc<IpRateLimiter>) -> Router {
    let state = AppState { stores };

    Router::new()
        .merge(manager::routes())
        .merge(api::routes())
        .merge(runner::routes())
        .merge(task::routes())
        .layer(middleware::from_fn_with_state(
            limiter,
            ratelimit::rate_limit_middleware,
        ))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    let cfg = config::settings();

    let origins: AllowOrigin = if cfg.cors_allow_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            cfg.cors_allow_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    let methods: AllowMethods = if cfg.cors_allow_methods.iter().any(|m| m == "*") {
        AllowMethods::any()
    } else {
        AllowMethods::list(
            cfg.cors_allow_methods
                .iter()
                .filter_map(|m| Method::from_str(m).ok()),
        )
    };

    let headers: AllowHeaders = if cfg.cors_allow_headers.iter().any(|h| h == "*") {
        AllowHeaders::any()
    } else {
        AllowHeaders::list(
            cfg.cors_allow_headers
                .iter()
                .filter_map(|h| axum::http::header::HeaderName::from_str(h).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(cfg.cors_allow_credentials)
}

/// Bind and serve until the process is stopped.
pub async fn entry(stores: Arc<Stores>) {
    let cfg = config::settings();
    let limiter = ratelimit::ip_rate_limiter(cfg.rate_limit_per_minute);
    let router = app(stores, limiter);

    let bind_addr = format!("{}:{}", cfg.manager_host, cfg.manager_port);
    let addr = SocketAddr::from_str(&bind_addr).expect("expected bind address as host:port");

    tracing::info!(%addr, "binding manager API");
    let res = axum::Server::bind(&addr)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await;
    if let Err(e) = res {
        tracing::error!("server exited with error: {e}");
    }
}
