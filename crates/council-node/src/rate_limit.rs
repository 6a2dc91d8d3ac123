// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! GCRA rate limiting for mutating routes.
//!
//! Reads stay unthrottled; anything that changes state shares one direct
//! (unkeyed) limiter replenishing `permit_limit` permits per window.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};

use council_config::RateLimitConfig;

use crate::error::ApiError;
use crate::routes::AppState;

pub type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn build(cfg: &RateLimitConfig) -> SharedRateLimiter {
    let permits = NonZeroU32::new(cfg.permit_limit.max(1)).expect("non-zero permit count");
    let window = Duration::from_secs(cfg.window_seconds.max(1));
    let quota = Quota::with_period(window / permits.get())
        .expect("non-zero replenish period")
        .allow_burst(permits);
    Arc::new(RateLimiter::direct(quota))
}

pub async fn limit_mutations(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let mutating = !matches!(*req.method(), Method::GET | Method::HEAD);
    if mutating && state.rate_limiter.check().is_err() {
        return ApiError::RateLimited.into_response();
    }
    next.run(req).await
}
