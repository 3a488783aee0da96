//! Rate limiting for authentication endpoints.
//!
//! Uses a token bucket algorithm with per-IP tracking to slow down credential
//! guessing and signup spam.

use axum::{
    extract::{Request, State},
    http::HeaderName,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use std::{
    num::NonZeroU32,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::api::ApiError;
use crate::auth::extract_client_ip;

/// Per-IP rate limiter for endpoint-specific limiting.
pub type IpLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

const LOGIN_PER_SEC: NonZeroU32 = NonZeroU32::new(1).unwrap();
const LOGIN_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();
const REGISTER_PER_MIN: NonZeroU32 = NonZeroU32::new(3).unwrap();
const REFRESH_PER_SEC: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// How often idle per-IP entries are dropped.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Rate limiting configuration for authentication endpoints.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Per-IP limiter for login (strict: 5 requests, then 1 per second)
    pub login: Arc<IpLimiter>,
    /// Per-IP limiter for registration (strict: 3 requests per minute)
    pub register: Arc<IpLimiter>,
    /// Per-IP limiter for token refresh (generous: 10 requests per second)
    pub refresh: Arc<IpLimiter>,
    /// Header carrying the client IP when running behind a proxy
    pub ip_header: Option<HeaderName>,
}

impl RateLimitConfig {
    /// Create rate limiters with the default quotas.
    pub fn new(ip_header: Option<HeaderName>) -> Self {
        Self::with_quotas(
            ip_header,
            Quota::per_second(LOGIN_PER_SEC).allow_burst(LOGIN_BURST),
            Quota::per_minute(REGISTER_PER_MIN),
            Quota::per_second(REFRESH_PER_SEC),
        )
    }

    pub fn with_quotas(
        ip_header: Option<HeaderName>,
        login: Quota,
        register: Quota,
        refresh: Quota,
    ) -> Self {
        Self {
            login: Arc::new(RateLimiter::keyed(login)),
            register: Arc::new(RateLimiter::keyed(register)),
            refresh: Arc::new(RateLimiter::keyed(refresh)),
            ip_header,
        }
    }

    /// Drop per-IP state for clients whose quota has fully replenished.
    pub fn prune(&self) {
        for limiter in [&self.login, &self.register, &self.refresh] {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

/// Spawn a background task that prunes the limiters periodically.
/// The task ends once the last strong reference to the config is dropped.
pub fn spawn_pruner(config: &Arc<RateLimitConfig>, period: Duration) -> tokio::task::JoinHandle<()> {
    let config: Weak<RateLimitConfig> = Arc::downgrade(config);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;
            let Some(config) = config.upgrade() else {
                break;
            };
            config.prune();
        }
    })
}

fn check(
    limiter: &IpLimiter,
    ip_header: Option<&HeaderName>,
    request: &Request,
    message: &str,
) -> Result<(), Response> {
    let ip = extract_client_ip(request.headers(), request.extensions(), ip_header)
        .map_err(|_| ApiError::forbidden("Unable to determine client IP").into_response())?;

    limiter.check_key(&ip).map_err(|_| {
        tracing::warn!(ip = %ip, "Rate limit exceeded");
        ApiError::too_many_requests(message).into_response()
    })
}

/// Middleware for rate limiting login.
pub async fn rate_limit_login(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    match check(
        &config.login,
        config.ip_header.as_ref(),
        &request,
        "Too many login attempts. Please wait before trying again.",
    ) {
        Ok(()) => next.run(request).await,
        Err(response) => response,
    }
}

/// Middleware for rate limiting registration.
pub async fn rate_limit_register(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    match check(
        &config.register,
        config.ip_header.as_ref(),
        &request,
        "Too many signup attempts. Please wait before trying again.",
    ) {
        Ok(()) => next.run(request).await,
        Err(response) => response,
    }
}

/// Middleware for rate limiting token refresh.
pub async fn rate_limit_refresh(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Response {
    match check(
        &config.refresh,
        config.ip_header.as_ref(),
        &request,
        "Too many requests. Please try again later.",
    ) {
        Ok(()) => next.run(request).await,
        Err(response) => response,
    }
}
