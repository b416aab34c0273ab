//! Rate limiting middleware.

use crate::config::RateLimitsConfig;
use crate::handlers::AppState;
use crate::identity::client_identity;
use crate::metrics;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use beacon_core::{RateDecision, RateQuota};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Group of routes sharing one quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    /// Event stream connections.
    Stream,
    /// Presence queries and heartbeats.
    Presence,
    /// Internal publishes.
    Publish,
}

impl RateScope {
    /// Get the scope name used in counter keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Presence => "presence",
            Self::Publish => "publish",
        }
    }

    /// Get the configured quota for this scope.
    #[must_use]
    pub fn quota(self, limits: &RateLimitsConfig) -> RateQuota {
        match self {
            Self::Stream => limits.stream,
            Self::Presence => limits.presence,
            Self::Publish => limits.publish,
        }
    }
}

/// Middleware state: the app plus the scope of the routes it guards.
#[derive(Clone)]
pub struct ScopedLimit {
    state: Arc<AppState>,
    scope: RateScope,
}

impl ScopedLimit {
    /// Create middleware state for a scope.
    #[must_use]
    pub fn new(state: &Arc<AppState>, scope: RateScope) -> Self {
        Self {
            state: Arc::clone(state),
            scope,
        }
    }
}

/// Count the request against its scope and reject it with 429 when over quota.
pub async fn rate_limit(State(limit): State<ScopedLimit>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let config = &limit.state.config.rate_limits;
    let identity = client_identity(request.headers(), peer, &config.trusted_ip_headers);

    let decision = limit
        .state
        .governor
        .check(&identity, limit.scope.as_str(), limit.scope.quota(config))
        .await;

    if !decision.allowed {
        debug!(
            client = %identity,
            scope = limit.scope.as_str(),
            retry_after = decision.retry_after_secs(),
            "Rate limited"
        );
        metrics::record_rate_limited(limit.scope.as_str());
        return rate_limited_response(&decision);
    }

    let mut response = next.run(request).await;
    set_quota_headers(response.headers_mut(), &decision);
    response
}

/// Build the 429 response for a denied request.
#[must_use]
pub fn rate_limited_response(decision: &RateDecision) -> Response {
    let retry_after = decision.retry_after_secs();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": "Too many requests",
            "retryAfter": retry_after,
        })),
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    set_quota_headers(headers, decision);
    response
}

fn set_quota_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}
