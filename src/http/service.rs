//! Routes and handlers for the HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, instrument};

use crate::ratelimit::{Decision, RateLimiter, RateLimiterBackend};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The active rate limiter
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Create handler state around a rate limiter.
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self { rate_limiter }
    }
}

/// Build the router serving the protected resource, metrics and health check.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/resource", get(protected_resource))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

/// Derive the rate limiting key for a request.
///
/// Tries the first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer
/// address of the connection.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
            .filter(|v| !v.is_empty())
    };

    header_value("x-forwarded-for")
        .or_else(|| header_value("x-real-ip"))
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// GET /api/resource
#[instrument(skip_all, fields(client = tracing::field::Empty))]
async fn protected_resource(State(state): State<AppState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer);
    tracing::Span::current().record("client", key.as_str());

    let decision = state.rate_limiter.allow(&key);

    let mut response = if decision.allowed {
        (
            StatusCode::OK,
            Json(json!({
                "message": "request successful",
                "ip": key,
            })),
        )
            .into_response()
    } else {
        debug!(reset_at = %decision.reset_at, "Rejecting rate limited request");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "reset": decision.reset_at.timestamp(),
            })),
        )
            .into_response();
        let retry_after = whole_seconds(decision.retry_after(state.rate_limiter.now()));
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        response
    };

    add_rate_limit_headers(response.headers_mut(), &decision);
    response
}

/// GET /metrics
async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let limiter = &state.rate_limiter;
    let stats = limiter.stats();

    Json(json!({
        "total_keys": stats.total_keys,
        "total_requests": stats.total_requests,
        "algorithm": limiter.algorithm(),
        "limit": limiter.limit(),
        "window": limiter.window().as_secs(),
        "store_ttl": limiter.store_ttl().as_secs(),
    }))
}

/// GET /health
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp()),
    );
}

/// Round up so clients never retry early.
fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::ratelimit::{Algorithm, ManualClock};
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_router(limit: u64) -> Router {
        test_router_with_clock(limit, Arc::new(ManualClock::default()))
    }

    fn test_router_with_clock(limit: u64, clock: Arc<ManualClock>) -> Router {
        let settings = RateLimitingConfig {
            algorithm: Algorithm::Fixed,
            requests_limit: limit,
            window_secs: 60,
            store_ttl_secs: 600,
            persist_pruned_on_deny: false,
        };
        let limiter = RateLimiter::new(&settings, clock);
        build_router(AppState::new(Arc::new(limiter)))
    }

    fn resource_request(ip: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri("/api/resource")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_client_key_precedence() {
        let peer: SocketAddr = "192.0.2.7:5555".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some(peer)), "192.0.2.7");
        assert_eq!(client_key(&headers, None), "unknown");

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_key(&headers, Some(peer)), "10.0.0.2");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.9 , 10.0.0.1"),
        );
        assert_eq!(client_key(&headers, Some(peer)), "203.0.113.9");
    }

    #[tokio::test]
    async fn test_allowed_request_sets_headers() {
        let app = test_router(2);

        let response = app.oneshot(resource_request("203.0.113.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1");
        assert!(response.headers().contains_key("x-ratelimit-reset"));

        let body = body_json(response).await;
        assert_eq!(body["message"], "request successful");
        assert_eq!(body["ip"], "203.0.113.1");
    }

    #[tokio::test]
    async fn test_denied_request_returns_429() {
        let app = test_router(1);

        let first = app
            .clone()
            .oneshot(resource_request("203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let denied = app.oneshot(resource_request("203.0.113.1")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");
        assert!(denied.headers().contains_key(header::RETRY_AFTER));

        let reset_header: i64 = denied.headers()["x-ratelimit-reset"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_json(denied).await;
        assert_eq!(body["error"], "rate limit exceeded");
        assert_eq!(body["reset"], reset_header);
    }

    #[tokio::test]
    async fn test_metrics_reports_stats() {
        let app = test_router(5);
        app.clone()
            .oneshot(resource_request("203.0.113.1"))
            .await
            .unwrap();
        app.clone()
            .oneshot(resource_request("203.0.113.2"))
            .await
            .unwrap();

        let response = app
            .oneshot(HttpRequest::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["total_keys"], 2);
        assert_eq!(body["total_requests"], 2);
        assert_eq!(body["algorithm"], "fixed");
        assert_eq!(body["limit"], 5);
        assert_eq!(body["window"], 60);
        assert_eq!(body["store_ttl"], 600);
    }

    #[tokio::test]
    async fn test_retry_after_uses_limiter_clock() {
        let clock = Arc::new(ManualClock::default());
        let app = test_router_with_clock(1, clock.clone());

        let first = app
            .clone()
            .oneshot(resource_request("203.0.113.1"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        clock.advance(Duration::from_secs(45));
        let denied = app.oneshot(resource_request("203.0.113.1")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()[header::RETRY_AFTER], "15");
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_router(1);

        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }
}
