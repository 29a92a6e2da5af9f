use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::error;

use crate::api::AppState;
use crate::control::RejectReason;
use crate::error::Error;
use crate::metrics::{EndpointLabels, HttpLabels, ReasonLabels};
use crate::ratelimit;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id carried in extensions and echoed in the response header.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl Default for RequestId {
    fn default() -> Self {
        RequestId("req_unknown".to_string())
    }
}

pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let mut id = String::with_capacity(4 + 16);
    id.push_str("req_");
    for byte in bytes {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

pub fn request_id_of(request: &Request) -> RequestId {
    request
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_default()
}

/// Extract or mint the request id, stash it in extensions, echo it on the
/// response.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Request counters, latency histogram and the in-flight gauge.
pub async fn track_metrics(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let endpoint = request.uri().path().to_string();
    let started = Instant::now();

    state.metrics.http_active_requests.inc();
    let response = next.run(request).await;
    state.metrics.http_active_requests.dec();

    let labels = HttpLabels {
        method,
        endpoint,
        status: response.status().as_u16().to_string(),
    };
    state.metrics.http_requests.get_or_create(&labels).inc();
    state
        .metrics
        .http_request_duration
        .get_or_create(&labels)
        .observe(started.elapsed().as_secs_f64());

    response
}

/// A panicking handler becomes a 500 with the request id instead of a torn
/// connection.
pub async fn recover_panics(request: Request, next: Next) -> Response {
    let id = request_id_of(&request);

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(request_id = id.0, "handler panicked: {message}");
            Error::Internal("internal server error".to_string()).into_response_with_id(&id.0)
        }
    }
}

/// Bound every handler by the configured deadline; expiry yields a 503
/// with the timeout taxonomy.
pub async fn handler_timeout(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let id = request_id_of(&request);
    let endpoint = request.uri().path().to_string();
    let deadline = state.config.handler_timeout();

    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            state
                .metrics
                .timeouts
                .get_or_create(&EndpointLabels { endpoint })
                .inc();
            Error::Unavailable("request exceeded the handler deadline".to_string())
                .into_response_with_id(&id.0)
        }
    }
}

/// Admission for the mail route: active ban check, per-IP and global
/// connection caps, token-bucket throttling, then the HTTP rate limit.
/// The connection slot is held until the response is written.
pub async fn admission(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let id = request_id_of(&request);
    let ip = ratelimit::client_ip(request.headers(), peer);

    let guard = match state.control.try_acquire(ip) {
        Ok(guard) => guard,
        Err(reason) => return reject(&state, reason, &id.0),
    };
    state.metrics.connections_accepted.inc();
    sync_gauges(&state);

    if let Err(reason) = state.control.allow(ip) {
        drop(guard);
        sync_gauges(&state);
        return reject(&state, reason, &id.0);
    }

    if !state.limiter.allow(ip) {
        drop(guard);
        sync_gauges(&state);
        state
            .metrics
            .connections_rejected
            .get_or_create(&ReasonLabels {
                reason: "http_rate".to_string(),
            })
            .inc();
        return Error::RateLimit("request rate limit exceeded".to_string())
            .into_response_with_id(&id.0);
    }

    let response = next.run(request).await;
    drop(guard);
    sync_gauges(&state);
    response
}

fn reject(state: &AppState, reason: RejectReason, request_id: &str) -> Response {
    state
        .metrics
        .connections_rejected
        .get_or_create(&ReasonLabels {
            reason: reason.as_str().to_string(),
        })
        .inc();
    sync_gauges(state);

    let error = match reason {
        RejectReason::Banned => {
            Error::Forbidden("temporarily banned after repeated violations".to_string())
        }
        RejectReason::MaxTotal | RejectReason::MaxPerIp => {
            Error::RateLimit(format!("connection limit reached ({})", reason.as_str()))
        }
        RejectReason::GlobalThrottle | RejectReason::PerIpThrottle => {
            Error::RateLimit(format!("throttled ({})", reason.as_str()))
        }
    };
    error.into_response_with_id(request_id)
}

fn sync_gauges(state: &AppState) {
    let stats = state.control.stats();
    state
        .metrics
        .active_connections
        .set(stats.active_connections as i64);
    state.metrics.banned_ips.set(stats.banned_ips as i64);
}
