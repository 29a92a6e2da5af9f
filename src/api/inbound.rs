//! The ingestion pipeline behind `POST /mail/inbound`: bearer auth, size
//! check, transport extraction, authentication, policy, persistence,
//! notification.

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::api::AppState;
use crate::api::middleware::request_id_of;
use crate::auth::PolicyAction;
use crate::error::Error;
use crate::message::{InboundMessage, Transport, normalize_address};
use crate::metrics::{ReasonLabels, StatusLabels};
use crate::parser;

pub const HEADER_SENDER: &str = "x-original-sender";
pub const HEADER_RECIPIENT: &str = "x-original-recipient";
pub const HEADER_CLIENT_ADDRESS: &str = "x-original-client-address";
pub const HEADER_CLIENT_HOSTNAME: &str = "x-original-client-hostname";
pub const HEADER_HELO: &str = "x-original-helo";
pub const HEADER_MAIL_FROM: &str = "x-original-mail-from";

#[derive(Debug, Serialize)]
struct InboundResponse {
    id: String,
    action: PolicyAction,
}

pub async fn inbound(State(state): State<AppState>, request: Request) -> Response {
    let request_id = request_id_of(&request);
    match pipeline(&state, request, &request_id.0).await {
        Ok(response) => response,
        Err(error) => error.into_response_with_id(&request_id.0),
    }
}

async fn pipeline(
    state: &AppState,
    request: Request,
    request_id: &str,
) -> Result<Response, Error> {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    check_bearer(&parts.headers, &state.config.bearer_token)?;

    let max = state.config.max_message_size;
    if let Some(length) = content_length(&parts.headers)
        && length > max
    {
        return Ok(Error::too_large(max, request_id));
    }
    let raw = match read_body(body, max).await {
        Ok(raw) => raw,
        Err(_) => return Ok(Error::too_large(max, request_id)),
    };
    if raw.is_empty() {
        return Err(Error::Validation("empty message body".to_string()));
    }

    let transport = extract_transport(&parts.headers);
    let sender = header_value(&parts.headers, HEADER_SENDER)
        .map(|s| normalize_address(&s))
        .unwrap_or_else(|| transport.mail_from.clone());
    let recipient = header_value(&parts.headers, HEADER_RECIPIENT)
        .map(|s| normalize_address(&s))
        .unwrap_or_default();

    // a missing or unparseable From falls out as an empty domain and DMARC
    // evaluates to none
    let from_domain = parser::from_domain(&raw);

    let auth = state.engine.verify(&transport, &from_domain, &raw).await;
    state.metrics.record_auth(&auth);

    if auth.action == PolicyAction::Reject {
        state
            .metrics
            .emails_rejected
            .get_or_create(&ReasonLabels {
                reason: "dmarc".to_string(),
            })
            .inc();
        processed(state, "rejected");
        info!(
            request_id,
            from_domain,
            client_ip = ?transport.client_ip,
            "message rejected by DMARC policy"
        );
        return Ok(
            Error::Forbidden("message rejected by DMARC policy".to_string())
                .into_response_with(request_id, Some(json!({ "action": "reject" }))),
        );
    }

    if auth.action == PolicyAction::Quarantine {
        state
            .metrics
            .emails_quarantined
            .get_or_create(&ReasonLabels {
                reason: "dmarc".to_string(),
            })
            .inc();
    }

    let now = Utc::now();
    let message = InboundMessage {
        id: InboundMessage::generate_id(now),
        received_at: now,
        size_bytes: raw.len(),
        raw,
        sender,
        recipient,
        transport,
        auth,
    };

    if let Err(e) = state.store.store(&message).await {
        processed(state, "error");
        return Err(Error::Storage(e));
    }

    state.webhook.notify(&message);

    processed(state, "success");
    state.metrics.email_size_bytes.observe(message.size_bytes as f64);
    state
        .metrics
        .email_processing_duration
        .observe(started.elapsed().as_secs_f64());
    info!(
        request_id,
        id = %message.id,
        action = message.auth.action.as_str(),
        size = message.size_bytes,
        client_ip = ?message.transport.client_ip,
        "message accepted"
    );

    Ok((
        StatusCode::OK,
        Json(InboundResponse {
            id: message.id.clone(),
            action: message.auth.action,
        }),
    )
        .into_response())
}

/// Bearer comparison runs in constant time over the configured token.
fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), Error> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(Error::Auth)?;

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(Error::Auth)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn read_body(body: Body, limit: usize) -> Result<Vec<u8>, axum::Error> {
    axum::body::to_bytes(body, limit).await.map(|b| b.to_vec())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn extract_transport(headers: &HeaderMap) -> Transport {
    let client_ip = header_value(headers, HEADER_CLIENT_ADDRESS).and_then(|addr| {
        addr.parse::<IpAddr>()
            .ok()
            .or_else(|| addr.parse::<SocketAddr>().ok().map(|sock| sock.ip()))
    });

    Transport {
        client_ip,
        client_hostname: header_value(headers, HEADER_CLIENT_HOSTNAME).unwrap_or_default(),
        helo: header_value(headers, HEADER_HELO).unwrap_or_default(),
        mail_from: header_value(headers, HEADER_MAIL_FROM)
            .map(|s| normalize_address(&s))
            .unwrap_or_default(),
    }
}

fn processed(state: &AppState, status: &str) {
    state
        .metrics
        .emails_processed
        .get_or_create(&StatusLabels {
            status: status.to_string(),
        })
        .inc();
}
