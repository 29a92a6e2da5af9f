use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, warn};

/// Tagged error returned by every fallible component. The tag decides the
/// HTTP status and shows up verbatim in the JSON envelope, so downstream
/// consumers can match on it without parsing messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("missing or invalid bearer token")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    RateLimit(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("storage failure: {0}")]
    Storage(#[source] std::io::Error),
    #[error("upstream failure: {0}")]
    Network(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Unavailable(String),
}

impl Error {
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Auth => "AUTH_ERROR",
            Error::NotFound => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::RateLimit(_) => "RATE_LIMIT_ERROR",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Unavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Auth => StatusCode::UNAUTHORIZED,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Storage(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Network(_) => StatusCode::BAD_GATEWAY,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The payload-too-large case shares the VALIDATION_ERROR tag but needs
    /// its own status, so it is built directly as a response.
    pub fn too_large(limit: usize, request_id: &str) -> axum::response::Response {
        let body = envelope(
            "VALIDATION_ERROR",
            &format!("message exceeds maximum size of {limit} bytes"),
            None,
            request_id,
        );
        (StatusCode::PAYLOAD_TOO_LARGE, Json(body)).into_response()
    }

    pub fn into_response_with_id(self, request_id: &str) -> axum::response::Response {
        self.into_response_with(request_id, None)
    }

    pub fn into_response_with(
        self,
        request_id: &str,
        details: Option<Value>,
    ) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            error!(request_id, tag = self.tag(), "request failed: {self}");
        } else {
            warn!(request_id, tag = self.tag(), "request rejected: {self}");
        }

        let body = envelope(self.tag(), &self.to_string(), details, request_id);
        (status, Json(body)).into_response()
    }
}

fn envelope(tag: &str, message: &str, details: Option<Value>, request_id: &str) -> Value {
    let mut body = json!({
        "error": true,
        "type": tag,
        "message": message,
        "request_id": request_id,
    });
    if let Some(details) = details {
        body["details"] = details;
    }
    body
}

/// Fallback conversion for errors that escape without a request id in
/// scope. Handlers normally go through `into_response_with_id`.
impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        self.into_response_with_id("req_unknown")
    }
}
