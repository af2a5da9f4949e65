//! Gateway error taxonomy and the OpenAI-compatible error envelope.
//!
//! Every failure that reaches a client is rendered as
//! `{"error":{"type","code","message","param"}}` with the HTTP status from
//! [`GatewayError::status`]. Streaming responses that have already sent
//! headers instead carry a final error frame before the `[DONE]` terminator.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;

/// Internal error kinds, mapped onto HTTP statuses and audit outcomes.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        param: Option<String>,
    },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("no agent available for model '{model}'")]
    NoAgent { model: String },

    #[error("agent failed before producing output: {0}")]
    AgentError(String),

    #[error("upstream agent timed out")]
    UpstreamTimeout,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>, param: Option<&str>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            param: param.map(str::to_owned),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoAgent { .. } | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AgentError(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind for the envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::NoAgent { .. } => "no_agent",
            Self::AgentError(_) => "agent_error",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Short code carried alongside the kind. For auth errors this is the
    /// sub-reason (`expired`, `signature_invalid`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(reason) => reason.code(),
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::NoAgent { .. } => "no_agent_available",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::AgentError(_) => "agent_error",
            other => other.kind(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let param = match self {
            Self::InvalidRequest { param, .. } => param.clone(),
            _ => None,
        };
        ErrorEnvelope {
            error: ErrorBody {
                kind: self.kind().to_owned(),
                code: self.code().to_owned(),
                message: self.to_string(),
                param,
            },
        }
    }
}

/// Wire shape of a non-streaming error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
    pub message: String,
    pub param: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(self.envelope())).into_response();
        if let Self::RateLimited { retry_after_secs } = &self {
            let secs = (*retry_after_secs).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_code_and_param() {
        let err = GatewayError::invalid("messages must not be empty", Some("messages"));
        let envelope = err.envelope();
        assert_eq!(envelope.error.kind, "invalid_request");
        assert_eq!(envelope.error.param.as_deref(), Some("messages"));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request");
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = GatewayError::RateLimited {
            retry_after_secs: 3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("3")
        );
    }

    #[test]
    fn statuses_match_kinds() {
        assert_eq!(
            GatewayError::NoAgent {
                model: "m".into()
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::AgentError("boom".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
