//! Gateway boundary errors.
//!
//! Every error kind surfaced over HTTP maps to a stable `(status, type,
//! code)` triple rendered as `{"error":{"message","type","code"}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, Clone)]
pub enum GatewayError {
    /// No `Authorization: Bearer` header.
    AuthMissing,
    /// Bearer key does not resolve to a tenant.
    AuthInvalid,
    TenantSuspended,
    /// Requested model is not in the API key's allow-list.
    ModelNotAllowed(String),
    RateLimited(String),
    ConcurrencyExceeded(String),
    InsufficientBalance,
    SpendLimitExceeded,
    /// Bad JSON, missing model, empty messages.
    InvalidRequest(String),
    /// Planner produced an empty candidate list.
    NoCandidates(String),
    /// All candidates exhausted; carries the last upstream payload.
    UpstreamFailed(String),
    /// Caller went away mid-request; never reaches the wire for streams.
    ClientCancelled,
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing => "auth_missing",
            GatewayError::AuthInvalid => "auth_invalid",
            GatewayError::TenantSuspended => "tenant_suspended",
            GatewayError::ModelNotAllowed(_) => "model_not_allowed",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::ConcurrencyExceeded(_) => "concurrency_exceeded",
            GatewayError::InsufficientBalance => "insufficient_balance",
            GatewayError::SpendLimitExceeded => "spend_limit_exceeded",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::NoCandidates(_) => "no_candidates",
            GatewayError::UpstreamFailed(_) => "upstream_failed",
            GatewayError::ClientCancelled => "client_cancelled",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn class(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => "auth_error",
            GatewayError::TenantSuspended | GatewayError::ModelNotAllowed(_) => "permission_error",
            GatewayError::RateLimited(_) | GatewayError::ConcurrencyExceeded(_) => {
                "rate_limit_error"
            }
            GatewayError::InsufficientBalance | GatewayError::SpendLimitExceeded => {
                "billing_error"
            }
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::NoCandidates(_) | GatewayError::UpstreamFailed(_) => "upstream_error",
            GatewayError::ClientCancelled => "client_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::TenantSuspended | GatewayError::ModelNotAllowed(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::RateLimited(_) | GatewayError::ConcurrencyExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::InsufficientBalance | GatewayError::SpendLimitExceeded => {
                StatusCode::PAYMENT_REQUIRED
            }
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoCandidates(_) | GatewayError::UpstreamFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            GatewayError::AuthMissing => "missing bearer token".to_string(),
            GatewayError::AuthInvalid => "invalid API key".to_string(),
            GatewayError::TenantSuspended => "tenant is suspended".to_string(),
            GatewayError::ModelNotAllowed(model) => {
                format!("model '{model}' is not allowed for this API key")
            }
            GatewayError::InsufficientBalance => "insufficient balance".to_string(),
            GatewayError::SpendLimitExceeded => "spend limit exceeded".to_string(),
            GatewayError::ClientCancelled => "client cancelled the request".to_string(),
            GatewayError::RateLimited(msg)
            | GatewayError::ConcurrencyExceeded(msg)
            | GatewayError::InvalidRequest(msg)
            | GatewayError::NoCandidates(msg)
            | GatewayError::UpstreamFailed(msg)
            | GatewayError::Internal(msg) => msg.clone(),
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.kind(), "request failed: {}", self.message());
        } else {
            tracing::debug!(code = self.kind(), "request rejected: {}", self.message());
        }
        (
            status,
            Json(serde_json::json!({
                "error": {
                    "message": self.message(),
                    "type": self.class(),
                    "code": self.kind()
                }
            })),
        )
            .into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_status_table() {
        assert_eq!(GatewayError::AuthMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::ModelNotAllowed("m".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RateLimited("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::InsufficientBalance.status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::UpstreamFailed("x".into()).kind(),
            "upstream_failed"
        );
        assert_eq!(
            GatewayError::NoCandidates("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
