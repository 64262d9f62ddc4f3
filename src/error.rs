use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("access denied for model {model}: {reason}")]
    AccessDenied { model: String, reason: String },

    #[error("wallet verification failed: {0}")]
    Verification(String),

    #[error("maximum response segments reached ({max})")]
    SegmentLimitExceeded { max: u32 },

    #[error("provider not found: {provider}")]
    ProviderNotFound { provider: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled by client")]
    Cancelled,

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Extract provider name from structured error variants.
    /// Returns None for variants that don't carry provider context.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProviderNotFound { provider } => Some(provider),
            Self::RateLimited { provider } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            Self::AuthFailed { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Missing or rejected provider credentials. These map to 401 when
    /// detected before the stream opens.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }

    /// Produce a sanitized error message safe for returning to clients.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::AccessDenied { reason, .. } => reason.clone(),
            Self::Verification(_) => "failed to verify wallet".to_string(),
            Self::SegmentLimitExceeded { .. } => {
                "Cannot continue message: Maximum segments reached".to_string()
            }
            Self::ProviderNotFound { provider } => format!("provider not found: {provider}"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled => "request cancelled".to_string(),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream { provider, .. } => format!("upstream error from {provider}"),
            Self::AuthFailed { .. } => "Invalid or missing API key".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Config(_) => "gateway misconfigured".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}

/// Status mapping for failures that happen before any stream bytes are sent.
/// Once the event stream is open, errors never become HTTP statuses.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            Self::AccessDenied { .. } => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "error": self.user_message() })),
            )
                .into_response(),
            Self::AuthFailed { .. } => {
                (StatusCode::UNAUTHORIZED, self.user_message()).into_response()
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}
