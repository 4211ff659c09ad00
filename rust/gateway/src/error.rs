use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Which per-key policy ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    KeyQuota,
    OwnerQuota,
    TokenBudget,
}

impl Exhausted {
    pub fn as_str(self) -> &'static str {
        match self {
            Exhausted::KeyQuota => "key_quota_exceeded",
            Exhausted::OwnerQuota => "owner_quota_exceeded",
            Exhausted::TokenBudget => "token_budget_exhausted",
        }
    }
}

/// Which rate window rejected the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Minute,
    Day,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid or missing API key")]
    InvalidCredential,

    #[error("API key has expired")]
    CredentialExpired,

    #[error("{}", exhausted_message(.0))]
    CredentialExhausted(Exhausted),

    #[error("{}", rate_limited_message(.window, .retry_after_secs))]
    RateLimited {
        window: RateWindow,
        retry_after_secs: u64,
    },

    #[error("API key does not have access to model: {0}")]
    ModelNotAllowed(String),

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Cannot reach upstream: {0}")]
    UpstreamUnavailable(String),

    #[error("Insufficient balance: {balance:.6} available, {required:.6} required")]
    InsufficientBalance { balance: f64, required: f64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Internal server error")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

fn exhausted_message(kind: &Exhausted) -> &'static str {
    match kind {
        Exhausted::KeyQuota => "API key quota exceeded",
        Exhausted::OwnerQuota => "User quota exceeded",
        Exhausted::TokenBudget => "API key token budget exhausted",
    }
}

fn rate_limited_message(window: &RateWindow, retry_after_secs: &u64) -> String {
    match window {
        RateWindow::Minute => {
            format!("Rate limit exceeded. Try again in {retry_after_secs} seconds.")
        }
        RateWindow::Day => {
            format!("Daily rate limit exceeded. Try again in {retry_after_secs} seconds.")
        }
    }
}

impl GatewayError {
    /// Machine-readable rejection reason, stable across message wording changes.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::InvalidCredential => "invalid_credential",
            GatewayError::CredentialExpired => "credential_expired",
            GatewayError::CredentialExhausted(kind) => kind.as_str(),
            GatewayError::RateLimited {
                window: RateWindow::Minute,
                ..
            } => "rate_limited",
            GatewayError::RateLimited {
                window: RateWindow::Day,
                ..
            } => "daily_rate_limited",
            GatewayError::ModelNotAllowed(_) => "model_not_allowed",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::InsufficientBalance { .. } => "insufficient_balance",
            GatewayError::InvalidAmount(_) => "invalid_amount",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::ShuttingDown => "shutting_down",
            GatewayError::Database(_) | GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidCredential | GatewayError::CredentialExpired => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::CredentialExhausted(_) | GatewayError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            GatewayError::InvalidAmount(_) | GatewayError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Database(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Rejections decided before any upstream traffic.
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidCredential
                | GatewayError::CredentialExpired
                | GatewayError::CredentialExhausted(_)
                | GatewayError::RateLimited { .. }
                | GatewayError::ModelNotAllowed(_)
                | GatewayError::InsufficientBalance { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            GatewayError::Database(e) => error!(error = %e, "database error"),
            GatewayError::Internal(e) => error!(error = ?e, "internal error"),
            _ => {}
        }

        let mut headers = HeaderMap::new();
        match &self {
            GatewayError::InvalidCredential | GatewayError::CredentialExpired => {
                headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => {
                let value = HeaderValue::from(*retry_after_secs);
                headers.insert(header::RETRY_AFTER, value.clone());
                headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
                headers.insert(
                    HeaderName::from_static("x-ratelimit-remaining"),
                    HeaderValue::from_static("0"),
                );
            }
            _ => {}
        }

        let body = json!({
            "detail": self.to_string(),
            "reason": self.reason(),
        });

        (status, headers, Json(body)).into_response()
    }
}
