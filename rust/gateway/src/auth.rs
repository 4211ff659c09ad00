use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use std::sync::Arc;
use tracing::debug;

use crate::{credentials::ApiKeyRecord, error::GatewayError, owners::Owner, AppState};

/// Axum extractor that resolves the presented API key to its record and
/// owner. Rejects missing, unknown, inactive, expired and exhausted keys, and
/// keys whose owner is gone or deactivated.
pub struct Caller {
    pub key: ApiKeyRecord,
    pub owner: Owner,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let result = authenticate(&parts.headers, state).await;
        if let Err(e) = &result {
            if e.is_admission_failure() {
                state.metrics.auth_failures.inc();
                state.metrics.reject(e.reason());
            }
        }
        result
    }
}

async fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<Caller, GatewayError> {
    let presented = extract_token(headers).ok_or(GatewayError::InvalidCredential)?;
    let key = state.credentials.validate(&presented).await?;

    let owner = match state.owners.get(key.user_id).await {
        Ok(owner) if owner.is_active => owner,
        Ok(_) | Err(GatewayError::NotFound(_)) => {
            debug!(key_id = key.id, user_id = key.user_id, "key owner missing or inactive");
            return Err(GatewayError::InvalidCredential);
        }
        Err(e) => return Err(e),
    };

    Ok(Caller { key, owner })
}

/// The presented key from `Authorization` (either `Bearer <key>` or the bare
/// key) or, failing that, `x-api-key`.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    let from_authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| {
            let s = s.trim();
            match s.split_once(' ') {
                Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
                None if s.eq_ignore_ascii_case("bearer") => "",
                _ => s,
            }
        })
        .filter(|s| !s.is_empty());

    from_authorization
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .map(str::to_string)
}
