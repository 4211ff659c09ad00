//! Admission: every limit a call must pass before any upstream traffic.
//!
//! Checks run in a fixed order and the first failure wins. Nothing here holds
//! a database transaction; settlement after the call is a separate step.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    credentials::ApiKeyRecord,
    db::start_of_day,
    error::{Exhausted, GatewayError, RateWindow},
    owners::Owner,
    rate_limiter::SlidingWindowLimiter,
    usage::UsageLedger,
};

const MINUTE: Duration = Duration::from_secs(60);

/// An admitted call's remaining per-minute allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub remaining: u32,
    pub reset_in_secs: u64,
}

#[derive(Clone)]
pub struct LimitEvaluator {
    limiter: Arc<SlidingWindowLimiter>,
    usage: UsageLedger,
    balance_billing: bool,
}

impl LimitEvaluator {
    pub fn new(limiter: Arc<SlidingWindowLimiter>, usage: UsageLedger, balance_billing: bool) -> Self {
        Self {
            limiter,
            usage,
            balance_billing,
        }
    }

    /// Run the admission checks for one call:
    ///
    /// 1. per-minute rate (sliding window on `api_key:<id>`)
    /// 2. per-day request count, when the key has one
    /// 3. key quota
    /// 4. owner quota
    /// 5. key token budget
    /// 6. model allow-list, when the request names a model
    /// 7. positive balance, when balance billing is on
    ///
    /// The rate slot taken in step 1 stays taken even if a later step rejects.
    pub async fn admit(
        &self,
        key: &ApiKeyRecord,
        owner: &Owner,
        model: Option<&str>,
    ) -> Result<Admission, GatewayError> {
        let decision = self
            .limiter
            .allow(&format!("api_key:{}", key.id), key.rate_limit, MINUTE);
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                window: RateWindow::Minute,
                retry_after_secs: decision.reset_in_secs.max(1),
            });
        }

        if let Some(per_day) = key.rate_limit_day {
            let now = Utc::now();
            let today = self.usage.count_requests_since(key.id, start_of_day(now)).await?;
            if today >= i64::from(per_day) {
                debug!(key_id = key.id, today, per_day, "daily limit reached");
                return Err(GatewayError::RateLimited {
                    window: RateWindow::Day,
                    retry_after_secs: secs_until_next_day(now),
                });
            }
        }

        check_policy(key, owner, model, self.balance_billing)?;

        Ok(Admission {
            remaining: decision.remaining,
            reset_in_secs: decision.reset_in_secs,
        })
    }
}

/// The stateless checks (3 to 7 above).
pub fn check_policy(
    key: &ApiKeyRecord,
    owner: &Owner,
    model: Option<&str>,
    balance_billing: bool,
) -> Result<(), GatewayError> {
    if key.quota_exhausted() {
        return Err(GatewayError::CredentialExhausted(Exhausted::KeyQuota));
    }
    if !owner.has_quota() {
        return Err(GatewayError::CredentialExhausted(Exhausted::OwnerQuota));
    }
    if key.tokens_exhausted() {
        return Err(GatewayError::CredentialExhausted(Exhausted::TokenBudget));
    }
    if let Some(model) = model {
        if !key.check_model_access(model) {
            return Err(GatewayError::ModelNotAllowed(model.to_string()));
        }
    }
    if balance_billing && owner.token_balance <= 0.0 {
        return Err(GatewayError::InsufficientBalance {
            balance: owner.token_balance,
            required: 0.0,
        });
    }
    Ok(())
}

fn secs_until_next_day(now: DateTime<Utc>) -> u64 {
    let next = start_of_day(now) + ChronoDuration::days(1);
    u64::try_from((next - now).num_seconds()).unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> ApiKeyRecord {
        ApiKeyRecord {
            id: 1,
            user_id: 1,
            name: "k".into(),
            description: None,
            masked_key: "gw_...".into(),
            is_active: true,
            rate_limit: 60,
            rate_limit_day: None,
            quota_limit: None,
            quota_used: 0.0,
            token_limit: None,
            token_used: 0,
            discount_rate: 1.0,
            allowed_models: Vec::new(),
            expires_at: None,
            batch_id: None,
            total_requests: 0,
            total_tokens: 0,
            total_cost: 0.0,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    fn owner() -> Owner {
        Owner {
            id: 1,
            username: "alice".into(),
            is_active: true,
            is_admin: false,
            quota_limit: Some(100.0),
            quota_used: 0.0,
            quota_reset_at: None,
            token_balance: 0.0,
            total_recharged: 0.0,
            total_consumed: 0.0,
            discount_rate: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn key_quota_is_checked_before_owner_quota() {
        let mut k = key();
        k.quota_limit = Some(1.0);
        k.quota_used = 1.0;
        let mut o = owner();
        o.quota_used = 100.0;
        assert!(matches!(
            check_policy(&k, &o, None, false),
            Err(GatewayError::CredentialExhausted(Exhausted::KeyQuota))
        ));
    }

    #[test]
    fn unbounded_owner_never_runs_out() {
        let mut o = owner();
        o.quota_limit = None;
        o.quota_used = 1e9;
        assert!(check_policy(&key(), &o, None, false).is_ok());
    }

    #[test]
    fn model_check_applies_only_when_a_model_is_named() {
        let mut k = key();
        k.allowed_models = vec!["llama-7b".into()];
        assert!(check_policy(&k, &owner(), None, false).is_ok());
        assert!(check_policy(&k, &owner(), Some("llama-7b"), false).is_ok());
        assert!(matches!(
            check_policy(&k, &owner(), Some("gpt-4"), false),
            Err(GatewayError::ModelNotAllowed(m)) if m == "gpt-4"
        ));
    }

    #[test]
    fn balance_billing_rejects_an_empty_balance() {
        assert!(check_policy(&key(), &owner(), None, false).is_ok());
        assert!(matches!(
            check_policy(&key(), &owner(), None, true),
            Err(GatewayError::InsufficientBalance { .. })
        ));
        let mut o = owner();
        o.token_balance = 0.5;
        assert!(check_policy(&key(), &o, None, true).is_ok());
    }

    #[test]
    fn daily_retry_points_at_next_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap();
        assert_eq!(secs_until_next_day(now), 60);
    }
}
