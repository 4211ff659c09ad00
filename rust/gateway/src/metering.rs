//! Settlement: turning a finished upstream call into ledger state.
//!
//! A call moves `Admitted -> Forwarding -> {Completed | Failed | TimedOut}`.
//! Whatever the end state, `Meter::settle` writes exactly one usage record,
//! and for calls that got a response it applies the billed cost to the key
//! and owner counters (and optionally the balance) in the same transaction.
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
    balance::{consume_in, BalanceChange},
    credentials::{apply_key_usage, ApiKeyRecord, KeyUsageDelta},
    error::GatewayError,
    metrics::{AppMetrics, OutcomeLabel},
    owners::{add_quota_used, lock_owner},
    usage::{compute_cost, insert_usage, NewUsage, TokenUsage, UsageRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Admitted,
    Forwarding,
    Completed,
    Failed,
    TimedOut,
}

impl CallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CallPhase::Admitted => "admitted",
            CallPhase::Forwarding => "forwarding",
            CallPhase::Completed => "completed",
            CallPhase::Failed => "failed",
            CallPhase::TimedOut => "timed_out",
        }
    }
}

/// How an upstream call ended.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// The upstream answered and the body was relayed in full, or the client
    /// went away first (`note` says so). Success follows the status code.
    Responded {
        status: u16,
        tokens: TokenUsage,
        note: Option<String>,
    },
    /// The upstream answered but its body broke off.
    Interrupted {
        status: u16,
        tokens: TokenUsage,
        error: String,
    },
    /// No connection, or the request failed before any response.
    Unreachable(String),
    TimedOut,
}

/// One in-flight proxied call.
#[derive(Debug, Clone)]
pub struct MeteredCall {
    pub user_id: i64,
    pub api_key_id: i64,
    pub key_discount: f64,
    pub endpoint: String,
    pub method: String,
    pub model: Option<String>,
    pub is_streaming: bool,
    started: Instant,
    phase: CallPhase,
}

impl MeteredCall {
    pub fn admitted(
        key: &ApiKeyRecord,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        model: Option<String>,
        is_streaming: bool,
    ) -> Self {
        Self {
            user_id: key.user_id,
            api_key_id: key.id,
            key_discount: key.discount_rate,
            endpoint: endpoint.into(),
            method: method.into(),
            model,
            is_streaming,
            started: Instant::now(),
            phase: CallPhase::Admitted,
        }
    }

    pub fn forwarding(&mut self) {
        self.phase = CallPhase::Forwarding;
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub phase: CallPhase,
    pub usage: UsageRecord,
    /// Cost after key and owner discounts; zero for transport failures.
    pub billed: f64,
    /// Set when balance billing debited the owner.
    pub balance: Option<BalanceChange>,
}

#[derive(Clone)]
pub struct Meter {
    pool: SqlitePool,
    metrics: Arc<AppMetrics>,
    cost_per_1k_tokens: f64,
    balance_billing: bool,
}

impl Meter {
    pub fn new(
        pool: SqlitePool,
        metrics: Arc<AppMetrics>,
        cost_per_1k_tokens: f64,
        balance_billing: bool,
    ) -> Self {
        Self {
            pool,
            metrics,
            cost_per_1k_tokens,
            balance_billing,
        }
    }

    /// Record the call and apply its consumption as one unit of work.
    pub async fn settle(
        &self,
        mut call: MeteredCall,
        outcome: CallOutcome,
    ) -> Result<Settlement, GatewayError> {
        let latency_ms = u64::try_from(call.elapsed().as_millis()).unwrap_or(u64::MAX);
        let end = End::from(outcome);
        call.phase = end.phase;

        let mut tx = self.pool.begin().await?;

        // Transport failures bill nothing, so the owner row isn't needed.
        let owner_discount = if end.responded {
            lock_owner(&mut tx, call.user_id)
                .await?
                .map_or(1.0, |owner| owner.discount_rate)
        } else {
            1.0
        };
        let keyed =
            compute_cost(end.tokens.total_tokens, self.cost_per_1k_tokens) * call.key_discount;
        let billed = if end.responded { keyed * owner_discount } else { 0.0 };

        let usage = insert_usage(
            &mut tx,
            &NewUsage {
                user_id: call.user_id,
                api_key_id: call.api_key_id,
                endpoint: call.endpoint.clone(),
                method: call.method.clone(),
                model: call.model.clone(),
                tokens: end.tokens,
                cost: billed,
                status_code: Some(end.status),
                latency_ms,
                is_streaming: call.is_streaming,
                is_success: end.is_success,
                error_message: end.error,
            },
        )
        .await?;

        let mut balance = None;
        if end.responded {
            apply_key_usage(
                &mut tx,
                call.api_key_id,
                KeyUsageDelta {
                    requests: 1,
                    tokens: end.tokens.total_tokens,
                    cost: billed,
                },
            )
            .await?;
            add_quota_used(&mut tx, call.user_id, billed).await?;

            if self.balance_billing && billed > 0.0 {
                let note = format!("Usage {}", usage.request_id);
                let debit = consume_in(
                    &mut tx,
                    call.user_id,
                    keyed,
                    Some(call.api_key_id),
                    Some(&note),
                    true,
                )
                .await;
                match debit {
                    Ok(change) => {
                        self.metrics.balance_op("consume", true);
                        balance = Some(change);
                    }
                    // Nothing was written for the debit; the usage row stands.
                    Err(GatewayError::InsufficientBalance {
                        balance: available,
                        required,
                    }) => {
                        self.metrics.balance_op("consume", false);
                        warn!(
                            user_id = call.user_id,
                            request_id = %usage.request_id,
                            available,
                            required,
                            "balance too low to bill call"
                        );
                    }
                    // Below one micro-unit after discounts.
                    Err(GatewayError::InvalidAmount(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        tx.commit().await?;

        self.metrics
            .usage_records
            .get_or_create(&OutcomeLabel {
                outcome: call.phase.as_str().to_string(),
            })
            .inc();
        info!(
            request_id = %usage.request_id,
            key_id = call.api_key_id,
            phase = call.phase.as_str(),
            status = end.status,
            total_tokens = end.tokens.total_tokens,
            billed,
            latency_ms,
            "call settled"
        );

        Ok(Settlement {
            phase: call.phase,
            usage,
            billed,
            balance,
        })
    }
}

/// The outcome flattened into the fields settlement writes.
struct End {
    phase: CallPhase,
    status: u16,
    tokens: TokenUsage,
    is_success: bool,
    error: Option<String>,
    responded: bool,
}

impl From<CallOutcome> for End {
    fn from(outcome: CallOutcome) -> Self {
        match outcome {
            CallOutcome::Responded {
                status,
                tokens,
                note,
            } => {
                let ok = status < 400;
                End {
                    phase: if ok { CallPhase::Completed } else { CallPhase::Failed },
                    status,
                    tokens,
                    is_success: ok,
                    error: note,
                    responded: true,
                }
            }
            CallOutcome::Interrupted {
                status,
                tokens,
                error,
            } => End {
                phase: CallPhase::Failed,
                status,
                tokens,
                is_success: false,
                error: Some(error),
                responded: true,
            },
            CallOutcome::Unreachable(error) => End {
                phase: CallPhase::Failed,
                status: 502,
                tokens: TokenUsage::default(),
                is_success: false,
                error: Some(error),
                responded: false,
            },
            CallOutcome::TimedOut => End {
                phase: CallPhase::TimedOut,
                status: 504,
                tokens: TokenUsage::default(),
                is_success: false,
                error: Some("Upstream timeout".to_string()),
                responded: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_carry_gateway_statuses() {
        let end = End::from(CallOutcome::TimedOut);
        assert_eq!((end.phase, end.status, end.responded), (CallPhase::TimedOut, 504, false));

        let end = End::from(CallOutcome::Unreachable("connection refused".into()));
        assert_eq!((end.phase, end.status, end.is_success), (CallPhase::Failed, 502, false));
        assert_eq!(end.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn responded_success_follows_status() {
        let end = End::from(CallOutcome::Responded {
            status: 200,
            tokens: TokenUsage::new(1, 2, None),
            note: Some("client disconnected".into()),
        });
        assert!(end.is_success);
        assert_eq!(end.phase, CallPhase::Completed);

        let end = End::from(CallOutcome::Responded {
            status: 429,
            tokens: TokenUsage::default(),
            note: None,
        });
        assert!(!end.is_success);
        assert_eq!(end.phase, CallPhase::Failed);
    }

    #[test]
    fn interrupted_bodies_are_failures_that_still_bill() {
        let end = End::from(CallOutcome::Interrupted {
            status: 200,
            tokens: TokenUsage::new(3, 4, None),
            error: "connection reset".into(),
        });
        assert!(!end.is_success);
        assert!(end.responded);
        assert_eq!(end.tokens.total_tokens, 7);
    }
}
