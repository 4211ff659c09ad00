//! Per-owner prepaid balance with an append-only transaction ledger.
//!
//! Every mutation is one SQLite transaction: lock the owner row, compute the
//! new balance, reject if a debit would go negative, then write the balance
//! and its ledger entry together. Amounts are held as integer micro-units so
//! `balance_after = balance_before + amount` holds exactly, and the schema
//! enforces it with a CHECK constraint.
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{info, warn};

use crate::{
    credentials::validate_discount,
    db::{from_micros, now_ms, to_datetime, to_micros},
    error::GatewayError,
    metrics::AppMetrics,
    owners::{lock_owner, OwnerRow},
    usage::Page,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Recharge,
    Consume,
    Refund,
    Adjust,
}

impl TxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TxKind::Recharge => "recharge",
            TxKind::Consume => "consume",
            TxKind::Refund => "refund",
            TxKind::Adjust => "adjust",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recharge" => Ok(TxKind::Recharge),
            "consume" => Ok(TxKind::Consume),
            "refund" => Ok(TxKind::Refund),
            "adjust" => Ok(TxKind::Adjust),
            other => Err(GatewayError::BadRequest(format!(
                "unknown transaction kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceTransaction {
    pub id: i64,
    pub user_id: i64,
    /// Positive credits, negative debits.
    pub amount: f64,
    pub balance_before: f64,
    pub balance_after: f64,
    pub kind: TxKind,
    pub description: String,
    pub order_no: Option<String>,
    pub api_key_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct TxRow {
    id: i64,
    user_id: i64,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    kind: String,
    description: String,
    order_no: Option<String>,
    api_key_id: Option<i64>,
    created_at: i64,
}

impl TryFrom<TxRow> for BalanceTransaction {
    type Error = GatewayError;

    fn try_from(row: TxRow) -> Result<Self, Self::Error> {
        Ok(BalanceTransaction {
            id: row.id,
            user_id: row.user_id,
            amount: from_micros(row.amount),
            balance_before: from_micros(row.balance_before),
            balance_after: from_micros(row.balance_after),
            kind: row.kind.parse()?,
            description: row.description,
            order_no: row.order_no,
            api_key_id: row.api_key_id,
            created_at: to_datetime(row.created_at),
        })
    }
}

const TX_COLUMNS: &str = "id, user_id, amount, balance_before, balance_after, kind, \
     description, order_no, api_key_id, created_at";

/// Result of a successful mutation: the post-operation balance and the ledger
/// entry that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceChange {
    pub balance: f64,
    pub transaction: BalanceTransaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceStats {
    pub balance: f64,
    pub total_recharged: f64,
    pub total_consumed: f64,
    pub discount_rate: f64,
    /// Whole percent off, e.g. 20 for a 0.8 rate.
    pub discount_percent: u32,
}

/// Outcome of replaying an owner's ledger from an empty balance.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub entries: usize,
    pub replayed_balance: f64,
    pub stored_balance: f64,
    /// Each entry's `balance_before` equals the previous entry's `balance_after`.
    pub chain_intact: bool,
    /// Every entry satisfies `balance_after = balance_before + amount`.
    pub entries_balanced: bool,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.chain_intact && self.entries_balanced && self.replayed_balance == self.stored_balance
    }
}

/// One ledger entry about to be written.
struct Entry<'a> {
    kind: TxKind,
    amount: i64,
    description: String,
    order_no: Option<&'a str>,
    api_key_id: Option<i64>,
}

#[derive(Clone)]
pub struct BalanceLedger {
    pool: SqlitePool,
    metrics: Arc<AppMetrics>,
}

impl BalanceLedger {
    pub fn new(pool: SqlitePool, metrics: Arc<AppMetrics>) -> Self {
        Self { pool, metrics }
    }

    /// Credit the owner. Fails only for a missing owner or non-positive amount.
    pub async fn recharge(
        &self,
        user_id: i64,
        amount: f64,
        order_no: Option<&str>,
        note: Option<&str>,
    ) -> Result<BalanceChange, GatewayError> {
        let result = self
            .credit(TxKind::Recharge, user_id, amount, order_no, note)
            .await;
        self.observe(TxKind::Recharge, &result);
        result
    }

    /// Credit the owner; mirrors `recharge` but is not counted as recharged.
    pub async fn refund(
        &self,
        user_id: i64,
        amount: f64,
        order_no: Option<&str>,
        note: Option<&str>,
    ) -> Result<BalanceChange, GatewayError> {
        let result = self
            .credit(TxKind::Refund, user_id, amount, order_no, note)
            .await;
        self.observe(TxKind::Refund, &result);
        result
    }

    async fn credit(
        &self,
        kind: TxKind,
        user_id: i64,
        amount: f64,
        order_no: Option<&str>,
        note: Option<&str>,
    ) -> Result<BalanceChange, GatewayError> {
        let micros = positive_micros(amount)?;
        let mut tx = self.pool.begin().await?;
        let owner = lock(&mut tx, user_id).await?;
        let change = write_entry(
            &mut tx,
            &owner,
            Entry {
                kind,
                amount: micros,
                description: note.map_or_else(
                    || format!("{} {:.6}", capitalized(kind), from_micros(micros)),
                    str::to_string,
                ),
                order_no,
                api_key_id: None,
            },
        )
        .await?;
        tx.commit().await?;
        info!(
            user_id,
            kind = %kind,
            amount = change.transaction.amount,
            balance = change.balance,
            "balance credited"
        );
        Ok(change)
    }

    /// Debit the owner. With `apply_discount` the debited amount is
    /// `amount * discount_rate`. A debit that would overdraw is rejected whole.
    pub async fn consume(
        &self,
        user_id: i64,
        amount: f64,
        api_key_id: Option<i64>,
        note: Option<&str>,
        apply_discount: bool,
    ) -> Result<BalanceChange, GatewayError> {
        let result = self
            .debit(user_id, amount, api_key_id, note, apply_discount)
            .await;
        self.observe(TxKind::Consume, &result);
        result
    }

    async fn debit(
        &self,
        user_id: i64,
        amount: f64,
        api_key_id: Option<i64>,
        note: Option<&str>,
        apply_discount: bool,
    ) -> Result<BalanceChange, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let change = consume_in(&mut tx, user_id, amount, api_key_id, note, apply_discount).await?;
        tx.commit().await?;
        info!(
            user_id,
            amount = change.transaction.amount,
            balance = change.balance,
            "balance debited"
        );
        Ok(change)
    }

    /// Administrative signed correction. Rejected if it would overdraw.
    pub async fn adjust(
        &self,
        user_id: i64,
        amount: f64,
        note: Option<&str>,
    ) -> Result<BalanceChange, GatewayError> {
        let result = self.correct(user_id, amount, note).await;
        self.observe(TxKind::Adjust, &result);
        result
    }

    async fn correct(
        &self,
        user_id: i64,
        amount: f64,
        note: Option<&str>,
    ) -> Result<BalanceChange, GatewayError> {
        if !amount.is_finite() || to_micros(amount) == 0 {
            return Err(GatewayError::InvalidAmount(format!(
                "adjustment must be a non-zero amount, got {amount}"
            )));
        }
        let micros = to_micros(amount);
        let mut tx = self.pool.begin().await?;
        let owner = lock(&mut tx, user_id).await?;
        let change = write_entry(
            &mut tx,
            &owner,
            Entry {
                kind: TxKind::Adjust,
                amount: micros,
                description: note.map_or_else(
                    || format!("Adjust {:+.2}", from_micros(micros)),
                    str::to_string,
                ),
                order_no: None,
                api_key_id: None,
            },
        )
        .await?;
        tx.commit().await?;
        info!(
            user_id,
            amount = change.transaction.amount,
            balance = change.balance,
            "balance adjusted"
        );
        Ok(change)
    }

    /// Whether a `consume` of `amount` would succeed right now, and the current
    /// balance. Applies the owner's discount the same way. Read-only.
    pub async fn check(&self, user_id: i64, amount: f64) -> Result<(bool, f64), GatewayError> {
        let (balance, rate) = sqlx::query_as::<_, (i64, f64)>(
            "SELECT token_balance, discount_rate FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(GatewayError::NotFound("user"))?;
        let required = to_micros(amount.max(0.0) * rate);
        Ok((balance >= required, from_micros(balance)))
    }

    pub async fn balance(&self, user_id: i64) -> Result<f64, GatewayError> {
        let (balance,): (i64,) = sqlx::query_as("SELECT token_balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GatewayError::NotFound("user"))?;
        Ok(from_micros(balance))
    }

    pub async fn stats(&self, user_id: i64) -> Result<BalanceStats, GatewayError> {
        let (balance, recharged, consumed, rate): (i64, i64, i64, f64) = sqlx::query_as(
            "SELECT token_balance, total_recharged, total_consumed, discount_rate
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(GatewayError::NotFound("user"))?;

        Ok(BalanceStats {
            balance: from_micros(balance),
            total_recharged: from_micros(recharged),
            total_consumed: from_micros(consumed),
            discount_rate: rate,
            discount_percent: discount_percent(rate),
        })
    }

    pub async fn set_discount(&self, user_id: i64, rate: f64) -> Result<(), GatewayError> {
        validate_discount(rate)?;
        let updated = sqlx::query("UPDATE users SET discount_rate = ?, updated_at = ? WHERE id = ?")
            .bind(rate)
            .bind(now_ms())
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(GatewayError::NotFound("user"));
        }
        info!(user_id, rate, "owner discount set");
        Ok(())
    }

    /// Newest first, optionally filtered by kind.
    pub async fn transactions(
        &self,
        user_id: i64,
        kind: Option<TxKind>,
        page: Page,
    ) -> Result<Vec<BalanceTransaction>, GatewayError> {
        let rows = sqlx::query_as::<_, TxRow>(&format!(
            "SELECT {TX_COLUMNS} FROM balance_transactions
             WHERE user_id = ? AND (? IS NULL OR kind = ?)
             ORDER BY id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(kind.map(TxKind::as_str))
        .bind(kind.map(TxKind::as_str))
        .bind(i64::from(page.limit.max(1)))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BalanceTransaction::try_from).collect()
    }

    /// Replay the owner's ledger in creation order and compare with the
    /// stored balance.
    pub async fn audit(&self, user_id: i64) -> Result<LedgerAudit, GatewayError> {
        let (stored,): (i64,) = sqlx::query_as("SELECT token_balance FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GatewayError::NotFound("user"))?;

        let chain: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT amount, balance_before, balance_after FROM balance_transactions
             WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let audit = replay(&chain, stored);
        if !audit.is_consistent() {
            warn!(user_id, ?audit, "balance ledger does not reproduce stored balance");
        }
        Ok(audit)
    }

    fn observe(&self, kind: TxKind, result: &Result<BalanceChange, GatewayError>) {
        self.metrics.balance_op(kind.as_str(), result.is_ok());
    }
}

/// Debit inside a caller-owned transaction. Settlement uses this so the usage
/// record and the debit commit together.
pub(crate) async fn consume_in(
    conn: &mut SqliteConnection,
    user_id: i64,
    amount: f64,
    api_key_id: Option<i64>,
    note: Option<&str>,
    apply_discount: bool,
) -> Result<BalanceChange, GatewayError> {
    positive_micros(amount)?;
    let owner = lock(conn, user_id).await?;
    let rate = if apply_discount { owner.discount_rate } else { 1.0 };
    let debit = to_micros(amount * rate);
    if debit <= 0 {
        return Err(GatewayError::InvalidAmount(format!(
            "discounted amount rounds to zero for {amount}"
        )));
    }

    write_entry(
        conn,
        &owner,
        Entry {
            kind: TxKind::Consume,
            amount: -debit,
            description: note.map_or_else(
                || format!("Consume {:.4}", from_micros(debit)),
                str::to_string,
            ),
            order_no: None,
            api_key_id,
        },
    )
    .await
}

async fn lock(conn: &mut SqliteConnection, user_id: i64) -> Result<OwnerRow, GatewayError> {
    lock_owner(conn, user_id)
        .await?
        .ok_or(GatewayError::NotFound("user"))
}

async fn write_entry(
    conn: &mut SqliteConnection,
    owner: &OwnerRow,
    entry: Entry<'_>,
) -> Result<BalanceChange, GatewayError> {
    let before = owner.token_balance;
    let after = before
        .checked_add(entry.amount)
        .ok_or_else(|| GatewayError::InvalidAmount("balance overflow".into()))?;
    if after < 0 {
        return Err(GatewayError::InsufficientBalance {
            balance: from_micros(before),
            required: from_micros(-entry.amount),
        });
    }

    let recharged = if entry.kind == TxKind::Recharge { entry.amount } else { 0 };
    let consumed = if entry.kind == TxKind::Consume { -entry.amount } else { 0 };
    sqlx::query(
        "UPDATE users SET token_balance = ?,
             total_recharged = total_recharged + ?,
             total_consumed  = total_consumed + ?
         WHERE id = ?",
    )
    .bind(after)
    .bind(recharged)
    .bind(consumed)
    .bind(owner.id)
    .execute(&mut *conn)
    .await?;

    let row = sqlx::query_as::<_, TxRow>(&format!(
        "INSERT INTO balance_transactions (user_id, amount, balance_before, balance_after,
             kind, description, order_no, api_key_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING {TX_COLUMNS}"
    ))
    .bind(owner.id)
    .bind(entry.amount)
    .bind(before)
    .bind(after)
    .bind(entry.kind.as_str())
    .bind(&entry.description)
    .bind(entry.order_no)
    .bind(entry.api_key_id)
    .bind(now_ms())
    .fetch_one(&mut *conn)
    .await?;

    Ok(BalanceChange {
        balance: from_micros(after),
        transaction: row.try_into()?,
    })
}

fn positive_micros(amount: f64) -> Result<i64, GatewayError> {
    let micros = if amount.is_finite() { to_micros(amount) } else { 0 };
    if micros <= 0 {
        return Err(GatewayError::InvalidAmount(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(micros)
}

fn capitalized(kind: TxKind) -> &'static str {
    match kind {
        TxKind::Recharge => "Recharge",
        TxKind::Consume => "Consume",
        TxKind::Refund => "Refund",
        TxKind::Adjust => "Adjust",
    }
}

fn discount_percent(rate: f64) -> u32 {
    if rate < 1.0 {
        ((1.0 - rate) * 100.0).round() as u32
    } else {
        0
    }
}

fn replay(chain: &[(i64, i64, i64)], stored: i64) -> LedgerAudit {
    let mut running = 0i64;
    let mut chain_intact = true;
    let mut entries_balanced = true;
    for &(amount, before, after) in chain {
        chain_intact &= before == running;
        entries_balanced &= after == before + amount;
        running += amount;
    }
    LedgerAudit {
        entries: chain.len(),
        replayed_balance: from_micros(running),
        stored_balance: from_micros(stored),
        chain_intact,
        entries_balanced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_percent_rounds_to_whole_percent() {
        assert_eq!(discount_percent(1.0), 0);
        assert_eq!(discount_percent(0.8), 20);
        assert_eq!(discount_percent(0.85), 15);
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert!(positive_micros(0.0).is_err());
        assert!(positive_micros(-1.0).is_err());
        assert!(positive_micros(f64::INFINITY).is_err());
        assert_eq!(positive_micros(2.5).unwrap(), 2_500_000);
    }

    #[test]
    fn replay_detects_a_broken_chain() {
        let good = [(10_000_000, 0, 10_000_000), (-8_000_000, 10_000_000, 2_000_000)];
        let audit = replay(&good, 2_000_000);
        assert!(audit.is_consistent());
        assert_eq!(audit.replayed_balance, 2.0);

        let gap = [(10_000_000, 0, 10_000_000), (-8_000_000, 9_000_000, 1_000_000)];
        assert!(!replay(&gap, 1_000_000).chain_intact);

        assert!(!replay(&good, 3_000_000).is_consistent());
    }

    #[test]
    fn kind_round_trips_through_its_column_text() {
        for kind in [TxKind::Recharge, TxKind::Consume, TxKind::Refund, TxKind::Adjust] {
            assert_eq!(kind.as_str().parse::<TxKind>().unwrap(), kind);
        }
        assert!("bonus".parse::<TxKind>().is_err());
    }
}
