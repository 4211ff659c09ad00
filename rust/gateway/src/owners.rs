//! Owner (user) records: quota ceiling, balance summary, and global discount.
//!
//! Registration and login live outside the gateway; this store is the narrow
//! surface the metering core needs to read policy and apply counters.
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::info;

use crate::{
    db::{from_micros, now_ms, to_datetime},
    error::GatewayError,
};

#[derive(Debug, Clone, Serialize)]
pub struct Owner {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub is_admin: bool,
    /// `None` is an unbounded (administrative) account.
    pub quota_limit: Option<f64>,
    pub quota_used: f64,
    pub quota_reset_at: Option<DateTime<Utc>>,
    pub token_balance: f64,
    pub total_recharged: f64,
    pub total_consumed: f64,
    pub discount_rate: f64,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    pub fn has_quota(&self) -> bool {
        match self.quota_limit {
            None => true,
            Some(limit) => self.quota_used < limit,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct OwnerRow {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub quota_limit: Option<f64>,
    pub quota_used: f64,
    pub quota_reset_at: Option<i64>,
    pub token_balance: i64,
    pub total_recharged: i64,
    pub total_consumed: i64,
    pub discount_rate: f64,
    pub created_at: i64,
}

impl From<OwnerRow> for Owner {
    fn from(row: OwnerRow) -> Self {
        Owner {
            id: row.id,
            username: row.username,
            is_active: row.is_active,
            is_admin: row.is_admin,
            quota_limit: row.quota_limit,
            quota_used: row.quota_used,
            quota_reset_at: row.quota_reset_at.map(to_datetime),
            token_balance: from_micros(row.token_balance),
            total_recharged: from_micros(row.total_recharged),
            total_consumed: from_micros(row.total_consumed),
            discount_rate: row.discount_rate,
            created_at: to_datetime(row.created_at),
        }
    }
}

const OWNER_COLUMNS: &str = "id, username, is_active, is_admin, quota_limit, quota_used, \
     quota_reset_at, token_balance, total_recharged, total_consumed, discount_rate, created_at";

#[derive(Debug, Clone)]
pub struct NewOwner {
    pub username: String,
    pub is_admin: bool,
    /// `None` picks the configured default; `Some(None)` is unbounded.
    pub quota_limit: Option<Option<f64>>,
}

impl NewOwner {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: false,
            quota_limit: None,
        }
    }
}

/// The mutable owner fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct OwnerUpdate {
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
    /// `Some(None)` makes the quota unbounded.
    pub quota_limit: Option<Option<f64>>,
}

impl OwnerUpdate {
    fn apply(&self, row: &mut OwnerRow) {
        if let Some(active) = self.is_active {
            row.is_active = active;
        }
        if let Some(admin) = self.is_admin {
            row.is_admin = admin;
        }
        if let Some(limit) = self.quota_limit {
            row.quota_limit = limit;
        }
    }
}

#[derive(Clone)]
pub struct OwnerStore {
    pool: SqlitePool,
    default_quota: f64,
}

impl OwnerStore {
    pub fn new(pool: SqlitePool, default_quota: f64) -> Self {
        Self {
            pool,
            default_quota,
        }
    }

    pub async fn create(&self, new: NewOwner) -> Result<Owner, GatewayError> {
        let username = new.username.trim();
        if username.is_empty() {
            return Err(GatewayError::BadRequest("username must not be empty".into()));
        }
        let quota_limit = new.quota_limit.unwrap_or(Some(self.default_quota));
        validate_quota(quota_limit)?;

        let now = now_ms();
        let row = sqlx::query_as::<_, OwnerRow>(&format!(
            "INSERT INTO users (username, is_admin, quota_limit, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {OWNER_COLUMNS}"
        ))
        .bind(username)
        .bind(new.is_admin)
        .bind(quota_limit)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                GatewayError::BadRequest(format!("username {username:?} is taken"))
            }
            _ => GatewayError::Database(e),
        })?;

        info!(user_id = row.id, "owner created");
        Ok(row.into())
    }

    pub async fn get(&self, id: i64) -> Result<Owner, GatewayError> {
        sqlx::query_as::<_, OwnerRow>(&format!("SELECT {OWNER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Owner::from)
            .ok_or(GatewayError::NotFound("user"))
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Owner, GatewayError> {
        sqlx::query_as::<_, OwnerRow>(&format!(
            "SELECT {OWNER_COLUMNS} FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .map(Owner::from)
        .ok_or(GatewayError::NotFound("user"))
    }

    pub async fn update(&self, id: i64, update: OwnerUpdate) -> Result<Owner, GatewayError> {
        if let Some(limit) = update.quota_limit {
            validate_quota(limit)?;
        }
        let mut tx = self.pool.begin().await?;
        let mut row = lock_owner(&mut tx, id)
            .await?
            .ok_or(GatewayError::NotFound("user"))?;
        update.apply(&mut row);

        sqlx::query("UPDATE users SET is_active = ?, is_admin = ?, quota_limit = ? WHERE id = ?")
            .bind(row.is_active)
            .bind(row.is_admin)
            .bind(row.quota_limit)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row.into())
    }

    pub async fn reset_quota(&self, id: i64) -> Result<Owner, GatewayError> {
        let now = now_ms();
        sqlx::query_as::<_, OwnerRow>(&format!(
            "UPDATE users SET quota_used = 0, quota_reset_at = ?, updated_at = ?
             WHERE id = ?
             RETURNING {OWNER_COLUMNS}"
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Owner::from)
        .ok_or(GatewayError::NotFound("user"))
    }

    /// Raise the owner's quota ceiling by `units`. This is what a verified
    /// payment callback invokes. Unbounded owners stay unbounded.
    pub async fn credit_quota(&self, id: i64, units: f64) -> Result<Owner, GatewayError> {
        if !(units.is_finite() && units > 0.0) {
            return Err(GatewayError::InvalidAmount(format!(
                "quota credit must be positive, got {units}"
            )));
        }
        let owner = sqlx::query_as::<_, OwnerRow>(&format!(
            "UPDATE users SET quota_limit = quota_limit + ?, updated_at = ?
             WHERE id = ?
             RETURNING {OWNER_COLUMNS}"
        ))
        .bind(units)
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Owner::from)
        .ok_or(GatewayError::NotFound("user"))?;

        info!(user_id = id, units, "owner quota credited");
        Ok(owner)
    }

    /// Delete the owner and its keys. Usage records and balance transactions
    /// are kept for audit.
    pub async fn delete(&self, id: i64) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM api_keys WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(GatewayError::NotFound("user"));
        }
        tx.commit().await?;
        info!(user_id = id, "owner deleted, history retained");
        Ok(())
    }
}

/// Take the write lock on an owner row and return its current state.
///
/// SQLite has no `SELECT ... FOR UPDATE`; touching the row first makes this
/// transaction the only writer until it commits.
pub(crate) async fn lock_owner(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<OwnerRow>, sqlx::Error> {
    sqlx::query_as::<_, OwnerRow>(&format!(
        "UPDATE users SET updated_at = ? WHERE id = ? RETURNING {OWNER_COLUMNS}"
    ))
    .bind(now_ms())
    .bind(id)
    .fetch_optional(conn)
    .await
}

/// Add billed cost to the owner's consumed quota.
pub(crate) async fn add_quota_used(
    conn: &mut SqliteConnection,
    id: i64,
    amount: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET quota_used = quota_used + ? WHERE id = ?")
        .bind(amount)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

fn validate_quota(limit: Option<f64>) -> Result<(), GatewayError> {
    match limit {
        Some(l) if !(l.is_finite() && l >= 0.0) => Err(GatewayError::InvalidAmount(format!(
            "quota limit must be non-negative, got {l}"
        ))),
        _ => Ok(()),
    }
}
