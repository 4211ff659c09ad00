//! SQLite pool setup, schema, and the shared time/money conversions.
//!
//! Timestamps are Unix milliseconds (UTC). Balances are integer micro-units so
//! ledger arithmetic is exact; the public API speaks `f64` units.
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::{path::Path, time::Duration};
use tracing::info;

pub const MICROS_PER_UNIT: i64 = 1_000_000;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        username         TEXT    NOT NULL UNIQUE,
        is_active        INTEGER NOT NULL DEFAULT 1,
        is_admin         INTEGER NOT NULL DEFAULT 0,
        quota_limit      REAL,
        quota_used       REAL    NOT NULL DEFAULT 0,
        quota_reset_at   INTEGER,
        token_balance    INTEGER NOT NULL DEFAULT 0,
        total_recharged  INTEGER NOT NULL DEFAULT 0,
        total_consumed   INTEGER NOT NULL DEFAULT 0,
        discount_rate    REAL    NOT NULL DEFAULT 1.0,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS api_keys (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        key_hash         TEXT    NOT NULL UNIQUE,
        masked_key       TEXT    NOT NULL,
        name             TEXT    NOT NULL,
        description      TEXT,
        user_id          INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        is_active        INTEGER NOT NULL DEFAULT 1,
        rate_limit       INTEGER NOT NULL,
        rate_limit_day   INTEGER,
        quota_limit      REAL,
        quota_used       REAL    NOT NULL DEFAULT 0,
        token_limit      INTEGER,
        token_used       INTEGER NOT NULL DEFAULT 0,
        discount_rate    REAL    NOT NULL DEFAULT 1.0,
        allowed_models   TEXT    NOT NULL DEFAULT '[]',
        expires_at       INTEGER,
        batch_id         TEXT,
        total_requests   INTEGER NOT NULL DEFAULT 0,
        total_tokens     INTEGER NOT NULL DEFAULT 0,
        total_cost       REAL    NOT NULL DEFAULT 0,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        last_used_at     INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_api_keys_batch ON api_keys (batch_id)",
    // No foreign keys: usage history outlives the user and key it describes.
    "CREATE TABLE IF NOT EXISTS usage_records (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id         TEXT    NOT NULL UNIQUE,
        user_id            INTEGER NOT NULL,
        api_key_id         INTEGER NOT NULL,
        endpoint           TEXT    NOT NULL,
        method             TEXT    NOT NULL,
        model              TEXT,
        prompt_tokens      INTEGER NOT NULL DEFAULT 0,
        completion_tokens  INTEGER NOT NULL DEFAULT 0,
        total_tokens       INTEGER NOT NULL DEFAULT 0,
        cost               REAL    NOT NULL DEFAULT 0,
        status_code        INTEGER,
        latency_ms         INTEGER NOT NULL DEFAULT 0,
        is_streaming       INTEGER NOT NULL DEFAULT 0,
        is_success         INTEGER NOT NULL DEFAULT 1,
        error_message      TEXT,
        created_at         INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_user_date ON usage_records (user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_usage_key_date ON usage_records (api_key_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_usage_model_date ON usage_records (model, created_at)",
    "CREATE TABLE IF NOT EXISTS balance_transactions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id          INTEGER NOT NULL,
        amount           INTEGER NOT NULL,
        balance_before   INTEGER NOT NULL,
        balance_after    INTEGER NOT NULL,
        kind             TEXT    NOT NULL,
        description      TEXT    NOT NULL,
        order_no         TEXT,
        api_key_id       INTEGER,
        created_at       INTEGER NOT NULL,
        CHECK (balance_after = balance_before + amount)
    )",
    "CREATE INDEX IF NOT EXISTS idx_balance_tx_user ON balance_transactions (user_id, id)",
];

/// Open (creating if needed) the SQLite database and apply the schema.
pub async fn connect(path: &str, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!(path, "database initialized");
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Start of the UTC calendar day containing `at`.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(at)
}

pub fn to_micros(units: f64) -> i64 {
    (units * MICROS_PER_UNIT as f64).round() as i64
}

pub fn from_micros(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}
