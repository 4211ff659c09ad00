//! Append-only usage ledger: one immutable row per attempted proxied call,
//! with every aggregate computed on demand from those rows.
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::{
    credentials::random_hex,
    db::{now_ms, to_datetime, to_millis},
    error::GatewayError,
};

/// Lookback used by aggregates when no start is given.
pub const DEFAULT_RANGE_DAYS: i64 = 30;
const MAX_PAGE_SIZE: u32 = 1000;

/// Token counts reported by the upstream for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64, total_tokens: Option<i64>) -> Self {
        let prompt_tokens = prompt_tokens.max(0);
        let completion_tokens = completion_tokens.max(0);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens
                .filter(|t| *t > 0)
                .unwrap_or(prompt_tokens + completion_tokens),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

/// Nominal cost of a call before any discount.
pub fn compute_cost(total_tokens: i64, cost_per_1k_tokens: f64) -> f64 {
    total_tokens.max(0) as f64 / 1000.0 * cost_per_1k_tokens
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UsageRecord {
    pub id: i64,
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub endpoint: String,
    pub method: String,
    pub model: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub status_code: Option<i64>,
    pub latency_ms: i64,
    pub is_streaming: bool,
    pub is_success: bool,
    pub error_message: Option<String>,
    #[sqlx(try_from = "i64")]
    pub created_at: Millis,
}

/// Unix-millisecond column that serializes as an RFC 3339 timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Millis(pub i64);

impl From<i64> for Millis {
    fn from(ms: i64) -> Self {
        Millis(ms)
    }
}

impl Millis {
    pub fn to_datetime(self) -> DateTime<Utc> {
        to_datetime(self.0)
    }
}

impl Serialize for Millis {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_datetime().serialize(serializer)
    }
}

const USAGE_COLUMNS: &str = "id, request_id, user_id, api_key_id, endpoint, method, model, \
     prompt_tokens, completion_tokens, total_tokens, cost, status_code, latency_ms, \
     is_streaming, is_success, error_message, created_at";

/// Everything known about a call once it has finished.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub user_id: i64,
    pub api_key_id: i64,
    pub endpoint: String,
    pub method: String,
    pub model: Option<String>,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub is_streaming: bool,
    pub is_success: bool,
    pub error_message: Option<String>,
}

/// Inclusive date range; open ends resolve to the default lookback and now.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn last_days(days: i64) -> Self {
        Self {
            start: Some(Utc::now() - Duration::days(days)),
            end: None,
        }
    }

    fn resolve(self) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.end.unwrap_or_else(Utc::now);
        let start = self
            .start
            .unwrap_or_else(|| end - Duration::days(DEFAULT_RANGE_DAYS));
        (start, end)
    }

    /// Bounds for listings, where an open end means unbounded.
    fn bounds(self) -> (i64, i64) {
        (
            self.start.map(to_millis).unwrap_or(i64::MIN),
            self.end.map(to_millis).unwrap_or(i64::MAX),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Page {
    fn limit(self) -> i64 {
        i64::from(self.limit.clamp(1, MAX_PAGE_SIZE))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub total_requests: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
    pub success_count: i64,
    pub error_count: i64,
    /// Percentage; 100 when there are no records.
    pub success_rate: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct StatsRow {
    total_requests: i64,
    total_prompt_tokens: i64,
    total_completion_tokens: i64,
    total_tokens: i64,
    total_cost: f64,
    avg_latency_ms: f64,
    success_count: i64,
    error_count: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ModelUsage {
    pub model: String,
    pub request_count: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DailyUsage {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub request_count: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub unique_users: i64,
    pub unique_keys: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UsageLedger {
    pool: SqlitePool,
}

impl UsageLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, usage: &NewUsage) -> Result<UsageRecord, GatewayError> {
        let mut conn = self.pool.acquire().await?;
        Ok(insert_usage(&mut conn, usage).await?)
    }

    pub async fn get_by_request_id(&self, request_id: &str) -> Result<UsageRecord, GatewayError> {
        sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE request_id = ?"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(GatewayError::NotFound("usage record"))
    }

    /// Newest first.
    pub async fn list_by_user(
        &self,
        user_id: i64,
        range: DateRange,
        page: Page,
    ) -> Result<Vec<UsageRecord>, GatewayError> {
        self.list_where("user_id", user_id, range, page).await
    }

    /// Newest first.
    pub async fn list_by_key(
        &self,
        api_key_id: i64,
        range: DateRange,
        page: Page,
    ) -> Result<Vec<UsageRecord>, GatewayError> {
        self.list_where("api_key_id", api_key_id, range, page).await
    }

    async fn list_where(
        &self,
        column: &'static str,
        id: i64,
        range: DateRange,
        page: Page,
    ) -> Result<Vec<UsageRecord>, GatewayError> {
        let (start, end) = range.bounds();
        Ok(sqlx::query_as::<_, UsageRecord>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records
             WHERE {column} = ? AND created_at >= ? AND created_at <= ?
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(id)
        .bind(start)
        .bind(end)
        .bind(page.limit())
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Calls recorded against a key at or after `since`. Backs the daily limit.
    pub async fn count_requests_since(
        &self,
        api_key_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, GatewayError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM usage_records WHERE api_key_id = ? AND created_at >= ?",
        )
        .bind(api_key_id)
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn stats(&self, user_id: i64, range: DateRange) -> Result<UsageStats, GatewayError> {
        let (start, end) = range.resolve();
        let row = sqlx::query_as::<_, StatsRow>(
            "SELECT
                 COUNT(*)                                               AS total_requests,
                 COALESCE(SUM(prompt_tokens), 0)                        AS total_prompt_tokens,
                 COALESCE(SUM(completion_tokens), 0)                    AS total_completion_tokens,
                 COALESCE(SUM(total_tokens), 0)                         AS total_tokens,
                 COALESCE(SUM(cost), 0.0)                               AS total_cost,
                 COALESCE(AVG(latency_ms), 0.0)                         AS avg_latency_ms,
                 COALESCE(SUM(CASE WHEN is_success THEN 1 ELSE 0 END), 0) AS success_count,
                 COALESCE(SUM(CASE WHEN is_success THEN 0 ELSE 1 END), 0) AS error_count
             FROM usage_records
             WHERE user_id = ? AND created_at >= ? AND created_at <= ?",
        )
        .bind(user_id)
        .bind(to_millis(start))
        .bind(to_millis(end))
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageStats {
            total_requests: row.total_requests,
            total_prompt_tokens: row.total_prompt_tokens,
            total_completion_tokens: row.total_completion_tokens,
            total_tokens: row.total_tokens,
            total_cost: row.total_cost,
            avg_latency_ms: row.avg_latency_ms,
            success_count: row.success_count,
            error_count: row.error_count,
            success_rate: success_rate(row.success_count, row.total_requests),
            period_start: start,
            period_end: end,
        })
    }

    /// Per-model totals, busiest first. Calls with no model are left out.
    pub async fn model_breakdown(
        &self,
        user_id: i64,
        range: DateRange,
    ) -> Result<Vec<ModelUsage>, GatewayError> {
        let (start, end) = range.resolve();
        Ok(sqlx::query_as::<_, ModelUsage>(
            "SELECT model,
                    COUNT(*)                       AS request_count,
                    COALESCE(SUM(total_tokens), 0) AS total_tokens,
                    COALESCE(SUM(cost), 0.0)       AS total_cost
             FROM usage_records
             WHERE user_id = ? AND created_at >= ? AND created_at <= ? AND model IS NOT NULL
             GROUP BY model
             ORDER BY request_count DESC, model",
        )
        .bind(user_id)
        .bind(to_millis(start))
        .bind(to_millis(end))
        .fetch_all(&self.pool)
        .await?)
    }

    /// One row per UTC day with traffic in the last `days` days, oldest first.
    pub async fn daily(&self, user_id: i64, days: i64) -> Result<Vec<DailyUsage>, GatewayError> {
        let (start, end) = DateRange::last_days(days).resolve();
        Ok(sqlx::query_as::<_, DailyUsage>(
            "SELECT date(created_at / 1000, 'unixepoch') AS date,
                    COUNT(*)                              AS request_count,
                    COALESCE(SUM(total_tokens), 0)        AS total_tokens,
                    COALESCE(SUM(cost), 0.0)              AS total_cost
             FROM usage_records
             WHERE user_id = ? AND created_at >= ? AND created_at <= ?
             GROUP BY date
             ORDER BY date",
        )
        .bind(user_id)
        .bind(to_millis(start))
        .bind(to_millis(end))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Cross-user totals for administrative reporting.
    pub async fn global_stats(&self, range: DateRange) -> Result<GlobalStats, GatewayError> {
        let (start, end) = range.resolve();
        let (total_requests, total_tokens, total_cost, unique_users, unique_keys): (
            i64,
            i64,
            f64,
            i64,
            i64,
        ) = sqlx::query_as(
            "SELECT COUNT(*),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost), 0.0),
                    COUNT(DISTINCT user_id),
                    COUNT(DISTINCT api_key_id)
             FROM usage_records
             WHERE created_at >= ? AND created_at <= ?",
        )
        .bind(to_millis(start))
        .bind(to_millis(end))
        .fetch_one(&self.pool)
        .await?;

        Ok(GlobalStats {
            total_requests,
            total_tokens,
            total_cost,
            unique_users,
            unique_keys,
            period_start: start,
            period_end: end,
        })
    }
}

/// Append one usage row on an existing connection or transaction.
pub(crate) async fn insert_usage(
    conn: &mut SqliteConnection,
    usage: &NewUsage,
) -> Result<UsageRecord, sqlx::Error> {
    sqlx::query_as::<_, UsageRecord>(&format!(
        "INSERT INTO usage_records (request_id, user_id, api_key_id, endpoint, method, model,
             prompt_tokens, completion_tokens, total_tokens, cost, status_code, latency_ms,
             is_streaming, is_success, error_message, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING {USAGE_COLUMNS}"
    ))
    .bind(random_hex(16))
    .bind(usage.user_id)
    .bind(usage.api_key_id)
    .bind(&usage.endpoint)
    .bind(&usage.method)
    .bind(usage.model.as_deref())
    .bind(usage.tokens.prompt_tokens)
    .bind(usage.tokens.completion_tokens)
    .bind(usage.tokens.total_tokens)
    .bind(usage.cost)
    .bind(usage.status_code.map(i64::from))
    .bind(i64::try_from(usage.latency_ms).unwrap_or(i64::MAX))
    .bind(usage.is_streaming)
    .bind(usage.is_success)
    .bind(usage.error_message.as_deref())
    .bind(now_ms())
    .fetch_one(conn)
    .await
}

fn success_rate(successes: i64, total: i64) -> f64 {
    if total == 0 {
        100.0
    } else {
        successes as f64 / total as f64 * 100.0
    }
}
