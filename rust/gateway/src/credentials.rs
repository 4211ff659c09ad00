//! API key issuance, validation, and policy storage.
//!
//! Keys are stored as SHA-256 hashes; plaintext never touches the DB and is
//! returned exactly once, from `issue`/`issue_batch`.
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::{
    db::{now_ms, to_datetime, to_millis},
    error::{Exhausted, GatewayError},
};

/// Bytes of randomness in a generated secret.
const SECRET_BYTES: usize = 32;
const MASK_HEAD: usize = 16;
const MASK_TAIL: usize = 6;

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub masked_key: String,
    pub is_active: bool,
    /// Requests per minute.
    pub rate_limit: u32,
    /// Requests per UTC day; `None` is unlimited.
    pub rate_limit_day: Option<u32>,
    /// `None` defers to the owner's quota.
    pub quota_limit: Option<f64>,
    pub quota_used: f64,
    pub token_limit: Option<i64>,
    pub token_used: i64,
    pub discount_rate: f64,
    /// Empty permits every model.
    pub allowed_models: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub batch_id: Option<String>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn tokens_exhausted(&self) -> bool {
        self.token_limit.is_some_and(|limit| self.token_used >= limit)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.quota_limit.is_some_and(|limit| self.quota_used >= limit)
    }

    /// The key's own usability, independent of its owner.
    pub fn check_usable_at(&self, now: DateTime<Utc>) -> Result<(), GatewayError> {
        if !self.is_active {
            return Err(GatewayError::InvalidCredential);
        }
        if self.is_expired_at(now) {
            return Err(GatewayError::CredentialExpired);
        }
        if self.tokens_exhausted() {
            return Err(GatewayError::CredentialExhausted(Exhausted::TokenBudget));
        }
        if self.quota_exhausted() {
            return Err(GatewayError::CredentialExhausted(Exhausted::KeyQuota));
        }
        Ok(())
    }

    pub fn check_model_access(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, FromRow)]
struct KeyRow {
    id: i64,
    user_id: i64,
    name: String,
    description: Option<String>,
    masked_key: String,
    is_active: bool,
    rate_limit: i64,
    rate_limit_day: Option<i64>,
    quota_limit: Option<f64>,
    quota_used: f64,
    token_limit: Option<i64>,
    token_used: i64,
    discount_rate: f64,
    allowed_models: String,
    expires_at: Option<i64>,
    batch_id: Option<String>,
    total_requests: i64,
    total_tokens: i64,
    total_cost: f64,
    created_at: i64,
    last_used_at: Option<i64>,
}

impl From<KeyRow> for ApiKeyRecord {
    fn from(row: KeyRow) -> Self {
        ApiKeyRecord {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            description: row.description,
            masked_key: row.masked_key,
            is_active: row.is_active,
            rate_limit: u32::try_from(row.rate_limit).unwrap_or(u32::MAX),
            rate_limit_day: row
                .rate_limit_day
                .map(|d| u32::try_from(d).unwrap_or(u32::MAX)),
            quota_limit: row.quota_limit,
            quota_used: row.quota_used,
            token_limit: row.token_limit,
            token_used: row.token_used,
            discount_rate: row.discount_rate,
            // Written only by this module; a corrupt list locks the key down
            // rather than opening it to every model.
            allowed_models: serde_json::from_str(&row.allowed_models)
                .unwrap_or_else(|_| vec![String::new()]),
            expires_at: row.expires_at.map(to_datetime),
            batch_id: row.batch_id,
            total_requests: row.total_requests,
            total_tokens: row.total_tokens,
            total_cost: row.total_cost,
            created_at: to_datetime(row.created_at),
            last_used_at: row.last_used_at.map(to_datetime),
        }
    }
}

const KEY_COLUMNS: &str = "id, user_id, name, description, masked_key, is_active, rate_limit, \
     rate_limit_day, quota_limit, quota_used, token_limit, token_used, discount_rate, \
     allowed_models, expires_at, batch_id, total_requests, total_tokens, total_cost, \
     created_at, last_used_at";

/// Policy attached to a key at issuance.
#[derive(Debug, Clone)]
pub struct KeyPolicy {
    pub name: String,
    pub description: Option<String>,
    pub rate_limit: u32,
    pub rate_limit_day: Option<u32>,
    pub quota_limit: Option<f64>,
    pub token_limit: Option<i64>,
    pub discount_rate: f64,
    pub allowed_models: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            name: "Key".to_string(),
            description: None,
            rate_limit: 60,
            rate_limit_day: None,
            quota_limit: None,
            token_limit: None,
            discount_rate: 1.0,
            allowed_models: Vec::new(),
            expires_at: None,
        }
    }
}

impl KeyPolicy {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::BadRequest("key name must not be empty".into()));
        }
        validate_rate_limit(self.rate_limit)?;
        validate_discount(self.discount_rate)?;
        validate_limits(self.quota_limit, self.token_limit)
    }
}

/// The mutable key fields. `None` leaves a field untouched; nested `Some(None)`
/// clears an optional limit. Counters, owner, and hash are not updatable here.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub rate_limit: Option<u32>,
    pub rate_limit_day: Option<Option<u32>>,
    pub quota_limit: Option<Option<f64>>,
    pub token_limit: Option<Option<i64>>,
    pub discount_rate: Option<f64>,
    pub allowed_models: Option<Vec<String>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

impl KeyUpdate {
    fn validate(&self) -> Result<(), GatewayError> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(GatewayError::BadRequest("key name must not be empty".into()));
            }
        }
        if let Some(rpm) = self.rate_limit {
            validate_rate_limit(rpm)?;
        }
        if let Some(rate) = self.discount_rate {
            validate_discount(rate)?;
        }
        validate_limits(self.quota_limit.flatten(), self.token_limit.flatten())
    }

    fn apply(self, record: &mut ApiKeyRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(description) = self.description {
            record.description = description;
        }
        if let Some(active) = self.is_active {
            record.is_active = active;
        }
        if let Some(rpm) = self.rate_limit {
            record.rate_limit = rpm;
        }
        if let Some(per_day) = self.rate_limit_day {
            record.rate_limit_day = per_day;
        }
        if let Some(quota) = self.quota_limit {
            record.quota_limit = quota;
        }
        if let Some(tokens) = self.token_limit {
            record.token_limit = tokens;
        }
        if let Some(rate) = self.discount_rate {
            record.discount_rate = rate;
        }
        if let Some(models) = self.allowed_models {
            record.allowed_models = models;
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
    }
}

/// Who is acting on a key. Owners may only touch their own keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Owner(i64),
    Admin,
}

impl Actor {
    fn may_manage(self, record: &ApiKeyRecord) -> bool {
        match self {
            Actor::Admin => true,
            Actor::Owner(id) => record.user_id == id,
        }
    }
}

/// Counter increments applied to a key after a metered call.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyUsageDelta {
    pub requests: i64,
    pub tokens: i64,
    pub cost: f64,
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    prefix: String,
    max_batch_size: usize,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool, prefix: impl Into<String>, max_batch_size: usize) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            max_batch_size,
        }
    }

    /// Issue a key. The returned plaintext is never retrievable again.
    pub async fn issue(
        &self,
        owner_id: i64,
        policy: KeyPolicy,
    ) -> Result<(ApiKeyRecord, String), GatewayError> {
        policy.validate()?;
        let mut conn = self.pool.acquire().await?;
        let issued = self.insert_key(&mut conn, owner_id, &policy, None).await?;
        info!(key_id = issued.0.id, user_id = owner_id, "api key issued");
        Ok(issued)
    }

    /// Issue `count` independent keys sharing one policy and batch tag.
    pub async fn issue_batch(
        &self,
        owner_id: i64,
        count: usize,
        policy: KeyPolicy,
    ) -> Result<(String, Vec<(ApiKeyRecord, String)>), GatewayError> {
        if count == 0 || count > self.max_batch_size {
            return Err(GatewayError::BadRequest(format!(
                "batch size must be between 1 and {}",
                self.max_batch_size
            )));
        }
        policy.validate()?;

        let batch_id = format!("batch_{}", random_hex(8));
        let base_name = policy.name.clone();
        let mut issued = Vec::with_capacity(count);

        let mut tx = self.pool.begin().await?;
        for i in 0..count {
            let policy = KeyPolicy {
                name: format!("{base_name}_{}", i + 1),
                ..policy.clone()
            };
            issued.push(
                self.insert_key(&mut tx, owner_id, &policy, Some(&batch_id))
                    .await?,
            );
        }
        tx.commit().await?;

        info!(user_id = owner_id, batch_id = %batch_id, count, "api key batch issued");
        Ok((batch_id, issued))
    }

    async fn insert_key(
        &self,
        conn: &mut SqliteConnection,
        owner_id: i64,
        policy: &KeyPolicy,
        batch_id: Option<&str>,
    ) -> Result<(ApiKeyRecord, String), GatewayError> {
        let plaintext = generate_secret(&self.prefix);
        let now = now_ms();
        let allowed_models = serde_json::to_string(&policy.allowed_models)
            .map_err(|e| GatewayError::Internal(e.into()))?;

        let row = sqlx::query_as::<_, KeyRow>(&format!(
            "INSERT INTO api_keys (key_hash, masked_key, name, description, user_id,
                 rate_limit, rate_limit_day, quota_limit, token_limit, discount_rate,
                 allowed_models, expires_at, batch_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {KEY_COLUMNS}"
        ))
        .bind(hash_secret(&plaintext))
        .bind(mask_secret(&plaintext))
        .bind(policy.name.trim())
        .bind(policy.description.as_deref())
        .bind(owner_id)
        .bind(i64::from(policy.rate_limit))
        .bind(policy.rate_limit_day.map(i64::from))
        .bind(policy.quota_limit)
        .bind(policy.token_limit)
        .bind(policy.discount_rate)
        .bind(allowed_models)
        .bind(policy.expires_at.map(to_millis))
        .bind(batch_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                GatewayError::NotFound("user")
            }
            _ => GatewayError::Database(e),
        })?;

        Ok((row.into(), plaintext))
    }

    /// Resolve a presented secret to its key record.
    ///
    /// Lookup is by digest only. On success the key's last-used time is stamped.
    pub async fn validate(&self, presented: &str) -> Result<ApiKeyRecord, GatewayError> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Err(GatewayError::InvalidCredential);
        }

        let mut record: ApiKeyRecord = sqlx::query_as::<_, KeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE key_hash = ?"
        ))
        .bind(hash_secret(presented))
        .fetch_optional(&self.pool)
        .await?
        .map(ApiKeyRecord::from)
        .ok_or(GatewayError::InvalidCredential)?;

        let now = Utc::now();
        record.check_usable_at(now)?;

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(record.id)
            .execute(&self.pool)
            .await?;
        record.last_used_at = Some(now);

        debug!(key_id = record.id, "api key validated");
        Ok(record)
    }

    pub async fn get(&self, id: i64) -> Result<ApiKeyRecord, GatewayError> {
        sqlx::query_as::<_, KeyRow>(&format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ApiKeyRecord::from)
            .ok_or(GatewayError::NotFound("api key"))
    }

    pub async fn list_by_owner(
        &self,
        owner_id: i64,
        include_inactive: bool,
    ) -> Result<Vec<ApiKeyRecord>, GatewayError> {
        let rows = sqlx::query_as::<_, KeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys
             WHERE user_id = ? AND (is_active = 1 OR ?)
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(owner_id)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKeyRecord::from).collect())
    }

    pub async fn list_by_batch(&self, batch_id: &str) -> Result<Vec<ApiKeyRecord>, GatewayError> {
        let rows = sqlx::query_as::<_, KeyRow>(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE batch_id = ? ORDER BY id"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKeyRecord::from).collect())
    }

    pub async fn update(
        &self,
        actor: Actor,
        id: i64,
        update: KeyUpdate,
    ) -> Result<ApiKeyRecord, GatewayError> {
        update.validate()?;
        let mut tx = self.pool.begin().await?;
        let mut record = lock_key_for(&mut tx, actor, id).await?;
        update.apply(&mut record);

        let allowed_models = serde_json::to_string(&record.allowed_models)
            .map_err(|e| GatewayError::Internal(e.into()))?;
        sqlx::query(
            "UPDATE api_keys SET name = ?, description = ?, is_active = ?, rate_limit = ?,
                 rate_limit_day = ?, quota_limit = ?, token_limit = ?, discount_rate = ?,
                 allowed_models = ?, expires_at = ?
             WHERE id = ?",
        )
        .bind(record.name.trim())
        .bind(record.description.as_deref())
        .bind(record.is_active)
        .bind(i64::from(record.rate_limit))
        .bind(record.rate_limit_day.map(i64::from))
        .bind(record.quota_limit)
        .bind(record.token_limit)
        .bind(record.discount_rate)
        .bind(allowed_models)
        .bind(record.expires_at.map(to_millis))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(key_id = id, ?actor, "api key updated");
        Ok(record)
    }

    pub async fn deactivate(&self, actor: Actor, id: i64) -> Result<ApiKeyRecord, GatewayError> {
        self.update(
            actor,
            id,
            KeyUpdate {
                is_active: Some(false),
                ..KeyUpdate::default()
            },
        )
        .await
    }

    pub async fn delete(&self, actor: Actor, id: i64) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;
        lock_key_for(&mut tx, actor, id).await?;
        sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(key_id = id, ?actor, "api key deleted");
        Ok(())
    }

    /// Zero the key's consumption counters. The only path on which "used"
    /// counters go down.
    pub async fn reset_usage(&self, actor: Actor, id: i64) -> Result<ApiKeyRecord, GatewayError> {
        let mut tx = self.pool.begin().await?;
        lock_key_for(&mut tx, actor, id).await?;
        let row = sqlx::query_as::<_, KeyRow>(&format!(
            "UPDATE api_keys SET quota_used = 0, token_used = 0, total_requests = 0,
                 total_tokens = 0
             WHERE id = ?
             RETURNING {KEY_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(key_id = id, ?actor, "api key usage reset");
        Ok(row.into())
    }
}

/// Add a metered call's consumption to the key's counters.
pub(crate) async fn apply_key_usage(
    conn: &mut SqliteConnection,
    key_id: i64,
    delta: KeyUsageDelta,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE api_keys SET
             total_requests = total_requests + ?,
             total_tokens   = total_tokens + ?,
             token_used     = token_used + ?,
             total_cost     = total_cost + ?,
             quota_used     = quota_used + ?
         WHERE id = ?",
    )
    .bind(delta.requests)
    .bind(delta.tokens)
    .bind(delta.tokens)
    .bind(delta.cost)
    .bind(delta.cost)
    .bind(key_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Lock a key row for writing and check the actor may manage it. A key the
/// actor does not own reads as missing.
async fn lock_key_for(
    conn: &mut SqliteConnection,
    actor: Actor,
    id: i64,
) -> Result<ApiKeyRecord, GatewayError> {
    let record: ApiKeyRecord = sqlx::query_as::<_, KeyRow>(&format!(
        "UPDATE api_keys SET updated_at = ? WHERE id = ? RETURNING {KEY_COLUMNS}"
    ))
    .bind(now_ms())
    .bind(id)
    .fetch_optional(conn)
    .await?
    .map(ApiKeyRecord::from)
    .ok_or(GatewayError::NotFound("api key"))?;

    if !actor.may_manage(&record) {
        return Err(GatewayError::NotFound("api key"));
    }
    Ok(record)
}

fn generate_secret(prefix: &str) -> String {
    format!("{prefix}_{}", random_hex(SECRET_BYTES))
}

pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn mask_secret(secret: &str) -> String {
    let head: String = secret.chars().take(MASK_HEAD).collect();
    let tail: String = {
        let chars: Vec<char> = secret.chars().collect();
        chars[chars.len().saturating_sub(MASK_TAIL)..].iter().collect()
    };
    format!("{head}...{tail}")
}

fn validate_rate_limit(rpm: u32) -> Result<(), GatewayError> {
    if rpm == 0 {
        return Err(GatewayError::InvalidAmount(
            "per-minute rate limit must be at least 1".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_discount(rate: f64) -> Result<(), GatewayError> {
    if !(rate.is_finite() && rate > 0.0 && rate <= 1.0) {
        return Err(GatewayError::InvalidAmount(format!(
            "discount rate must be in (0, 1], got {rate}"
        )));
    }
    Ok(())
}

fn validate_limits(quota: Option<f64>, tokens: Option<i64>) -> Result<(), GatewayError> {
    if let Some(q) = quota {
        if !(q.is_finite() && q >= 0.0) {
            return Err(GatewayError::InvalidAmount(format!(
                "quota limit must be non-negative, got {q}"
            )));
        }
    }
    if let Some(t) = tokens {
        if t < 0 {
            return Err(GatewayError::InvalidAmount(format!(
                "token limit must be non-negative, got {t}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record() -> ApiKeyRecord {
        ApiKeyRecord {
            id: 1,
            user_id: 7,
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

    #[test]
    fn generated_secrets_carry_prefix_and_256_bits() {
        let secret = generate_secret("gw");
        assert!(secret.starts_with("gw_"));
        assert_eq!(secret.len(), "gw_".len() + SECRET_BYTES * 2);
        assert_ne!(secret, generate_secret("gw"));
    }

    #[test]
    fn mask_keeps_prefix_and_suffix_only() {
        let secret = "gw_0123456789abcdef0123456789abcdef";
        let masked = mask_secret(secret);
        assert_eq!(masked, "gw_0123456789abc...abcdef");
        assert!(!masked.contains("0123456789abcdef0123"));
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        let digest = hash_secret("gw_abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_secret("gw_abc"));
        assert_ne!(digest, hash_secret("gw_abd"));
    }

    #[test]
    fn token_budget_rejects_only_once_reached() {
        let mut key = record();
        key.token_limit = Some(1000);
        key.token_used = 999;
        assert!(key.check_usable_at(Utc::now()).is_ok());

        key.token_used = 1000;
        assert!(matches!(
            key.check_usable_at(Utc::now()),
            Err(GatewayError::CredentialExhausted(Exhausted::TokenBudget))
        ));
    }

    #[test]
    fn expiry_is_strictly_after() {
        let mut key = record();
        let now = Utc::now();
        key.expires_at = Some(now);
        assert!(!key.is_expired_at(now));
        assert!(key.is_expired_at(now + Duration::milliseconds(1)));
    }

    #[test]
    fn model_allow_list_empty_means_all() {
        let mut key = record();
        assert!(key.check_model_access("anything"));
        key.allowed_models = vec!["llama-7b".into()];
        assert!(key.check_model_access("llama-7b"));
        assert!(!key.check_model_access("gpt-4"));
    }

    #[test]
    fn owners_cannot_manage_foreign_keys() {
        let key = record();
        assert!(Actor::Owner(7).may_manage(&key));
        assert!(!Actor::Owner(8).may_manage(&key));
        assert!(Actor::Admin.may_manage(&key));
    }

    #[test]
    fn discount_must_be_in_half_open_unit_interval() {
        assert!(validate_discount(1.0).is_ok());
        assert!(validate_discount(0.01).is_ok());
        assert!(validate_discount(0.0).is_err());
        assert!(validate_discount(1.5).is_err());
        assert!(validate_discount(f64::NAN).is_err());
    }
}
