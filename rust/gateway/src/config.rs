use anyhow::{ensure, Result};

/// All gateway configuration, loaded from environment variables at startup.
/// The shell (or Docker env_file) is responsible for setting these; there is no dotenv parsing.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Upstream ────────────────────────────────────────────────────────────
    pub upstream_url: String,
    /// Injected as `Authorization: Bearer …` when set; otherwise the
    /// caller's own Authorization header is passed through.
    pub upstream_api_key: Option<String>,

    // ── Gateway listen ──────────────────────────────────────────────────────
    pub gateway_host: String,
    pub gateway_port: u16,

    // ── Storage ─────────────────────────────────────────────────────────────
    pub database_path: String,
    pub database_max_connections: u32,

    // ── Keys & limits ───────────────────────────────────────────────────────
    pub api_key_prefix: String,
    pub max_batch_size: usize,
    pub rate_limit_enabled: bool,
    pub default_owner_quota: f64,

    // ── Metering ────────────────────────────────────────────────────────────
    pub cost_per_1k_tokens: f64,
    pub balance_billing: bool,

    // ── Timeouts ─────────────────────────────────────────────────────────────
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub shutdown_drain_secs: u64,

    // ── Logging ──────────────────────────────────────────────────────────────
    pub log_level: String,

    // ── OpenTelemetry ────────────────────────────────────────────────────────
    pub otel_exporter_otlp_endpoint: String,
    pub otel_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` is this with
    /// `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let upstream_url = env
            .string("UPSTREAM_URL", "http://127.0.0.1:8317")
            .trim_end_matches('/')
            .to_string();
        ensure!(
            upstream_url.starts_with("http://") || upstream_url.starts_with("https://"),
            "UPSTREAM_URL must be an http(s) URL, got {upstream_url:?}"
        );

        let upstream_api_key = env
            .get("UPSTREAM_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let cost_per_1k_tokens = env.f64("COST_PER_1K_TOKENS", 0.001);
        ensure!(
            cost_per_1k_tokens.is_finite() && cost_per_1k_tokens >= 0.0,
            "COST_PER_1K_TOKENS must be a non-negative number"
        );

        Ok(Config {
            upstream_url,
            upstream_api_key,
            gateway_host: env.string("GATEWAY_HOST", "0.0.0.0"),
            gateway_port: env.parse("GATEWAY_PORT", 8080),
            database_path: env.string("DATABASE_PATH", "data/gateway.db"),
            database_max_connections: env.parse::<u32>("DATABASE_MAX_CONNECTIONS", 8).max(1),
            api_key_prefix: env.string("API_KEY_PREFIX", "gw"),
            max_batch_size: env.parse::<usize>("MAX_BATCH_SIZE", 100).max(1),
            rate_limit_enabled: env.bool("RATE_LIMIT_ENABLED", true),
            default_owner_quota: env.f64("DEFAULT_OWNER_QUOTA", 100.0),
            cost_per_1k_tokens,
            balance_billing: env.bool("BALANCE_BILLING", false),
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECONDS", 300),
            connect_timeout_secs: env.parse("CONNECT_TIMEOUT_SECONDS", 10),
            shutdown_drain_secs: env.parse("SHUTDOWN_DRAIN_SECONDS", 30),
            log_level: env.string("LOG_LEVEL", "INFO"),
            otel_exporter_otlp_endpoint: env.string(
                "OTEL_EXPORTER_OTLP_ENDPOINT",
                "http://localhost:4317",
            ),
            otel_enabled: env.bool("OTEL_ENABLED", false),
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse(key, default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(default)
    }
}
