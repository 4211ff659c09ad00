use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

// ── Label types ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub endpoint: String,
    pub status_code: String,
    pub model: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointModelLabels {
    pub endpoint: String,
    pub model: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ModelLabel {
    pub model: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusCodeLabel {
    pub status_code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabel {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabel {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BalanceOpLabels {
    pub kind: String,
    pub outcome: String,
}

// ── Histogram bucket constants ───────────────────────────────────────────────

const LATENCY_BUCKETS: &[f64] = &[
    0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

const TTFB_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0];

// ── AppMetrics ───────────────────────────────────────────────────────────────

pub struct AppMetrics {
    // Mutex-wrapped registry for thread-safe text encoding
    registry: Mutex<Registry>,

    pub request_count: Family<RequestLabels, Counter>,
    pub request_latency: Family<EndpointModelLabels, Histogram, fn() -> Histogram>,
    pub stream_ttfb: Family<ModelLabel, Histogram, fn() -> Histogram>,
    pub tokens_completion: Family<ModelLabel, Counter>,
    pub tokens_prompt: Family<ModelLabel, Counter>,
    pub inflight_requests: Gauge,
    pub upstream_errors: Family<StatusCodeLabel, Counter>,
    pub auth_failures: Counter,
    pub admission_rejections: Family<ReasonLabel, Counter>,
    pub usage_records: Family<OutcomeLabel, Counter>,
    pub balance_ops: Family<BalanceOpLabels, Counter>,
}

impl AppMetrics {
    pub fn new() -> Arc<Self> {
        let mut registry = Registry::default();

        let request_count = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gateway_requests",
            "Proxied requests by method, endpoint, status and model",
            request_count.clone(),
        );

        let request_latency: Family<EndpointModelLabels, Histogram, fn() -> Histogram> =
            Family::new_with_constructor(|| Histogram::new(LATENCY_BUCKETS.iter().copied()));
        registry.register(
            "gateway_request_duration_seconds",
            "End-to-end proxied request latency",
            request_latency.clone(),
        );

        let stream_ttfb: Family<ModelLabel, Histogram, fn() -> Histogram> =
            Family::new_with_constructor(|| Histogram::new(TTFB_BUCKETS.iter().copied()));
        registry.register(
            "gateway_stream_time_to_first_byte_seconds",
            "Time from request receipt to the first relayed chunk of a streamed response",
            stream_ttfb.clone(),
        );

        let tokens_completion = Family::<ModelLabel, Counter>::default();
        registry.register(
            "gateway_completion_tokens",
            "Completion tokens reported by the upstream",
            tokens_completion.clone(),
        );

        let tokens_prompt = Family::<ModelLabel, Counter>::default();
        registry.register(
            "gateway_prompt_tokens",
            "Prompt tokens reported by the upstream",
            tokens_prompt.clone(),
        );

        let inflight_requests = Gauge::default();
        registry.register(
            "gateway_inflight_requests",
            "Proxied requests currently being processed",
            inflight_requests.clone(),
        );

        let upstream_errors = Family::<StatusCodeLabel, Counter>::default();
        registry.register(
            "gateway_upstream_errors",
            "Upstream failures by status (502/504 for transport errors)",
            upstream_errors.clone(),
        );

        let auth_failures = Counter::default();
        registry.register(
            "gateway_auth_failures",
            "Requests rejected for a missing, unknown or unusable API key",
            auth_failures.clone(),
        );

        let admission_rejections = Family::<ReasonLabel, Counter>::default();
        registry.register(
            "gateway_admission_rejections",
            "Requests rejected before forwarding, by reason",
            admission_rejections.clone(),
        );

        let usage_records = Family::<OutcomeLabel, Counter>::default();
        registry.register(
            "gateway_usage_records",
            "Usage records written, by outcome",
            usage_records.clone(),
        );

        let balance_ops = Family::<BalanceOpLabels, Counter>::default();
        registry.register(
            "gateway_balance_operations",
            "Balance ledger operations by kind and outcome",
            balance_ops.clone(),
        );

        Arc::new(AppMetrics {
            registry: Mutex::new(registry),
            request_count,
            request_latency,
            stream_ttfb,
            tokens_completion,
            tokens_prompt,
            inflight_requests,
            upstream_errors,
            auth_failures,
            admission_rejections,
            usage_records,
            balance_ops,
        })
    }

    pub fn reject(&self, reason: &str) {
        self.admission_rejections
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn balance_op(&self, kind: &str, ok: bool) {
        self.balance_ops
            .get_or_create(&BalanceOpLabels {
                kind: kind.to_string(),
                outcome: if ok { "ok" } else { "rejected" }.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let mut buf = String::new();
        let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        encode(&mut buf, &*registry).unwrap_or_default();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_labelled_families() {
        let metrics = AppMetrics::new();
        metrics.reject("rate_limited");
        metrics.balance_op("consume", false);
        metrics.auth_failures.inc();

        let text = metrics.render();
        assert!(text.contains("gateway_admission_rejections_total{reason=\"rate_limited\"} 1"));
        assert!(text.contains("kind=\"consume\""));
        assert!(text.contains("gateway_auth_failures_total 1"));
        assert!(text.contains("gateway_balance_operations_total{kind=\"consume\",outcome=\"rejected\"} 1"));
    }

    #[test]
    fn counters_are_exported_with_a_single_total_suffix() {
        let metrics = AppMetrics::new();
        metrics.auth_failures.inc();
        metrics.reject("quota_exceeded");
        metrics
            .tokens_prompt
            .get_or_create(&ModelLabel { model: "m".into() })
            .inc_by(3);

        let text = metrics.render();
        assert!(text.contains("gateway_prompt_tokens_total{model=\"m\"} 3"));
        assert!(!text.contains("_total_total"));
    }
}
