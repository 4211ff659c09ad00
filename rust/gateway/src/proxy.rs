//! Metered upstream proxy: admission, forwarding (buffered or SSE relay), and
//! settlement of every attempted call.
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::{
    auth::Caller,
    error::GatewayError,
    limits::Admission,
    metering::{CallOutcome, MeteredCall},
    metrics::{AppMetrics, EndpointModelLabels, ModelLabel, RequestLabels, StatusCodeLabel},
    sse::{inspect_request, usage_from_body, UsageScanner},
    usage::{DateRange, TokenUsage, DEFAULT_RANGE_DAYS},
    AppState,
};

/// Inbound headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    // Bodies are relayed raw, so ask for them uncompressed.
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upstream response headers never relayed back.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

const MAX_USAGE_DAYS: i64 = 365;

const CLIENT_GONE: &str = "client disconnected before stream completed";

// ── Public route handlers ────────────────────────────────────────────────────

/// ANY /v1/* and /api/*: the metered proxy.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    if state.shutting_down.load(Ordering::Relaxed) {
        return Err(GatewayError::ShuttingDown);
    }

    // ── Admission ────────────────────────────────────────────────────────────
    let shape = inspect_request(&body);
    let admission = state
        .limits
        .admit(&caller.key, &caller.owner, shape.model.as_deref())
        .await
        .inspect_err(|e| {
            if e.is_admission_failure() {
                state.metrics.reject(e.reason());
            }
        })?;

    // ── Forward ──────────────────────────────────────────────────────────────
    let path = uri.path().to_string();
    let upstream_url = match uri.query() {
        Some(q) => format!("{}{}?{}", state.config.upstream_url, path, q),
        None => format!("{}{}", state.config.upstream_url, path),
    };
    let forward_headers = upstream_headers(&headers, state.config.upstream_api_key.as_deref());

    let mut call = MeteredCall::admitted(
        &caller.key,
        path.clone(),
        method.as_str(),
        shape.model.clone(),
        shape.stream,
    );
    call.forwarding();
    let inflight = Inflight::start(&state.metrics);
    let labels = CallLabels {
        method: method.to_string(),
        endpoint: path,
        model: shape.model.unwrap_or_else(|| "unknown".into()),
    };

    // Own task: hyper drops this future when the caller hangs up, and the
    // call must still settle exactly once.
    let forward = Forward {
        method,
        url: upstream_url,
        headers: forward_headers,
        body,
        stream: shape.stream,
    };
    state
        .tasks
        .spawn(forward_and_settle(
            state.clone(),
            call,
            forward,
            admission,
            labels,
            inflight,
        ))
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("forward task failed: {e}")))?
}

struct Forward {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    stream: bool,
}

async fn forward_and_settle(
    state: Arc<AppState>,
    call: MeteredCall,
    forward: Forward,
    admission: Admission,
    labels: CallLabels,
    inflight: Inflight,
) -> Result<Response, GatewayError> {
    let sent = state
        .client
        .request(forward.method, &forward.url)
        .headers(forward.headers)
        .body(forward.body)
        .send()
        .await;

    let upstream = match sent {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, url = %forward.url, "upstream request failed");
            let (outcome, err) = transport_failure(&e);
            let status = err.status().as_u16();
            labels.observe(&state.metrics, status, TokenUsage::default(), call.elapsed().as_secs_f64());
            count_upstream_error(&state.metrics, status);
            settle_logged(&state, call, outcome).await;
            drop(inflight);
            return Err(err);
        }
    };

    if forward.stream {
        Ok(stream_response(state, call, upstream, admission, labels, inflight))
    } else {
        buffered_response(state, call, upstream, admission, labels, inflight).await
    }
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub days: Option<i64>,
}

/// GET /gateway/usage: the caller's owner's usage over the last `days` days.
pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(query): Query<UsageQuery>,
) -> Result<impl IntoResponse, GatewayError> {
    let days = query.days.unwrap_or(DEFAULT_RANGE_DAYS).clamp(1, MAX_USAGE_DAYS);
    let range = DateRange::last_days(days);
    let user_id = caller.owner.id;

    let stats = state.usage.stats(user_id, range).await?;
    let models = state.usage.model_breakdown(user_id, range).await?;
    let daily = state.usage.daily(user_id, days).await?;

    Ok(Json(serde_json::json!({
        "days":   days,
        "stats":  stats,
        "models": models,
        "daily":  daily,
        "key": {
            "id":             caller.key.id,
            "name":           caller.key.name,
            "masked_key":     caller.key.masked_key,
            "total_requests": caller.key.total_requests,
            "total_tokens":   caller.key.total_tokens,
            "total_cost":     caller.key.total_cost,
            "quota_limit":    caller.key.quota_limit,
            "quota_used":     caller.key.quota_used,
            "token_limit":    caller.key.token_limit,
            "token_used":     caller.key.token_used,
        },
        "owner": {
            "quota_limit": caller.owner.quota_limit,
            "quota_used":  caller.owner.quota_used,
        },
    })))
}

/// GET /gateway/balance: the caller's owner's balance summary.
pub async fn balance_handler(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<impl IntoResponse, GatewayError> {
    Ok(Json(state.balance.stats(caller.owner.id).await?))
}

// ── Buffered path ────────────────────────────────────────────────────────────

async fn buffered_response(
    state: Arc<AppState>,
    call: MeteredCall,
    upstream: reqwest::Response,
    admission: Admission,
    labels: CallLabels,
    inflight: Inflight,
) -> Result<Response, GatewayError> {
    let status = upstream.status();
    let mut headers = relay_headers(upstream.headers());

    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, status = status.as_u16(), "upstream body read failed");
            let (outcome, err) = transport_failure(&e);
            let failed = err.status().as_u16();
            count_upstream_error(&state.metrics, failed);
            labels.observe(&state.metrics, failed, TokenUsage::default(), call.elapsed().as_secs_f64());
            settle_logged(&state, call, outcome).await;
            drop(inflight);
            return Err(err);
        }
    };

    let tokens = usage_from_body(&body);
    if status.is_server_error() {
        count_upstream_error(&state.metrics, status.as_u16());
        warn!(status = status.as_u16(), "upstream error");
    }
    labels.observe(&state.metrics, status.as_u16(), tokens, call.elapsed().as_secs_f64());
    settle_logged(
        &state,
        call,
        CallOutcome::Responded {
            status: status.as_u16(),
            tokens,
            note: None,
        },
    )
    .await;
    drop(inflight);

    set_rate_headers(&mut headers, admission);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

// ── Streaming path ───────────────────────────────────────────────────────────

/// Relay the upstream body chunk by chunk from a spawned task, scanning SSE
/// lines for usage as they pass. The task settles the call exactly once,
/// whether the stream ends, the upstream breaks, or the client goes away.
fn stream_response(
    state: Arc<AppState>,
    call: MeteredCall,
    upstream: reqwest::Response,
    admission: Admission,
    labels: CallLabels,
    inflight: Inflight,
) -> Response {
    let status = upstream.status();
    let mut headers = relay_headers(upstream.headers());

    // Channel: relay task → axum response body
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);

    state.tasks.clone().spawn(async move {
        let started = Instant::now();
        let mut scanner = UsageScanner::new();
        let mut chunks = upstream.bytes_stream();
        let mut first_chunk = true;

        let end = loop {
            let next = tokio::select! {
                _ = tx.closed() => break StreamEnd::ClientGone,
                next = chunks.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if first_chunk {
                        first_chunk = false;
                        state
                            .metrics
                            .stream_ttfb
                            .get_or_create(&ModelLabel {
                                model: labels.model.clone(),
                            })
                            .observe(call.elapsed().as_secs_f64());
                    }
                    scanner.feed(&chunk);
                    if tx.send(Ok(chunk)).await.is_err() {
                        break StreamEnd::ClientGone;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "stream chunk error");
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break StreamEnd::Broken(e.to_string());
                }
                None => break StreamEnd::Finished,
            }
        };
        // Release the upstream connection before touching the database.
        drop(chunks);
        scanner.finish();

        let tokens = scanner.usage();
        let status_code = status.as_u16();
        let outcome = match end {
            StreamEnd::Finished => CallOutcome::Responded {
                status: status_code,
                tokens,
                note: None,
            },
            StreamEnd::ClientGone => {
                info!(status = status_code, data_lines = scanner.data_lines(), "{CLIENT_GONE}");
                CallOutcome::Responded {
                    status: status_code,
                    tokens,
                    note: Some(CLIENT_GONE.to_string()),
                }
            }
            StreamEnd::Broken(error) => {
                count_upstream_error(&state.metrics, StatusCode::BAD_GATEWAY.as_u16());
                CallOutcome::Interrupted {
                    status: status_code,
                    tokens,
                    error,
                }
            }
        };

        if status.is_server_error() {
            count_upstream_error(&state.metrics, status_code);
        }
        labels.observe(&state.metrics, status_code, tokens, call.elapsed().as_secs_f64());
        info!(
            status = status_code,
            stream_ms = started.elapsed().as_millis() as u64,
            total_tokens = tokens.total_tokens,
            usage_reported = scanner.saw_usage(),
            "stream complete"
        );
        // The client response ends only once the call is on the books.
        settle_logged(&state, call, outcome).await;
        drop(tx);
        drop(inflight);
    });

    set_rate_headers(&mut headers, admission);
    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

enum StreamEnd {
    Finished,
    ClientGone,
    Broken(String),
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Headers sent upstream: the inbound set minus hop and credential headers,
/// plus the gateway's own credential when one is configured. Without one the
/// caller's Authorization header is passed through unchanged.
fn upstream_headers(inbound: &HeaderMap, upstream_api_key: Option<&str>) -> HeaderMap {
    let mut headers = inbound.clone();
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(*name);
    }
    let authorization = match upstream_api_key {
        Some(key) => HeaderValue::from_str(&format!("Bearer {key}")).ok(),
        None => inbound.get(header::AUTHORIZATION).cloned(),
    };
    if let Some(value) = authorization {
        headers.insert(header::AUTHORIZATION, value);
    }
    headers
}

fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(*name);
    }
    headers
}

fn set_rate_headers(headers: &mut HeaderMap, admission: Admission) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(admission.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(admission.reset_in_secs),
    );
}

/// A send or body-read failure: the upstream never produced a usable answer.
fn transport_failure(e: &reqwest::Error) -> (CallOutcome, GatewayError) {
    if e.is_timeout() {
        (CallOutcome::TimedOut, GatewayError::UpstreamTimeout)
    } else {
        let msg = e.to_string();
        (
            CallOutcome::Unreachable(msg.clone()),
            GatewayError::UpstreamUnavailable(msg),
        )
    }
}

fn count_upstream_error(metrics: &AppMetrics, status: u16) {
    metrics
        .upstream_errors
        .get_or_create(&StatusCodeLabel {
            status_code: status.to_string(),
        })
        .inc();
}

/// Settle and log on failure. The response has already been decided by the
/// time this runs, so a ledger error cannot change what the caller sees.
async fn settle_logged(state: &AppState, call: MeteredCall, outcome: CallOutcome) {
    let key_id = call.api_key_id;
    if let Err(e) = state.meter.settle(call, outcome).await {
        error!(key_id, error = %e, detail = ?e, "failed to settle call");
    }
}

struct CallLabels {
    method: String,
    endpoint: String,
    model: String,
}

impl CallLabels {
    fn observe(&self, metrics: &AppMetrics, status: u16, tokens: TokenUsage, secs: f64) {
        metrics
            .request_count
            .get_or_create(&RequestLabels {
                method: self.method.clone(),
                endpoint: self.endpoint.clone(),
                status_code: status.to_string(),
                model: self.model.clone(),
            })
            .inc();
        metrics
            .request_latency
            .get_or_create(&EndpointModelLabels {
                endpoint: self.endpoint.clone(),
                model: self.model.clone(),
            })
            .observe(secs);

        let model = ModelLabel {
            model: self.model.clone(),
        };
        if tokens.prompt_tokens > 0 {
            metrics
                .tokens_prompt
                .get_or_create(&model)
                .inc_by(tokens.prompt_tokens as u64);
        }
        if tokens.completion_tokens > 0 {
            metrics
                .tokens_completion
                .get_or_create(&model)
                .inc_by(tokens.completion_tokens as u64);
        }
    }
}

/// Holds the in-flight gauge up for as long as a forwarded call is alive.
struct Inflight(Arc<AppMetrics>);

impl Inflight {
    fn start(metrics: &Arc<AppMetrics>) -> Self {
        metrics.inflight_requests.inc();
        Inflight(Arc::clone(metrics))
    }
}

impl Drop for Inflight {
    fn drop(&mut self) {
        self.0.inflight_requests.dec();
    }
}
