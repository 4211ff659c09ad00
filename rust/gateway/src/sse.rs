//! Request-body inspection and token-usage extraction for buffered JSON and
//! server-sent-event responses.
use serde_json::Value;

use crate::usage::TokenUsage;

const DONE_SENTINEL: &str = "[DONE]";

/// Longest partial line held while waiting for its newline. A longer line is
/// dropped unscanned; the relayed bytes are unaffected.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// What the gateway needs to know about an inbound body before forwarding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestShape {
    pub model: Option<String>,
    pub stream: bool,
}

/// Read the target model and streaming flag from a JSON body. Anything that
/// isn't a JSON object reads as "no model, not streaming".
pub fn inspect_request(body: &[u8]) -> RequestShape {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
        return RequestShape::default();
    };
    RequestShape {
        model: map
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        stream: map.get("stream").and_then(Value::as_bool).unwrap_or(false),
    }
}

/// Token usage from a parsed response object's `usage` field, if present.
pub fn usage_from_value(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?.as_object()?;
    let count = |field: &str| usage.get(field).and_then(Value::as_i64);
    Some(TokenUsage::new(
        count("prompt_tokens").unwrap_or(0),
        count("completion_tokens").unwrap_or(0),
        count("total_tokens"),
    ))
}

/// Best-effort usage from a buffered response body. Non-JSON bodies and
/// bodies without usage read as zero tokens.
pub fn usage_from_body(body: &[u8]) -> TokenUsage {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| usage_from_value(&v))
        .unwrap_or_default()
}

/// Incremental scanner over a relayed SSE byte stream.
///
/// Bytes are split into `\n`-terminated lines across chunk boundaries; each
/// `data:` line other than the `[DONE]` sentinel is parsed as JSON and the
/// most recent `usage` object is kept. The scanner only observes: callers
/// relay the original chunks untouched. Each byte is searched for a newline
/// once, and a partial line is capped at `MAX_LINE_BYTES`.
#[derive(Debug, Default)]
pub struct UsageScanner {
    line_buf: Vec<u8>,
    /// Inside an over-long line; skip bytes up to its newline.
    skipping: bool,
    last_usage: Option<TokenUsage>,
    data_lines: u64,
}

impl UsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(nl_pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(nl_pos + 1);
            rest = tail;
            if self.skipping {
                self.skipping = false;
            } else if self.line_buf.is_empty() {
                self.scan_line(line);
            } else {
                let mut joined = std::mem::take(&mut self.line_buf);
                joined.extend_from_slice(line);
                self.scan_line(&joined);
                joined.clear();
                self.line_buf = joined;
            }
        }
        if self.skipping {
            return;
        }
        self.line_buf.extend_from_slice(rest);
        if self.line_buf.len() > MAX_LINE_BYTES {
            self.line_buf = Vec::new();
            self.skipping = true;
        }
    }

    /// Flush a trailing line that arrived without its newline.
    pub fn finish(&mut self) {
        if !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            self.scan_line(&line);
        }
        self.skipping = false;
    }

    /// The last usage seen so far; zero if none.
    pub fn usage(&self) -> TokenUsage {
        self.last_usage.unwrap_or_default()
    }

    pub fn saw_usage(&self) -> bool {
        self.last_usage.is_some()
    }

    pub fn data_lines(&self) -> u64 {
        self.data_lines
    }

    fn scan_line(&mut self, raw: &[u8]) {
        let Ok(line) = std::str::from_utf8(raw) else {
            return;
        };
        let Some(payload) = line.trim_end_matches(['\n', '\r']).strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == DONE_SENTINEL {
            return;
        }
        self.data_lines += 1;
        if let Some(usage) = serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|v| usage_from_value(&v))
        {
            self.last_usage = Some(usage);
        }
    }
}
