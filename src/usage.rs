// Usage extraction - normalized token/cost/timing metadata
//
// A completed logical response (one buffered JSON body, or one message reduced
// from an SSE stream) plus its response headers yield a single UsageRecord.
// The record is built once and never mutated; it rides along on the exchange
// record handed to the logger.
//
// Two usage dialects are normalized into the same three token fields:
// - OpenAI-style:    usage.prompt_tokens / completion_tokens / total_tokens
// - Anthropic-style: usage.input_tokens / output_tokens
//                    (+ cache_creation_input_tokens / cache_read_input_tokens)

use serde::{Deserialize, Serialize};

use crate::pricing;

/// Gateway headers carrying per-call metadata (LiteLLM-style header family)
const HEADER_CALL_ID: &str = "x-litellm-call-id";
const HEADER_MODEL_ID: &str = "x-litellm-model-id";
const HEADER_RESPONSE_COST: &str = "x-litellm-response-cost";
const HEADER_RESPONSE_DURATION_MS: &str = "x-litellm-response-duration-ms";
const HEADER_ATTEMPTED_RETRIES: &str = "x-litellm-attempted-retries";
const HEADER_ATTEMPTED_FALLBACKS: &str = "x-litellm-attempted-fallbacks";

/// Normalized token/cost/timing metadata for one logical exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,

    /// Anthropic prompt-cache accounting
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,

    /// USD cost: gateway-reported when available, else computed from the
    /// pricing table for recognized models
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Upstream gateway call id for correlation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_call_id: Option<String>,

    pub retries: u32,
    pub fallbacks: u32,

    /// Milliseconds from request start to first response byte (streaming only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

impl UsageRecord {
    /// True when nothing useful was extracted; such records are dropped
    /// rather than logged as all-zero noise.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.upstream_call_id.is_none() && self.cost_usd.is_none()
    }
}

/// Wall-clock timing observed by the forwarder or reassembler
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseTiming {
    /// Total exchange duration in milliseconds
    pub duration_ms: u64,
    /// Gap between request start and first received byte, when streamed
    pub first_byte_ms: Option<u64>,
}

/// Build a UsageRecord from a completed logical response body and its headers.
///
/// `body` is either the upstream JSON response or the reducer's output for a
/// streamed response - both carry the same `usage` object shape, so one
/// extraction path serves the regular and streaming forwarder legs as well as
/// tunnel reassembly.
pub fn extract_usage(
    body: Option<&serde_json::Value>,
    headers: &[(String, String)],
    timing: ResponseTiming,
) -> UsageRecord {
    let mut record = UsageRecord {
        upstream_call_id: header_string(headers, HEADER_CALL_ID),
        retries: header_number(headers, HEADER_ATTEMPTED_RETRIES).unwrap_or(0) as u32,
        fallbacks: header_number(headers, HEADER_ATTEMPTED_FALLBACKS).unwrap_or(0) as u32,
        cost_usd: header_float(headers, HEADER_RESPONSE_COST),
        model: header_string(headers, HEADER_MODEL_ID),
        time_to_first_token_ms: timing.first_byte_ms,
        ..Default::default()
    };

    if let Some(body) = body {
        // Model from the body wins over the gateway's model-id header; the
        // body names the model that actually answered.
        if let Some(model) = body.get("model").and_then(|v| v.as_str()) {
            record.model = Some(model.to_string());
        }
        if let Some(usage) = body.get("usage") {
            apply_usage_object(&mut record, usage);
        }
    }

    // Duration: gateway-reported beats locally observed
    let duration_ms =
        header_number(headers, HEADER_RESPONSE_DURATION_MS).unwrap_or(timing.duration_ms);
    if duration_ms > 0 && record.completion_tokens > 0 {
        record.tokens_per_second =
            Some(record.completion_tokens as f64 / (duration_ms as f64 / 1000.0));
    }

    if record.cost_usd.is_none() {
        if let Some(model) = &record.model {
            record.cost_usd = pricing::calculate_cost(
                model,
                record.prompt_tokens,
                record.completion_tokens,
                record.cache_creation_tokens,
                record.cache_read_tokens,
            );
        }
    }

    record
}

/// Merge a `usage` JSON object into the record, accepting both field dialects
fn apply_usage_object(record: &mut UsageRecord, usage: &serde_json::Value) {
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64());

    // OpenAI dialect
    if let Some(prompt) = field("prompt_tokens") {
        record.prompt_tokens = prompt;
    }
    if let Some(completion) = field("completion_tokens") {
        record.completion_tokens = completion;
    }

    // Anthropic dialect
    if let Some(input) = field("input_tokens") {
        record.prompt_tokens = input;
    }
    if let Some(output) = field("output_tokens") {
        record.completion_tokens = output;
    }
    if let Some(cache_creation) = field("cache_creation_input_tokens") {
        record.cache_creation_tokens = cache_creation;
    }
    if let Some(cache_read) = field("cache_read_input_tokens") {
        record.cache_read_tokens = cache_read;
    }

    record.total_tokens =
        field("total_tokens").unwrap_or(record.prompt_tokens + record.completion_tokens);
}

fn header_string(headers: &[(String, String)], name: &str) -> Option<String> {
    crate::util::header_value(headers, name).map(String::from)
}

fn header_number(headers: &[(String, String)], name: &str) -> Option<u64> {
    crate::util::header_value(headers, name).and_then(|v| v.parse().ok())
}

fn header_float(headers: &[(String, String)], name: &str) -> Option<f64> {
    crate::util::header_value(headers, name).and_then(|v| v.parse().ok())
}
