// SSE (Server-Sent Events) reduction module
//
// The Anthropic API streams a response as SSE line pairs:
// ```
// event: <event_type>
// data: <json_payload>
// ```
//
// This module folds such a stream back into one JSON object equivalent to the
// non-streaming response, so the usage extractor and the exchange log see the
// same shape regardless of how the response arrived.
//
// Event types driving the state machine:
// - `message_start`: seeds the envelope (id, role, model, initial usage)
// - `content_block_start`: opens a working block at an announced index
// - `content_block_delta`: incremental content (text_delta, thinking_delta,
//   input_json_delta)
// - `content_block_stop`: finalizes the working block into the content list
// - `message_delta`: merges stop_reason/stop_sequence and late usage
// - `message_stop`: terminal
//
// The reducer is deliberately forgiving: comment lines, `event:` lines with
// no data, `[DONE]` sentinels, and truncated streams all yield whatever was
// assembled so far instead of an error. Deltas addressed to an index other
// than the open block's are a protocol violation and are dropped with a
// warning.

use serde_json::{json, Map, Value};

/// A content block that has been started but not yet stopped
struct OpenBlock {
    index: usize,
    block: Value,
    /// Raw input_json_delta fragments, concatenated; parsed at block stop
    partial_json: String,
}

/// Folds an SSE event sequence into one logical message.
///
/// Feed lines in arrival order with [`push_line`](Self::push_line), then call
/// [`finish`](Self::finish). Output key order is deterministic (sorted), so
/// reducing the same sequence twice yields identical JSON.
pub struct StreamReducer {
    envelope: Map<String, Value>,
    /// Arena indexed by block index; sparse arrivals leave None gaps that are
    /// padded with empty placeholders at finish
    blocks: Vec<Option<Value>>,
    open: Option<OpenBlock>,
    usage: Map<String, Value>,
    seen_any: bool,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self {
            envelope: Map::new(),
            blocks: Vec::new(),
            open: None,
            usage: Map::new(),
            seen_any: false,
        }
    }

    /// Consume one SSE line. `event:` lines and comments carry no payload and
    /// are ignored; all state transitions key off the `type` field inside the
    /// `data:` JSON.
    pub fn push_line(&mut self, line: &str) {
        let Some(data) = parse_sse_data_line(line.trim()) else {
            return;
        };

        let event_type = data.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match event_type {
            "message_start" => self.on_message_start(&data),
            "content_block_start" => self.on_block_start(&data),
            "content_block_delta" => self.on_block_delta(&data),
            "content_block_stop" => self.on_block_stop(),
            "message_delta" => self.on_message_delta(&data),
            "message_stop" => {}
            _ => {}
        }
    }

    fn on_message_start(&mut self, data: &Value) {
        let Some(message) = data.get("message").and_then(|m| m.as_object()) else {
            return;
        };
        self.seen_any = true;
        for (key, value) in message {
            match key.as_str() {
                // Content is rebuilt from blocks; usage is tracked separately
                // so message_delta updates overwrite per key
                "content" => {}
                "usage" => {
                    if let Some(usage) = value.as_object() {
                        self.usage.extend(usage.clone());
                    }
                }
                _ => {
                    self.envelope.insert(key.clone(), value.clone());
                }
            }
        }
    }

    fn on_block_start(&mut self, data: &Value) {
        let index = data
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize)
            .unwrap_or(self.blocks.len());
        let mut block = data.get("content_block").cloned().unwrap_or(json!({}));

        // Seed the fields deltas will append to
        if let Some(obj) = block.as_object_mut() {
            let block_type = obj.get("type").and_then(|t| t.as_str()).unwrap_or("");
            match block_type {
                "text" => {
                    obj.entry("text").or_insert(json!(""));
                }
                "thinking" => {
                    obj.entry("thinking").or_insert(json!(""));
                }
                "tool_use" => {
                    obj.entry("input").or_insert(json!({}));
                }
                _ => {}
            }
        }

        self.seen_any = true;
        self.open = Some(OpenBlock {
            index,
            block,
            partial_json: String::new(),
        });
    }

    fn on_block_delta(&mut self, data: &Value) {
        let index = data
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize);
        let Some(delta) = data.get("delta") else {
            return;
        };

        let Some(open) = self.open.as_mut() else {
            tracing::warn!("content_block_delta with no open block, dropping");
            return;
        };
        if let Some(index) = index {
            if index != open.index {
                // Protocol violation: deltas must address the open block
                tracing::warn!(
                    delta_index = index,
                    open_index = open.index,
                    "content_block_delta for a block that is not open, dropping"
                );
                return;
            }
        }

        match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "text_delta" => {
                if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                    append_str_field(&mut open.block, "text", text);
                }
            }
            "thinking_delta" => {
                if let Some(text) = delta.get("thinking").and_then(|t| t.as_str()) {
                    append_str_field(&mut open.block, "thinking", text);
                }
            }
            "input_json_delta" => {
                if let Some(fragment) = delta.get("partial_json").and_then(|t| t.as_str()) {
                    open.partial_json.push_str(fragment);
                }
            }
            other => {
                tracing::debug!(delta_type = other, "unrecognized delta type, ignoring");
            }
        }
    }

    fn on_block_stop(&mut self) {
        if let Some(open) = self.open.take() {
            self.store_block(open);
        }
    }

    fn on_message_delta(&mut self, data: &Value) {
        if let Some(delta) = data.get("delta").and_then(|d| d.as_object()) {
            for (key, value) in delta {
                self.envelope.insert(key.clone(), value.clone());
            }
        }
        // Later usage values overwrite earlier ones for the same key
        if let Some(usage) = data.get("usage").and_then(|u| u.as_object()) {
            self.usage.extend(usage.clone());
        }
    }

    /// Finalize an open block into the arena at its index
    fn store_block(&mut self, open: OpenBlock) {
        let OpenBlock {
            index,
            mut block,
            partial_json,
        } = open;

        if !partial_json.is_empty() {
            match serde_json::from_str::<Value>(&partial_json) {
                Ok(input) => {
                    if let Some(obj) = block.as_object_mut() {
                        obj.insert("input".to_string(), input);
                    }
                }
                Err(e) => {
                    tracing::warn!("unparseable tool input fragments: {}", e);
                }
            }
        }

        if index >= self.blocks.len() {
            self.blocks.resize(index + 1, None);
        }
        self.blocks[index] = Some(block);
    }

    /// Produce the reduced message, or None if the stream carried nothing
    /// recognizable. A truncated stream (missing content_block_stop or
    /// message_stop) still yields everything assembled so far.
    pub fn finish(mut self) -> Option<Value> {
        if let Some(open) = self.open.take() {
            self.store_block(open);
        }
        if !self.seen_any {
            return None;
        }

        let content: Vec<Value> = self
            .blocks
            .into_iter()
            .map(|slot| slot.unwrap_or(json!({})))
            .collect();

        let mut envelope = self.envelope;
        envelope.insert("content".to_string(), Value::Array(content));
        if !self.usage.is_empty() {
            envelope.insert("usage".to_string(), Value::Object(self.usage));
        }
        Some(Value::Object(envelope))
    }
}

impl Default for StreamReducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce a complete SSE body in one call
pub fn reduce_sse_body(body: &str) -> Option<Value> {
    let mut reducer = StreamReducer::new();
    for line in body.lines() {
        reducer.push_line(line);
    }
    reducer.finish()
}

/// Check whether a content-type names an SSE stream
pub fn is_sse_content_type(content_type: &str) -> bool {
    content_type.contains("text/event-stream")
}

/// Append to a string field, creating it when absent
fn append_str_field(block: &mut Value, field: &str, text: &str) {
    let Some(obj) = block.as_object_mut() else {
        return;
    };
    match obj.get_mut(field) {
        Some(Value::String(existing)) => existing.push_str(text),
        _ => {
            obj.insert(field.to_string(), json!(text));
        }
    }
}

/// Parse an SSE "data:" line into JSON
///
/// Returns None if:
/// - Line doesn't start with "data:" (event names, comments, blanks)
/// - Data is empty or the "[DONE]" sentinel
/// - JSON parsing fails
fn parse_sse_data_line(line: &str) -> Option<Value> {
    let json_str = line.strip_prefix("data:")?.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return None;
    }
    serde_json::from_str(json_str).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A complete, well-formed stream for a plain text answer
    fn sample_stream() -> String {
        [
            r#"event: message_start"#,
            r#"data: {"type":"message_start","message":{"id":"msg_01","type":"message","role":"assistant","model":"claude-3-5-sonnet-20241022","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":3}}}"#,
            r#"event: content_block_start"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#": keep-alive comment"#,
            r#"event: content_block_delta"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello, "}}"#,
            r#"event: content_block_delta"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"world!"}}"#,
            r#"event: content_block_stop"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
            r#"event: message_delta"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":5}}"#,
            r#"event: message_stop"#,
            r#"data: {"type":"message_stop"}"#,
        ]
        .join("\n")
    }

    #[test]
    fn test_reduces_text_stream() {
        let message = reduce_sse_body(&sample_stream()).unwrap();
        assert_eq!(message["id"], "msg_01");
        assert_eq!(message["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(message["stop_reason"], "end_turn");
        assert_eq!(message["content"][0]["text"], "Hello, world!");
        assert_eq!(message["usage"]["input_tokens"], 3);
        assert_eq!(message["usage"]["output_tokens"], 5);
    }

    #[test]
    fn test_idempotent_on_same_sequence() {
        let body = sample_stream();
        let first = serde_json::to_string(&reduce_sse_body(&body).unwrap()).unwrap();
        let second = serde_json::to_string(&reduce_sse_body(&body).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_round_trip_from_known_message() {
        // Split a known final text into deltas and verify it reassembles
        let text = "The quick brown fox jumps over the lazy dog";
        let mut lines = vec![
            r#"data: {"type":"message_start","message":{"id":"msg_rt","type":"message","role":"assistant","model":"claude-3-5-haiku-20241022"}}"#.to_string(),
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#.to_string(),
        ];
        for chunk in text.as_bytes().chunks(7) {
            let piece = std::str::from_utf8(chunk).unwrap();
            lines.push(format!(
                r#"data: {{"type":"content_block_delta","index":0,"delta":{{"type":"text_delta","text":{}}}}}"#,
                serde_json::to_string(piece).unwrap()
            ));
        }
        lines.push(r#"data: {"type":"content_block_stop","index":0}"#.to_string());
        lines.push(r#"data: {"type":"message_stop"}"#.to_string());

        let message = reduce_sse_body(&lines.join("\n")).unwrap();
        assert_eq!(message["content"][0]["text"], text);
        assert_eq!(message["id"], "msg_rt");
    }

    #[test]
    fn test_tool_use_input_assembled_from_fragments() {
        let body = [
            r#"data: {"type":"message_start","message":{"id":"msg_t","role":"assistant"}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_01","name":"get_weather"}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"city\": "}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"Paris\"}"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
            r#"data: {"type":"message_stop"}"#,
        ]
        .join("\n");

        let message = reduce_sse_body(&body).unwrap();
        let block = &message["content"][0];
        assert_eq!(block["name"], "get_weather");
        assert_eq!(block["input"]["city"], "Paris");
    }

    #[test]
    fn test_mismatched_delta_index_dropped() {
        let body = [
            r#"data: {"type":"message_start","message":{"id":"msg_x","role":"assistant"}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":5,"delta":{"type":"text_delta","text":"STRAY"}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"kept"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
        ]
        .join("\n");

        let message = reduce_sse_body(&body).unwrap();
        assert_eq!(message["content"][0]["text"], "kept");
        assert_eq!(message["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_sparse_indices_padded() {
        let body = [
            r#"data: {"type":"message_start","message":{"id":"msg_s","role":"assistant"}}"#,
            r#"data: {"type":"content_block_start","index":2,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":2,"delta":{"type":"text_delta","text":"third"}}"#,
            r#"data: {"type":"content_block_stop","index":2}"#,
        ]
        .join("\n");

        let message = reduce_sse_body(&body).unwrap();
        let content = message["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0], serde_json::json!({}));
        assert_eq!(content[2]["text"], "third");
    }

    #[test]
    fn test_truncated_stream_returns_partial() {
        // No content_block_stop, no message_stop
        let body = [
            r#"data: {"type":"message_start","message":{"id":"msg_cut","role":"assistant"}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial answ"}}"#,
        ]
        .join("\n");

        let message = reduce_sse_body(&body).unwrap();
        assert_eq!(message["content"][0]["text"], "partial answ");
    }

    #[test]
    fn test_thinking_delta_accumulates() {
        let body = [
            r#"data: {"type":"message_start","message":{"id":"msg_th","role":"assistant"}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm, "}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"yes"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
        ]
        .join("\n");

        let message = reduce_sse_body(&body).unwrap();
        assert_eq!(message["content"][0]["thinking"], "hmm, yes");
    }

    #[test]
    fn test_empty_or_non_sse_input() {
        assert!(reduce_sse_body("").is_none());
        assert!(reduce_sse_body("data: [DONE]").is_none());
        assert!(reduce_sse_body("not sse at all\njust text").is_none());
    }

    #[test]
    fn test_later_usage_overwrites_earlier() {
        let body = [
            r#"data: {"type":"message_start","message":{"id":"m","role":"assistant","usage":{"input_tokens":10,"output_tokens":1}}}"#,
            r#"data: {"type":"message_delta","delta":{},"usage":{"output_tokens":42}}"#,
        ]
        .join("\n");

        let message = reduce_sse_body(&body).unwrap();
        assert_eq!(message["usage"]["input_tokens"], 10);
        assert_eq!(message["usage"]["output_tokens"], 42);
    }

    #[test]
    fn test_is_sse_content_type() {
        assert!(is_sse_content_type("text/event-stream"));
        assert!(is_sse_content_type("text/event-stream; charset=utf-8"));
        assert!(!is_sse_content_type("application/json"));
    }
}
