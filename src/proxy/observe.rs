// Tunnel observability - speculative HTTP reassembly of relayed bytes
//
// Each relay direction owns a MessageAssembler that the loop feeds a copy of
// every chunk it forwards. The assembler is a second, best-effort consumer:
// it tries to recover logical HTTP messages from the byte stream without
// ever delaying or altering the relay. The client->target assembler yields
// requests, the target->client assembler yields responses, and a small
// shared pairing queue matches them up into exchange records.
//
// Keep-alive works: after each recovered message the assembler drains the
// consumed bytes and starts over, so one tunnel can log many exchanges.
// Binary payloads (client-terminated TLS being the normal case) never frame
// a message; after a bounded amount of unframeable bytes the assembler shuts
// itself off and the tunnel is simply not observed.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::logger::{sanitize_headers, ExchangeRecord, Logger};
use crate::sse;
use crate::usage::{extract_usage, ResponseTiming};
use crate::util::{header_value, lossy_body_for_log};

/// Stop buffering a direction after this many bytes without a framed message
const MAX_OBSERVE_BUFFER: usize = 4 * 1024 * 1024;

/// A logical HTTP request recovered from tunnel bytes
#[derive(Debug, Clone)]
pub struct ObservedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Best-effort `model` field from a JSON body; unset is not an error
    pub model: Option<String>,
    pub started_at: DateTime<Utc>,
    pub started_instant: Instant,
}

/// A logical HTTP response recovered from tunnel bytes
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Per-direction accumulator; owned solely by that direction's relay loop
pub struct MessageAssembler {
    buf: Vec<u8>,
    /// Set when the payload is clearly not HTTP; observation stops for good
    dead: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            dead: false,
        }
    }

    /// Append a copy of bytes the relay just forwarded
    pub fn observe(&mut self, chunk: &[u8]) {
        if self.dead {
            return;
        }
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_OBSERVE_BUFFER {
            tracing::debug!("observation buffer limit reached, treating tunnel as opaque");
            self.give_up();
        }
    }

    fn give_up(&mut self) {
        self.dead = true;
        self.buf = Vec::new();
    }

    /// Try to recover one complete request. Drains consumed bytes on success
    /// so the next exchange in a keep-alive tunnel starts clean.
    pub fn try_take_request(&mut self) -> Option<ObservedRequest> {
        let (head_lines, body, consumed) = self.try_frame()?;

        let request_line = head_lines.first()?.clone();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("").to_string();
        if method.is_empty() || path.is_empty() || !request_line.contains("HTTP/") {
            self.give_up();
            return None;
        }

        let headers = parse_header_lines(&head_lines[1..]);
        let model = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from));

        self.buf.drain(..consumed);
        Some(ObservedRequest {
            method,
            path,
            headers,
            body,
            model,
            started_at: Utc::now(),
            started_instant: Instant::now(),
        })
    }

    /// Try to recover one complete response, keyed off the status line
    pub fn try_take_response(&mut self) -> Option<ObservedResponse> {
        let (head_lines, body, consumed) = self.try_frame()?;

        let status_line = head_lines.first()?.clone();
        if !status_line.starts_with("HTTP/") {
            self.give_up();
            return None;
        }
        let status: u16 = match status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()) {
            Some(s) => s,
            None => {
                self.give_up();
                return None;
            }
        };

        let headers = parse_header_lines(&head_lines[1..]);
        self.buf.drain(..consumed);
        Some(ObservedResponse {
            status,
            headers,
            body,
        })
    }

    /// Common framing: full head plus a body satisfying Content-Length.
    /// Returns (header lines, body bytes, total consumed length).
    fn try_frame(&mut self) -> Option<(Vec<String>, Vec<u8>, usize)> {
        if self.dead {
            return None;
        }
        let header_end = self.buf.windows(4).position(|w| w == b"\r\n\r\n")?;

        let head = match std::str::from_utf8(&self.buf[..header_end]) {
            Ok(h) => h,
            Err(_) => {
                // Terminator inside non-text payload: not HTTP
                self.give_up();
                return None;
            }
        };
        let head_lines: Vec<String> = head.split("\r\n").map(String::from).collect();
        let headers = parse_header_lines(&head_lines[1..]);

        let body_start = header_end + 4;
        let length: usize = header_value(&headers, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        // Do not finalize (and never log) a partial body
        if self.buf.len() - body_start < length {
            return None;
        }

        let body = self.buf[body_start..body_start + length].to_vec();
        Some((head_lines, body, body_start + length))
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_header_lines(lines: &[String]) -> Vec<(String, String)> {
    lines
        .iter()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Requests waiting for their response, oldest first. The only state shared
/// between a tunnel's two relay loops; held only long enough to push or pop.
#[derive(Default)]
pub struct ExchangePairing {
    pending: VecDeque<ObservedRequest>,
}

pub type SharedPairing = Arc<Mutex<ExchangePairing>>;

pub fn new_pairing() -> SharedPairing {
    Arc::new(Mutex::new(ExchangePairing::default()))
}

impl ExchangePairing {
    pub fn push_request(&mut self, request: ObservedRequest) {
        self.pending.push_back(request);
    }

    pub fn pop_request(&mut self) -> Option<ObservedRequest> {
        self.pending.pop_front()
    }
}

/// Pair a completed response with its request and hand one record to the
/// logger. The response body goes through the SSE reducer when it is an
/// event stream, so usage extraction sees one logical message either way.
pub fn finalize_exchange(
    request: Option<ObservedRequest>,
    response: &ObservedResponse,
    logger: &Logger,
    max_logged_body: usize,
) {
    let content_type = header_value(&response.headers, "content-type").unwrap_or("");

    let logical_body = if sse::is_sse_content_type(content_type) {
        std::str::from_utf8(&response.body)
            .ok()
            .and_then(sse::reduce_sse_body)
    } else {
        serde_json::from_slice(&response.body).ok()
    };

    let (duration_ms, started_at) = match &request {
        Some(req) => (
            req.started_instant.elapsed().as_millis() as u64,
            req.started_at,
        ),
        None => (0, Utc::now()),
    };

    let mut usage = extract_usage(
        logical_body.as_ref(),
        &response.headers,
        ResponseTiming {
            duration_ms,
            first_byte_ms: None,
        },
    );
    if usage.model.is_none() {
        usage.model = request.as_ref().and_then(|r| r.model.clone());
    }

    let response_body = match &logical_body {
        // Log the reduced logical message for SSE, the raw text otherwise
        Some(body) if sse::is_sse_content_type(content_type) => Some(
            crate::util::truncate_utf8_safe(&body.to_string(), max_logged_body).to_string(),
        ),
        _ if response.body.is_empty() => None,
        _ => Some(lossy_body_for_log(&response.body, max_logged_body)),
    };

    let record = ExchangeRecord {
        timestamp: started_at,
        method: request.as_ref().map(|r| r.method.clone()).unwrap_or_default(),
        path: request.as_ref().map(|r| r.path.clone()).unwrap_or_default(),
        request_headers: request
            .as_ref()
            .map(|r| sanitize_headers(&r.headers))
            .unwrap_or_default(),
        request_body: request.as_ref().and_then(|r| {
            if r.body.is_empty() {
                None
            } else {
                Some(lossy_body_for_log(&r.body, max_logged_body))
            }
        }),
        status: Some(response.status),
        response_headers: response.headers.clone(),
        response_body,
        duration_ms,
        error: None,
        usage: if usage.is_empty() { None } else { Some(usage) },
    };

    logger.record(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG_CAP: usize = 64 * 1024;

    fn http_request(path: &str, body: &str) -> Vec<u8> {
        format!(
            "POST {} HTTP/1.1\r\nHost: api.example.com\r\nContent-Length: {}\r\n\r\n{}",
            path,
            body.len(),
            body
        )
        .into_bytes()
    }

    fn http_response(status: u16, body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_request_recovered_after_full_body() {
        let wire = http_request("/v1/messages", r#"{"model":"claude-3-5-sonnet-20241022"}"#);
        let mut assembler = MessageAssembler::new();

        // Everything but the last body byte: not yet complete
        assembler.observe(&wire[..wire.len() - 1]);
        assert!(assembler.try_take_request().is_none());

        assembler.observe(&wire[wire.len() - 1..]);
        let req = assembler.try_take_request().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/v1/messages");
        assert_eq!(req.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
    }

    #[test]
    fn test_model_unset_for_non_json_body() {
        let wire = http_request("/upload", "not json");
        let mut assembler = MessageAssembler::new();
        assembler.observe(&wire);
        let req = assembler.try_take_request().unwrap();
        assert!(req.model.is_none());
    }

    #[test]
    fn test_response_waits_for_content_length() {
        let wire = http_response(200, r#"{"ok":true}"#);
        let mut assembler = MessageAssembler::new();
        assembler.observe(&wire[..30]);
        assert!(assembler.try_take_response().is_none());
        assembler.observe(&wire[30..]);
        let resp = assembler.try_take_response().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"ok":true}"#);
    }

    #[test]
    fn test_binary_traffic_never_frames() {
        let mut assembler = MessageAssembler::new();
        // TLS-looking garbage, including a stray CRLFCRLF
        let mut junk = vec![0x16, 0x03, 0x01, 0xfa, 0xce];
        junk.extend_from_slice(b"\r\n\r\n");
        junk.extend_from_slice(&[0x99; 64]);
        assembler.observe(&junk);
        assert!(assembler.try_take_request().is_none());

        // Once declared dead, later observation is a no-op
        assembler.observe(b"GET / HTTP/1.1\r\n\r\n");
        assert!(assembler.try_take_request().is_none());
    }

    #[test]
    fn test_two_keepalive_exchanges_produce_two_records() {
        let logger = Logger::in_memory();
        let pairing = new_pairing();
        let mut req_side = MessageAssembler::new();
        let mut resp_side = MessageAssembler::new();

        // First exchange, then a second on the same tunnel
        for (path, body) in [
            ("/v1/messages", r#"{"usage":{"input_tokens":10,"output_tokens":20}}"#),
            ("/v1/complete", r#"{"usage":{"input_tokens":1,"output_tokens":2}}"#),
        ] {
            req_side.observe(&http_request(path, "{}"));
            while let Some(req) = req_side.try_take_request() {
                pairing.lock().unwrap().push_request(req);
            }

            resp_side.observe(&http_response(200, body));
            while let Some(resp) = resp_side.try_take_response() {
                let req = pairing.lock().unwrap().pop_request();
                finalize_exchange(req, &resp, &logger, LOG_CAP);
            }
        }

        let records = logger.recent(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/v1/messages");
        assert_eq!(records[1].path, "/v1/complete");
        assert_eq!(records[0].usage.as_ref().unwrap().total_tokens, 30);
        assert_eq!(records[1].usage.as_ref().unwrap().total_tokens, 3);
    }

    #[test]
    fn test_sse_response_reduced_before_usage_extraction() {
        let logger = Logger::in_memory();
        let sse_body = [
            r#"data: {"type":"message_start","message":{"id":"m1","role":"assistant","model":"claude-3-5-haiku-20241022","usage":{"input_tokens":7}}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
            r#"data: {"type":"content_block_stop","index":0}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
        ]
        .join("\n");
        let wire = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\n\r\n{}",
            sse_body.len(),
            sse_body
        );

        let mut assembler = MessageAssembler::new();
        assembler.observe(wire.as_bytes());
        let resp = assembler.try_take_response().unwrap();
        finalize_exchange(None, &resp, &logger, LOG_CAP);

        let records = logger.recent(1);
        let usage = records[0].usage.as_ref().unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.model.as_deref(), Some("claude-3-5-haiku-20241022"));
    }

    #[test]
    fn test_request_credentials_sanitized_in_record() {
        let logger = Logger::in_memory();
        let wire = format!(
            "POST /v1/messages HTTP/1.1\r\nAuthorization: Bearer sk-live-secret\r\nContent-Length: 2\r\n\r\n{{}}"
        );
        let mut req_side = MessageAssembler::new();
        req_side.observe(wire.as_bytes());
        let req = req_side.try_take_request().unwrap();

        let mut resp_side = MessageAssembler::new();
        resp_side.observe(&http_response(200, "{}"));
        let resp = resp_side.try_take_response().unwrap();

        finalize_exchange(Some(req), &resp, &logger, LOG_CAP);
        let records = logger.recent(1);
        let auth = &records[0]
            .request_headers
            .iter()
            .find(|(k, _)| k == "Authorization")
            .unwrap()
            .1;
        assert!(auth.starts_with("sha256:"));
    }
}
