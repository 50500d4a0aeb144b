// Upstream forwarder - plain (non-CONNECT) requests re-sent over reqwest
//
// A framed inbound request is rebuilt against the configured upstream,
// stripped of hop and credential headers, authenticated with a cached bearer
// token, and sent. Two response paths:
//
// - regular: the whole upstream body is buffered, then handed to the client
//   in one write and the connection closed
// - streaming (request body carries "stream": true): the head goes out as
//   soon as the upstream answers, every chunk is forwarded the moment it
//   arrives, and a bounded copy accumulates for post-stream reduction
//
// Either way the exchange produces exactly one log record, errors included.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::auth::CredentialCache;
use crate::logger::{sanitize_headers, ExchangeRecord, Logger};
use crate::proxy::error::{write_failure, ProxyFailure};
use crate::proxy::framer::InboundRequest;
use crate::sse;
use crate::usage::{extract_usage, ResponseTiming, UsageRecord};
use crate::util::{lossy_body_for_log, truncate_utf8_safe};

/// Cap on the copy of a streamed body kept for reduction; forwarding itself
/// is never capped
const MAX_STREAM_ACCUMULATE: usize = 8 * 1024 * 1024;

/// Inbound headers that must not be copied upstream. Host and Connection are
/// hop-scoped; the client's Authorization is replaced by our own token; the
/// framing headers are recomputed by reqwest for the rebuilt body.
const SKIP_FORWARD_HEADERS: &[&str] = &[
    "host",
    "connection",
    "authorization",
    "proxy-authorization",
    "content-length",
    "transfer-encoding",
];

pub struct Forwarder {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialCache>,
    logger: Logger,
    max_logged_body: usize,
}

impl Forwarder {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        credentials: Arc<CredentialCache>,
        logger: Logger,
        max_logged_body: usize,
    ) -> Self {
        Self {
            http,
            base_url,
            credentials,
            logger,
            max_logged_body,
        }
    }

    /// Forward one framed request and answer the client. Consumes the socket;
    /// the connection always closes when this returns.
    pub async fn handle(&self, mut client: TcpStream, request: InboundRequest) {
        let started_at = chrono::Utc::now();
        let started = Instant::now();

        let outcome = self.forward(&mut client, &request, started).await;

        match outcome {
            Ok(done) => {
                self.logger.record(ExchangeRecord {
                    timestamp: started_at,
                    method: request.method.clone(),
                    path: request.target.clone(),
                    request_headers: sanitize_headers(&request.headers),
                    request_body: logged_body(&request.body, self.max_logged_body),
                    status: Some(done.status),
                    response_headers: done.headers,
                    response_body: done.body,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: done.error,
                    usage: if done.usage.is_empty() {
                        None
                    } else {
                        Some(done.usage)
                    },
                });
            }
            Err(failure) => {
                // The client still gets an answer, and the exchange is logged
                let _ = write_failure(&mut client, &failure).await;
                self.logger.record(ExchangeRecord {
                    timestamp: started_at,
                    method: request.method.clone(),
                    path: request.target.clone(),
                    request_headers: sanitize_headers(&request.headers),
                    request_body: logged_body(&request.body, self.max_logged_body),
                    status: Some(failure.status()),
                    response_headers: Vec::new(),
                    response_body: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(failure.message()),
                    usage: None,
                });
            }
        }

        let _ = client.shutdown().await;
    }

    async fn forward(
        &self,
        client: &mut TcpStream,
        request: &InboundRequest,
        started: Instant,
    ) -> Result<CompletedResponse, ProxyFailure> {
        let token = self
            .credentials
            .token()
            .await
            .map_err(|e| ProxyFailure::CredentialFetchFailure(e.to_string()))?;

        let url = build_upstream_url(&self.base_url, &request.target);
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProxyFailure::InvalidTargetUrl(request.method.clone()))?;

        let mut upstream = self
            .http
            .request(method, &url)
            .bearer_auth(&token)
            .body(request.body.clone());
        for (name, value) in forwardable_headers(&request.headers) {
            upstream = upstream.header(name, value);
        }

        let response = upstream
            .send()
            .await
            .map_err(|e| ProxyFailure::UpstreamCallFailure(e.to_string()))?;

        if wants_stream(&request.body) {
            self.relay_streaming(client, response, started).await
        } else {
            self.relay_buffered(client, response).await
        }
    }

    /// Regular path: buffer everything, answer in one send. A failed write
    /// to the client is not an upstream failure: the exchange is recorded
    /// as it happened, with the client-side error noted, and no second
    /// response is attempted on the dead socket.
    async fn relay_buffered(
        &self,
        client: &mut TcpStream,
        response: reqwest::Response,
    ) -> Result<CompletedResponse, ProxyFailure> {
        let status = response.status();
        let headers = collect_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyFailure::UpstreamCallFailure(e.to_string()))?;

        let head = response_head(status, &headers, Some(body.len()));
        let write_result = async {
            client.write_all(head.as_bytes()).await?;
            client.write_all(&body).await?;
            client.flush().await
        }
        .await;
        let error = write_result.err().map(|e| {
            tracing::debug!("client write failed: {}", e);
            format!("client write failed: {}", e)
        });

        let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        let usage = extract_usage(parsed.as_ref(), &headers, ResponseTiming::default());

        Ok(CompletedResponse {
            status: status.as_u16(),
            headers,
            body: logged_body(&body, self.max_logged_body),
            usage,
            error,
        })
    }

    /// Streaming path: forward chunks as they arrive, reduce afterwards
    async fn relay_streaming(
        &self,
        client: &mut TcpStream,
        response: reqwest::Response,
        started: Instant,
    ) -> Result<CompletedResponse, ProxyFailure> {
        let status = response.status();
        let headers = collect_headers(&response);

        // Close-delimited: no Content-Length on the head we write
        let head = response_head(status, &headers, None);
        if let Err(e) = client.write_all(head.as_bytes()).await {
            tracing::debug!("client write failed: {}", e);
            let usage = extract_usage(None, &headers, ResponseTiming::default());
            return Ok(CompletedResponse {
                status: status.as_u16(),
                headers,
                body: None,
                usage,
                error: Some(format!("client write failed: {}", e)),
            });
        }

        let mut stream = response.bytes_stream();
        let mut accumulated: Vec<u8> = Vec::new();
        let mut first_byte_ms: Option<u64> = None;
        let mut error: Option<String> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Mid-stream upstream failure: the head is already out,
                    // so just stop; the close tells the client
                    tracing::warn!("upstream stream ended early: {}", e);
                    error = Some(format!("upstream stream ended early: {}", e));
                    break;
                }
            };
            if first_byte_ms.is_none() {
                first_byte_ms = Some(started.elapsed().as_millis() as u64);
            }
            if let Err(e) = client.write_all(&chunk).await {
                tracing::debug!("client went away mid-stream: {}", e);
                error = Some(format!("client write failed: {}", e));
                break;
            }
            let _ = client.flush().await;
            if accumulated.len() < MAX_STREAM_ACCUMULATE {
                accumulated.extend_from_slice(&chunk);
            }
        }

        let content_type = crate::util::header_value(&headers, "content-type").unwrap_or("");
        let reduced = if sse::is_sse_content_type(content_type) {
            std::str::from_utf8(&accumulated)
                .ok()
                .and_then(sse::reduce_sse_body)
        } else {
            serde_json::from_slice(&accumulated).ok()
        };

        let timing = ResponseTiming {
            duration_ms: started.elapsed().as_millis() as u64,
            first_byte_ms,
        };
        let usage = extract_usage(reduced.as_ref(), &headers, timing);

        let body = match &reduced {
            Some(message) => Some(
                truncate_utf8_safe(&message.to_string(), self.max_logged_body).to_string(),
            ),
            None => logged_body(&accumulated, self.max_logged_body),
        };

        Ok(CompletedResponse {
            status: status.as_u16(),
            headers,
            body,
            usage,
            error,
        })
    }
}

struct CompletedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<String>,
    usage: UsageRecord,
    /// Set when the upstream answered but delivery to the client broke
    error: Option<String>,
}

/// Absolute-URI targets pass through; origin-form targets join the base,
/// query string and all
pub fn build_upstream_url(base: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    format!("{}{}", base.trim_end_matches('/'), target)
}

/// Inbound headers minus the ones the proxy owns
pub fn forwardable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_lowercase();
            !SKIP_FORWARD_HEADERS.contains(&lower.as_str())
        })
        .cloned()
        .collect()
}

/// A request asks for streaming via `"stream": true` in its JSON body.
/// Anything unparseable means a regular exchange.
pub fn wants_stream(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

fn collect_headers(response: &reqwest::Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

/// Serialize a response head for the client. Framing headers are ours:
/// either an exact Content-Length (buffered) or close-delimited (streaming).
fn response_head(
    status: reqwest::StatusCode,
    headers: &[(String, String)],
    content_length: Option<usize>,
) -> String {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" || lower == "connection" {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if let Some(length) = content_length {
        head.push_str(&format!("Content-Length: {}\r\n", length));
    }
    head.push_str("Connection: close\r\n\r\n");
    head
}

fn logged_body(body: &[u8], cap: usize) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(lossy_body_for_log(body, cap))
    }
}
