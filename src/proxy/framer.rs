// Message framer - incremental HTTP/1.1 request framing over partial reads
//
// Socket reads arrive in arbitrary chunks; the framer buffers them and
// decides when one complete request is available:
//
// - Nothing is parsed until the header terminator (\r\n\r\n) is buffered.
// - A CONNECT request line is complete the moment headers are (no body).
// - With a Content-Length header, the request completes once that many body
//   bytes follow the terminator, and not one byte before.
// - Without one, GET/DELETE complete immediately; other methods wait for
//   EOF. Chunked request bodies are not handled - a known limitation.
// - EOF with a non-empty partial buffer parses what was received.

use crate::util::header_value;

/// A framed HTTP/1.1 request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    /// Origin-form path or absolute URI; CONNECT carries host:port here
    pub target: String,
    pub version: String,
    /// Ordered, duplicates preserved; lookups are last-wins
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// Why a buffer could not be framed. Distinguishes the two client-visible
/// failure codes; neither case reaches the exchange log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Header bytes are not valid UTF-8 - answered with 500
    InvalidEncoding,
    /// Request line has no method or no target - answered with 400
    InvalidRequestLine,
}

/// Incremental framer; one per connection, reset-free (a connection frames
/// at most one request before it is dispatched)
#[derive(Default)]
pub struct RequestFramer {
    buf: Vec<u8>,
}

impl RequestFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one socket read's worth of bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Check whether a complete request is buffered. `Ok(None)` means keep
    /// reading.
    pub fn try_complete(&self) -> Result<Option<InboundRequest>, FrameError> {
        let Some(header_end) = find_terminator(&self.buf) else {
            return Ok(None);
        };

        let request = parse_head(&self.buf[..header_end])?;
        let body_start = header_end + 4;

        // CONNECT has no body; hand off immediately
        if request.method == "CONNECT" {
            return Ok(Some(request));
        }

        let available = self.buf.len() - body_start;
        match declared_content_length(&request.headers) {
            Some(length) => {
                if available >= length {
                    let mut request = request;
                    request.body = self.buf[body_start..body_start + length].to_vec();
                    Ok(Some(request))
                } else {
                    Ok(None)
                }
            }
            None => {
                // Heuristic for bodyless methods; anything else waits for EOF
                if request.method == "GET" || request.method == "DELETE" {
                    let mut request = request;
                    request.body = self.buf[body_start..].to_vec();
                    Ok(Some(request))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// The connection hit EOF. A non-empty partial buffer is processed with
    /// whatever body bytes arrived; an empty buffer is simply a closed
    /// connection.
    pub fn complete_at_eof(&self) -> Result<Option<InboundRequest>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        match find_terminator(&self.buf) {
            Some(header_end) => {
                let mut request = parse_head(&self.buf[..header_end])?;
                if request.method != "CONNECT" {
                    let body_start = header_end + 4;
                    let mut body = self.buf[body_start..].to_vec();
                    // Never hand over more than the declared length
                    if let Some(length) = declared_content_length(&request.headers) {
                        body.truncate(length);
                    }
                    request.body = body;
                }
                Ok(Some(request))
            }
            // Terminator never arrived; try the buffer as a bare head
            None => parse_head(&self.buf).map(Some),
        }
    }
}

/// Locate the header terminator, returning the offset of `\r\n\r\n`
fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse request line + headers from the bytes before the terminator
fn parse_head(head: &[u8]) -> Result<InboundRequest, FrameError> {
    let text = std::str::from_utf8(head).map_err(|_| FrameError::InvalidEncoding)?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();

    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    if method.is_empty() || target.is_empty() {
        return Err(FrameError::InvalidRequestLine);
    }

    // Split each header at the first colon, trim both sides, keep order
    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(InboundRequest {
        method,
        target,
        version,
        headers,
        body: Vec::new(),
    })
}

fn declared_content_length(headers: &[(String, String)]) -> Option<usize> {
    header_value(headers, "content-length").and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Result<Option<InboundRequest>, FrameError> {
        let mut framer = RequestFramer::new();
        framer.push(bytes);
        framer.try_complete()
    }

    #[test]
    fn test_incomplete_headers_need_more() {
        assert!(frame(b"POST /v1/messages HTTP/1.1\r\nHost: api").unwrap().is_none());
    }

    #[test]
    fn test_connect_complete_without_body() {
        let req = frame(b"CONNECT api.anthropic.com:443 HTTP/1.1\r\nHost: api.anthropic.com:443\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.is_connect());
        assert_eq!(req.target, "api.anthropic.com:443");
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_content_length_completion_is_exact() {
        let head = b"POST /v1/messages HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut framer = RequestFramer::new();
        framer.push(head);
        framer.push(b"hell");
        // One byte short of the declared length: not complete
        assert!(framer.try_complete().unwrap().is_none());

        framer.push(b"o");
        let req = framer.try_complete().unwrap().unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn test_body_split_across_many_chunks() {
        let wire = b"POST /x HTTP/1.1\r\ncontent-length: 12\r\n\r\nhello world!";
        let mut framer = RequestFramer::new();
        for chunk in wire.chunks(3) {
            framer.push(chunk);
        }
        let req = framer.try_complete().unwrap().unwrap();
        assert_eq!(req.body, b"hello world!");
    }

    #[test]
    fn test_get_without_content_length_completes() {
        let req = frame(b"GET /api/models HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_post_without_content_length_waits_for_eof() {
        let wire = b"POST /v1/messages HTTP/1.1\r\nHost: example.com\r\n\r\npartial body";
        let mut framer = RequestFramer::new();
        framer.push(wire);
        assert!(framer.try_complete().unwrap().is_none());

        let req = framer.complete_at_eof().unwrap().unwrap();
        assert_eq!(req.body, b"partial body");
    }

    #[test]
    fn test_eof_with_partial_headers_parses_request_line() {
        let mut framer = RequestFramer::new();
        framer.push(b"GET /health HTTP/1.1\r\nHost: x");
        let req = framer.complete_at_eof().unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/health");
    }

    #[test]
    fn test_eof_with_empty_buffer_is_nothing() {
        let framer = RequestFramer::new();
        assert!(framer.complete_at_eof().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_headers_last_wins() {
        let req = frame(
            b"GET / HTTP/1.1\r\nX-Trace: first\r\nx-trace: second\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.header("x-trace"), Some("second"));
    }

    #[test]
    fn test_header_whitespace_trimmed() {
        let req = frame(b"GET / HTTP/1.1\r\n  Accept :  text/html  \r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.header("accept"), Some("text/html"));
    }

    #[test]
    fn test_non_utf8_headers_rejected() {
        let mut wire = b"GET / HTTP/1.1\r\nX-Bin: ".to_vec();
        wire.extend_from_slice(&[0xff, 0xfe]);
        wire.extend_from_slice(b"\r\n\r\n");
        assert_eq!(frame(&wire).unwrap_err(), FrameError::InvalidEncoding);
    }

    #[test]
    fn test_missing_target_rejected() {
        assert_eq!(
            frame(b"GET\r\n\r\n").unwrap_err(),
            FrameError::InvalidRequestLine
        );
    }

    #[test]
    fn test_eof_body_capped_at_declared_length() {
        // Pipelined extra bytes past Content-Length are not part of the body
        let mut framer = RequestFramer::new();
        framer.push(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nokEXTRA");
        let req = framer.try_complete().unwrap().unwrap();
        assert_eq!(req.body, b"ok");
    }
}
