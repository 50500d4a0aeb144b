// CONNECT tunnels - raw byte relay with passive observation
//
// A CONNECT request turns the client connection into an opaque pipe to the
// requested host:port. The proxy dials the target, answers
// `200 Connection Established`, then relays bytes both ways until either
// side closes. Relaying never inspects, delays, or rewrites traffic; a copy
// of every chunk is handed to the per-direction assemblers in `observe`,
// which log whatever plaintext HTTP they manage to reassemble.
//
// TLS handshakes pass through untouched. The proxy never terminates TLS, so
// tunneled HTTPS simply shows up as an unobserved tunnel.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::logger::{sanitize_headers, ExchangeRecord, Logger};
use crate::proxy::error::{write_failure, ProxyFailure};
use crate::proxy::framer::InboundRequest;
use crate::proxy::observe::{finalize_exchange, new_pairing, MessageAssembler, SharedPairing};

/// Relay read size; one read's worth is also the observation granularity
const RELAY_CHUNK: usize = 16 * 1024;

/// Tunnel lifecycle, in order. Only for tracing; the flow itself is linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    AwaitingTarget,
    Connecting,
    Established,
    Relaying,
    Closed,
    Failed,
}

/// Pull `host:port` out of a CONNECT target. The port must be an explicit
/// valid u16; CONNECT has no default port.
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

/// Serve one CONNECT request to completion. Consumes the client socket;
/// when this returns the tunnel is down and both sockets are closed.
pub async fn run_tunnel(
    mut client: TcpStream,
    request: &InboundRequest,
    logger: Logger,
    max_logged_body: usize,
) -> Result<()> {
    tracing::debug!(target = %request.target, state = ?TunnelState::AwaitingTarget, "tunnel");
    let Some((host, port)) = parse_connect_target(&request.target) else {
        write_failure(&mut client, &ProxyFailure::NoTargetHost).await?;
        return Ok(());
    };

    tracing::debug!(target = %request.target, state = ?TunnelState::Connecting, "tunnel");
    let target = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            let failure = ProxyFailure::UpstreamConnectFailure(e.to_string());
            logger.record(dial_failure_record(request, &failure));
            write_failure(&mut client, &failure).await?;
            tracing::debug!(target = %request.target, state = ?TunnelState::Failed, "tunnel");
            return Ok(());
        }
    };

    write_simple_response_established(&mut client).await?;
    tracing::debug!(target = %request.target, state = ?TunnelState::Established, "tunnel");

    let pairing = new_pairing();
    let (client_read, client_write) = client.into_split();
    let (target_read, target_write) = target.into_split();

    tracing::debug!(target = %request.target, state = ?TunnelState::Relaying, "tunnel");
    let upstream = relay_client_to_target(client_read, target_write, pairing.clone());
    let downstream =
        relay_target_to_client(target_read, client_write, pairing, logger, max_logged_body);

    // Both directions run until their read side ends; each shuts down its
    // peer writer on the way out, which unblocks the other loop.
    let _ = tokio::join!(upstream, downstream);
    tracing::debug!(target = %request.target, state = ?TunnelState::Closed, "tunnel");
    Ok(())
}

/// `200 Connection Established` carries no headers and no body
async fn write_simple_response_established(client: &mut TcpStream) -> std::io::Result<()> {
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await
}

async fn relay_client_to_target(
    mut read: tokio::net::tcp::OwnedReadHalf,
    mut write: tokio::net::tcp::OwnedWriteHalf,
    pairing: SharedPairing,
) {
    let mut assembler = MessageAssembler::new();
    let mut buf = vec![0u8; RELAY_CHUNK];

    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if write.write_all(&buf[..n]).await.is_err() {
            break;
        }

        assembler.observe(&buf[..n]);
        while let Some(req) = assembler.try_take_request() {
            pairing.lock().unwrap().push_request(req);
        }
    }

    // Cascade the close to the target
    let _ = write.shutdown().await;
}

async fn relay_target_to_client(
    mut read: tokio::net::tcp::OwnedReadHalf,
    mut write: tokio::net::tcp::OwnedWriteHalf,
    pairing: SharedPairing,
    logger: Logger,
    max_logged_body: usize,
) {
    let mut assembler = MessageAssembler::new();
    let mut buf = vec![0u8; RELAY_CHUNK];

    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if write.write_all(&buf[..n]).await.is_err() {
            break;
        }

        assembler.observe(&buf[..n]);
        while let Some(resp) = assembler.try_take_response() {
            let req = pairing.lock().unwrap().pop_request();
            finalize_exchange(req, &resp, &logger, max_logged_body);
        }
    }

    let _ = write.shutdown().await;
}

/// A tunnel that never came up still gets its one exchange record,
/// carrying the synthesized status the client was answered with
fn dial_failure_record(request: &InboundRequest, failure: &ProxyFailure) -> ExchangeRecord {
    ExchangeRecord {
        timestamp: chrono::Utc::now(),
        method: request.method.clone(),
        path: request.target.clone(),
        request_headers: sanitize_headers(&request.headers),
        request_body: None,
        status: Some(failure.status()),
        response_headers: Vec::new(),
        response_body: None,
        duration_ms: 0,
        error: Some(failure.message()),
        usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_until_blank_line(sock: &mut TcpStream) {
        let mut seen = Vec::new();
        let mut byte = [0u8; 1];
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            sock.read_exact(&mut byte).await.unwrap();
            seen.push(byte[0]);
        }
    }

    #[test]
    fn test_target_with_port() {
        assert_eq!(
            parse_connect_target("api.anthropic.com:443"),
            Some(("api.anthropic.com".to_string(), 443))
        );
    }

    #[test]
    fn test_target_requires_port() {
        assert_eq!(parse_connect_target("api.anthropic.com"), None);
    }

    #[test]
    fn test_target_rejects_bad_port() {
        assert_eq!(parse_connect_target("host:notaport"), None);
        assert_eq!(parse_connect_target("host:99999"), None);
        assert_eq!(parse_connect_target(":443"), None);
    }

    #[tokio::test]
    async fn test_tunnel_relays_and_observes() {
        use tokio::net::TcpListener;

        // Stand-in origin that frames one request and answers it
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut seen = Vec::new();
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let body = r#"{"usage":{"input_tokens":3,"output_tokens":4}}"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
        });

        // Proxy side listener: accept one client and run the tunnel for it
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let logger = Logger::in_memory();
        let tunnel_logger = logger.clone();
        let connect = InboundRequest {
            method: "CONNECT".to_string(),
            target: origin_addr.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        tokio::spawn(async move {
            let (sock, _) = proxy.accept().await.unwrap();
            run_tunnel(sock, &connect, tunnel_logger, 64 * 1024)
                .await
                .unwrap();
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        read_until_blank_line(&mut client).await; // 200 Connection Established
        client
            .write_all(b"GET /v1/models HTTP/1.1\r\nHost: origin\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("input_tokens"));

        // The relay also produced one observed exchange
        let records = logger.recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].path, "/v1/models");
        assert_eq!(records[0].usage.as_ref().unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn test_dial_failure_answers_502_and_logs() {
        use tokio::net::TcpListener;

        // Grab a port and close it so the dial is refused
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        let logger = Logger::in_memory();
        let tunnel_logger = logger.clone();
        let connect = InboundRequest {
            method: "CONNECT".to_string(),
            target: dead_addr.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        tokio::spawn(async move {
            let (sock, _) = proxy.accept().await.unwrap();
            run_tunnel(sock, &connect, tunnel_logger, 64 * 1024)
                .await
                .unwrap();
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 502 "));

        let records = logger.recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "CONNECT");
        assert_eq!(records[0].status, Some(502));
        assert!(records[0].error.is_some());
        assert!(records[0].usage.is_none());
    }
}
