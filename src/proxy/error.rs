//! Client-visible failure taxonomy and minimal error responses
//!
//! Every failure a client can observe is delivered the same way: a bare
//! status line, `text/plain` body, `Connection: close`, then the socket is
//! closed. Nothing is retried at this layer.

use tokio::io::AsyncWriteExt;

/// Ways a proxied exchange can fail before or instead of a real response
#[derive(Debug)]
pub enum ProxyFailure {
    /// Bad request line or headers - answered 400, never logged
    MalformedRequest,
    /// CONNECT line without a parseable host:port - 400, never logged
    NoTargetHost,
    /// TCP dial to a CONNECT target failed - 502, logged
    UpstreamConnectFailure(String),
    /// The forwarded upstream call failed - 502, logged
    UpstreamCallFailure(String),
    /// Could not obtain a bearer token - 502, logged
    CredentialFetchFailure(String),
    /// The rebuilt upstream URL was unusable - 502, logged
    InvalidTargetUrl(String),
}

impl ProxyFailure {
    pub fn status(&self) -> u16 {
        match self {
            ProxyFailure::MalformedRequest | ProxyFailure::NoTargetHost => 400,
            _ => 502,
        }
    }

    /// Body text shown to the client and recorded in the exchange log
    pub fn message(&self) -> String {
        match self {
            ProxyFailure::MalformedRequest => "malformed request".to_string(),
            ProxyFailure::NoTargetHost => "no target host".to_string(),
            ProxyFailure::UpstreamConnectFailure(e) => format!("upstream connect failed: {}", e),
            ProxyFailure::UpstreamCallFailure(e) => format!("upstream call failed: {}", e),
            ProxyFailure::CredentialFetchFailure(_) => "failed to authenticate".to_string(),
            ProxyFailure::InvalidTargetUrl(e) => format!("invalid target url: {}", e),
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// Write a minimal `status + text/plain + Connection: close` response.
/// The flush guarantees the final bytes leave before the caller closes.
pub async fn write_simple_response<W>(writer: &mut W, status: u16, body: &str) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Deliver a failure to the client
pub async fn write_failure<W>(writer: &mut W, failure: &ProxyFailure) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let status = failure.status();
    let message = failure.message();
    tracing::error!("proxy failure: {} - {}", status, message);
    write_simple_response(writer, status, &message).await
}
