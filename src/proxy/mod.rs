// Proxy core - accept loop and per-connection dispatch
//
// One listener, one spawned task per accepted connection. Each connection
// frames at most one request (the proxy is close-delimited on the client
// side), then dispatches: CONNECT requests become tunnels, everything else
// is forwarded upstream. Framing failures answer the client directly and
// are deliberately absent from the exchange log.

pub mod error;
pub mod forwarder;
pub mod framer;
pub mod observe;
pub mod tunnel;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::logger::Logger;
use error::{write_failure, write_simple_response, ProxyFailure};
use forwarder::Forwarder;
use framer::{FrameError, RequestFramer};

/// Socket read size while framing the inbound request
const READ_CHUNK: usize = 8 * 1024;

pub struct ProxyServer {
    bind_addr: String,
    forwarder: Arc<Forwarder>,
    logger: Logger,
    max_logged_body: usize,
}

impl ProxyServer {
    pub fn new(
        bind_addr: String,
        forwarder: Arc<Forwarder>,
        logger: Logger,
        max_logged_body: usize,
    ) -> Self {
        Self {
            bind_addr,
            forwarder,
            logger,
            max_logged_body,
        }
    }

    /// Accept connections until the shutdown signal fires
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        tracing::info!("Proxy listening on {}", self.bind_addr);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Proxy shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "connection accepted");

                    let forwarder = self.forwarder.clone();
                    let logger = self.logger.clone();
                    let max_logged_body = self.max_logged_body;
                    tokio::spawn(async move {
                        handle_connection(socket, forwarder, logger, max_logged_body).await;
                    });
                }
            }
        }

        Ok(())
    }
}

/// Frame one request off the socket, then dispatch it
async fn handle_connection(
    mut socket: TcpStream,
    forwarder: Arc<Forwarder>,
    logger: Logger,
    max_logged_body: usize,
) {
    let mut framer = RequestFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let framed = loop {
        let n = match socket.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("client read failed: {}", e);
                return;
            }
        };
        if n == 0 {
            break framer.complete_at_eof();
        }
        framer.push(&buf[..n]);

        match framer.try_complete() {
            Ok(Some(request)) => break Ok(Some(request)),
            Ok(None) => continue,
            Err(e) => break Err(e),
        }
    };

    let request = match framed {
        Ok(Some(request)) => request,
        // Clean EOF with nothing buffered: the client changed its mind
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("unframeable request: {:?}", e);
            match e {
                // Undecodable bytes are our failure to parse, not the
                // client's failure to speak HTTP
                FrameError::InvalidEncoding => {
                    let _ =
                        write_simple_response(&mut socket, 500, "invalid header encoding").await;
                }
                FrameError::InvalidRequestLine => {
                    let _ = write_failure(&mut socket, &ProxyFailure::MalformedRequest).await;
                }
            }
            return;
        }
    };

    if request.is_connect() {
        if let Err(e) = tunnel::run_tunnel(socket, &request, logger, max_logged_body).await {
            tracing::warn!("tunnel error: {:?}", e);
        }
    } else {
        forwarder.handle(socket, request).await;
    }
}
