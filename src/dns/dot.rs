//! DNS-over-TLS front-end (RFC 7858 framing).
//!
//! One length-prefixed query is answered per connection, after which the
//! connection is closed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::resolver::{QueryResolver, ResolveError};
use crate::ratelimit::AdmissionGate;

/// Reads one 2-byte big-endian length prefix and exactly that many bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = reader.read_u16().await.map_err(FrameError::Read)?;
    let mut payload = vec![0u8; usize::from(len)];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(FrameError::Read)?;
    Ok(payload)
}

/// Writes `payload` behind its 2-byte big-endian length and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::Oversized(payload.len()))?;

    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await.map_err(FrameError::Write)?;
    writer.flush().await.map_err(FrameError::Write)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to read DNS frame: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write DNS frame: {0}")]
    Write(#[source] io::Error),
    #[error("DNS message of {0} bytes does not fit a 16-bit length prefix")]
    Oversized(usize),
}

/// The DoT server.
pub struct DotServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    resolver: Arc<QueryResolver>,
    gate: Arc<AdmissionGate>,
    /// Bounds handshake, query read, resolution and reply together.
    exchange_timeout: Duration,
}

impl DotServer {
    pub async fn bind(
        addr: SocketAddr,
        tls_config: Arc<ServerConfig>,
        resolver: Arc<QueryResolver>,
        gate: Arc<AdmissionGate>,
        exchange_timeout: Duration,
    ) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("DoT server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls_config),
            resolver,
            gate,
            exchange_timeout,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Runs the server, accepting connections forever.
    pub async fn run(self) -> Result<(), io::Error> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("DoT accept error: {}", e);
                    continue;
                }
            };

            // Checked before the handshake so denied clients cost nothing.
            if !self.gate.allow() {
                debug!("DoT connection from {} rate limited", peer_addr);
                continue;
            }

            let acceptor = self.acceptor.clone();
            let resolver = Arc::clone(&self.resolver);
            let deadline = self.exchange_timeout;
            tokio::spawn(async move {
                let exchange = handle_connection(stream, acceptor, &resolver);
                match timeout(deadline, exchange).await {
                    Ok(Ok(())) => debug!("answered DoT query from {}", peer_addr),
                    Ok(Err(e)) => warn!("DoT error from {}: {}", peer_addr, e),
                    Err(_) => warn!("DoT exchange with {} timed out", peer_addr),
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    resolver: &QueryResolver,
) -> Result<(), DotError> {
    let mut tls = acceptor.accept(stream).await.map_err(DotError::Handshake)?;

    let query = read_frame(&mut tls).await?;
    let answer = resolver.resolve(&query).await?;
    write_frame(&mut tls, &answer).await?;

    // close_notify; the peer may already be gone.
    let _ = tls.shutdown().await;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum DotError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}
