//! Bidirectional byte relay with half-close propagation.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to backend, including the replayed peek buffer.
    pub to_backend: u64,
    /// Backend to client.
    pub to_client: u64,
}

/// Relays bytes between a client and a backend.
pub struct Relay;

impl Relay {
    /// Replays `peeked` to the backend, then copies both directions
    /// concurrently until each has reached end-of-stream.
    ///
    /// When a direction's source ends, only the write side of its
    /// destination is shut down, so the other direction keeps flowing.
    /// Both streams are dropped, and therefore fully closed, once both
    /// directions have finished. An error in one direction ends that
    /// direction only and is reported after the other one completes.
    pub async fn run<C, B>(client: C, backend: B, peeked: Vec<u8>) -> Result<RelayStats, RelayError>
    where
        C: AsyncRead + AsyncWrite,
        B: AsyncRead + AsyncWrite,
    {
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

        let to_backend = async {
            let result = match backend_wr.write_all(&peeked).await {
                Ok(()) => tokio::io::copy(&mut client_rd, &mut backend_wr)
                    .await
                    .map(|n| n + peeked.len() as u64),
                Err(e) => Err(e),
            };
            let _ = backend_wr.shutdown().await;
            result
        };

        let to_client = async {
            let result = tokio::io::copy(&mut backend_rd, &mut client_wr).await;
            let _ = client_wr.shutdown().await;
            result
        };

        let (to_backend, to_client) = tokio::join!(to_backend, to_client);

        let stats = RelayStats {
            to_backend: to_backend.map_err(RelayError::ToBackend)?,
            to_client: to_client.map_err(RelayError::ToClient)?,
        };

        debug!(
            "relay closed: {} bytes client->backend, {} bytes backend->client",
            stats.to_backend, stats.to_client
        );

        Ok(stats)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("client to backend copy failed: {0}")]
    ToBackend(#[source] io::Error),
    #[error("backend to client copy failed: {0}")]
    ToClient(#[source] io::Error),
}
