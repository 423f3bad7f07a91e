//! SNI routing front-end.
//!
//! Accepts plain TCP, reads the TLS ClientHello without answering it,
//! picks a backend from the requested name and relays the raw stream.
//! This path is not subject to the DNS front-ends' rate limiter.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::relay::{Relay, RelayError};
use super::sniff::{SniffError, sniff_client_hello};
use crate::config::NodeConfig;

/// Port used for every backend other than the node itself.
const TLS_PORT: u16 = 443;

/// Routing and timeout settings for the SNI router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// The node's own host name, compared case-insensitively with SNI.
    pub self_host: String,
    /// Where the node's own TLS backend listens.
    pub self_backend: SocketAddr,
    /// Deadline for receiving a complete ClientHello.
    pub sniff_timeout: Duration,
    /// Deadline for connecting to the chosen backend.
    pub connect_timeout: Duration,
}

impl RouterConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        Self {
            self_host: config.host.to_ascii_lowercase(),
            self_backend: SocketAddr::from(([127, 0, 0, 1], config.self_backend_port)),
            sniff_timeout: config.sniff_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Chooses the backend for a requested server name.
    pub fn select_backend(&self, server_name: &str) -> Backend {
        let name = server_name.to_ascii_lowercase();
        if name == self.self_host {
            Backend::Local(self.self_backend)
        } else {
            Backend::Remote(name, TLS_PORT)
        }
    }
}

/// A backend chosen for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// The node's own TLS terminator.
    Local(SocketAddr),
    /// Any other host, resolved through outbound DNS.
    Remote(String, u16),
}

impl Backend {
    async fn connect(&self) -> io::Result<TcpStream> {
        match self {
            Backend::Local(addr) => TcpStream::connect(addr).await,
            Backend::Remote(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local(addr) => write!(f, "{}", addr),
            Backend::Remote(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// The SNI routing server.
pub struct SniRouter {
    config: Arc<RouterConfig>,
    listener: TcpListener,
}

impl SniRouter {
    pub async fn bind(addr: SocketAddr, config: RouterConfig) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("SNI router listening on {}", listener.local_addr()?);

        Ok(Self {
            config: Arc::new(config),
            listener,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Runs the router, accepting connections forever.
    pub async fn run(self) -> Result<(), io::Error> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("SNI router accept error: {}", e);
                    continue;
                }
            };
            debug!("accepted connection from {}", peer_addr);

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, config).await {
                    warn!("connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Handles a single routed connection. Any failure just drops the socket.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<RouterConfig>,
) -> Result<(), ConnectionError> {
    // The deadline only covers the sniff; the relay may be long-lived.
    let (hello, peeked) = timeout(config.sniff_timeout, sniff_client_hello(&mut stream))
        .await
        .map_err(|_| ConnectionError::SniffTimeout)??;

    let backend = config.select_backend(&hello.server_name);
    debug!("routing {} ({}) to {}", peer_addr, hello.server_name, backend);

    let backend_stream = timeout(config.connect_timeout, backend.connect())
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(backend.to_string()))?
        .map_err(|source| ConnectionError::Connect {
            backend: backend.to_string(),
            source,
        })?;

    let stats = Relay::run(stream, backend_stream, peeked).await?;
    debug!(
        "connection from {} to {} finished ({} up, {} down)",
        peer_addr, backend, stats.to_backend, stats.to_client
    );

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("timed out waiting for ClientHello")]
    SniffTimeout,
    #[error("ClientHello inspection failed: {0}")]
    Sniff(#[from] SniffError),
    #[error("timed out connecting to backend {0}")]
    ConnectTimeout(String),
    #[error("failed to connect to backend {backend}: {source}")]
    Connect {
        backend: String,
        #[source]
        source: io::Error,
    },
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}
