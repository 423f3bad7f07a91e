//! Client for the upstream DNS-over-HTTPS resolver.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::DNS_MESSAGE_CONTENT_TYPE;

/// Forwards raw DNS queries to an upstream resolver.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends `query` unchanged and returns the raw response body unchanged.
    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError>;
}

/// Upstream resolver reached with an HTTPS POST per query.
///
/// Each query opens a fresh connection. A failed attempt is not retried.
pub struct HttpsUpstream {
    uri: Uri,
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl std::fmt::Debug for HttpsUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsUpstream")
            .field("uri", &self.uri)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpsUpstream {
    /// Creates an upstream trusting the bundled web PKI roots.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self::with_client_config(url, Arc::new(config), timeout)
    }

    /// Creates an upstream with a caller-provided TLS client config.
    pub fn with_client_config(
        url: &str,
        config: Arc<ClientConfig>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| UpstreamError::InvalidUri(url.to_string()))?;
        if uri.scheme_str() != Some("https") {
            return Err(UpstreamError::InvalidUri(url.to_string()));
        }
        let host = uri
            .host()
            .ok_or_else(|| UpstreamError::InvalidUri(url.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(443);
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| UpstreamError::InvalidUri(url.to_string()))?;

        Ok(Self {
            uri,
            host,
            port,
            server_name,
            connector: TlsConnector::from(config),
            timeout,
        })
    }

    async fn post(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let tcp_stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(UpstreamError::Connect)?;

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .map_err(UpstreamError::TlsHandshake)?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("upstream connection closed: {}", e);
            }
        });

        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = self
            .uri
            .authority()
            .map(|a| a.as_str())
            .unwrap_or(self.host.as_str());

        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, authority)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(Full::new(Bytes::copy_from_slice(query)))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        if !status.is_success() {
            warn!("upstream {} answered with status {}", self.uri, status);
        }

        let body = response.into_body().collect().await?.to_bytes();
        debug!(
            "upstream {} returned {} bytes for {} byte query",
            self.uri,
            body.len(),
            query.len()
        );

        Ok(body.to_vec())
    }
}

#[async_trait]
impl Upstream for HttpsUpstream {
    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        timeout(self.timeout, self.post(query))
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream URL: {0}")]
    InvalidUri(String),
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),
    #[error("upstream TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("failed to build upstream request: {0}")]
    Request(#[from] http::Error),
    #[error("upstream request timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SelfSigned;
    use http::{Response, StatusCode};
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioExecutor;
    use hyper_util::server::conn::auto::Builder as ServerBuilder;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    /// Starts a TLS HTTP server that answers every POST with `reply` and
    /// reports what it received.
    async fn spawn_upstream(
        cert: &SelfSigned,
        reply: &'static [u8],
        status: StatusCode,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(crate::cert::server_config(Arc::new(
            cert.certified_key(),
        )));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let Ok(tls) = acceptor.accept(stream).await else {
                    continue;
                };
                let tx = tx.clone();
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let content_type = req
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let body = req.collect().await.unwrap().to_bytes().to_vec();
                        tx.send((content_type, body)).unwrap();
                        let mut response = Response::new(Full::new(Bytes::from_static(reply)));
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    }
                });
                tokio::spawn(async move {
                    let _ = ServerBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls), service)
                        .await;
                });
            }
        });

        (addr, rx)
    }

    /// The query body goes out unchanged with the DNS content type, and
    /// the upstream body comes back unchanged, even when it is not DNS.
    #[tokio::test]
    async fn forwards_bytes_verbatim() {
        let cert = SelfSigned::generate("localhost");
        let (addr, mut received) =
            spawn_upstream(&cert, b"\x00\x01not really dns", StatusCode::OK).await;

        let upstream = HttpsUpstream::with_client_config(
            &format!("https://localhost:{}/dns-query", addr.port()),
            cert.client_config(),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = upstream.forward(b"\x12\x34raw query").await.unwrap();
        assert_eq!(response, b"\x00\x01not really dns");

        let (content_type, body) = received.recv().await.unwrap();
        assert_eq!(content_type, "application/dns-message");
        assert_eq!(body, b"\x12\x34raw query");
    }

    /// Error statuses are not interpreted; the body is passed through.
    #[tokio::test]
    async fn error_status_body_passed_through() {
        let cert = SelfSigned::generate("localhost");
        let (addr, _received) =
            spawn_upstream(&cert, b"upstream says no", StatusCode::BAD_REQUEST).await;

        let upstream = HttpsUpstream::with_client_config(
            &format!("https://localhost:{}/dns-query", addr.port()),
            cert.client_config(),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(upstream.forward(b"q").await.unwrap(), b"upstream says no");
    }

    /// An untrusted upstream certificate fails the query.
    #[tokio::test]
    async fn untrusted_certificate_fails() {
        let cert = SelfSigned::generate("localhost");
        let (addr, _received) = spawn_upstream(&cert, b"", StatusCode::OK).await;

        let other = SelfSigned::generate("localhost");
        let upstream = HttpsUpstream::with_client_config(
            &format!("https://localhost:{}/dns-query", addr.port()),
            other.client_config(),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(matches!(
            upstream.forward(b"q").await,
            Err(UpstreamError::TlsHandshake(_))
        ));
    }

    #[test]
    fn parses_default_upstream() {
        let upstream = HttpsUpstream::new("https://1.1.1.1/dns-query", Duration::from_secs(1))
            .unwrap();
        assert_eq!(upstream.host, "1.1.1.1");
        assert_eq!(upstream.port, 443);
        assert!(matches!(upstream.server_name, ServerName::IpAddress(_)));
    }

    #[test]
    fn rejects_plain_http() {
        assert!(matches!(
            HttpsUpstream::new("http://1.1.1.1/dns-query", Duration::from_secs(1)),
            Err(UpstreamError::InvalidUri(_))
        ));
    }
}
