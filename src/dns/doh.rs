//! DNS-over-HTTPS front-end.
//!
//! Plain HTTP on a loopback address; TLS is terminated in front of it by
//! the node's own web server. Each request to the DoH path takes one token
//! from the shared admission gate before anything else happens.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::DNS_MESSAGE_CONTENT_TYPE;
use super::resolver::QueryResolver;
use crate::ratelimit::AdmissionGate;

/// The single path served.
pub const DOH_PATH: &str = "/dns-query";

/// Default cap on one connection, keep-alive included.
const DEFAULT_CONNECTION_LIFETIME: Duration = Duration::from_secs(60);

/// Shared state for DoH request handling.
pub struct DohState {
    resolver: Arc<QueryResolver>,
    gate: Arc<AdmissionGate>,
    /// Bounds the request head read, and separately the body read plus
    /// resolution, for one request.
    request_timeout: Duration,
    /// Bounds everything hyper does not time out itself: protocol
    /// detection and response writes.
    connection_lifetime: Duration,
}

impl DohState {
    pub fn new(
        resolver: Arc<QueryResolver>,
        gate: Arc<AdmissionGate>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            gate,
            request_timeout,
            connection_lifetime: DEFAULT_CONNECTION_LIFETIME,
        }
    }

    pub fn with_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.connection_lifetime = lifetime;
        self
    }
}

/// The DoH HTTP server.
pub struct DohServer {
    state: Arc<DohState>,
    listener: TcpListener,
}

impl DohServer {
    pub async fn bind(addr: SocketAddr, state: Arc<DohState>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("DoH server listening on {}", listener.local_addr()?);
        Ok(Self { state, listener })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Runs the server, accepting connections forever.
    pub async fn run(self) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("DoH accept error: {}", e);
                    continue;
                }
            };
            debug!("accepted DoH connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let mut builder = ServerBuilder::new(TokioExecutor::new());
                builder
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(state.request_timeout);
                builder.http2().timer(TokioTimer::new());

                let lifetime = state.connection_lifetime;
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(handle_request(req, &state).await) }
                });

                let connection = builder.serve_connection(TokioIo::new(stream), service);
                match timeout(lifetime, connection).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("DoH connection from {} ended: {}", peer_addr, e),
                    Err(_) => debug!("DoH connection from {} closed after {:?}", peer_addr, lifetime),
                }
            });
        }
    }
}

/// Handles one DoH request.
pub async fn handle_request<B>(req: Request<B>, state: &DohState) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    if req.uri().path() != DOH_PATH {
        return empty(StatusCode::NOT_FOUND);
    }

    if !state.gate.allow() {
        debug!("DoH request rate limited");
        return empty(StatusCode::TOO_MANY_REQUESTS);
    }

    let method = req.method().clone();
    let work = async {
        let query = match method {
            Method::POST => read_post_body(req).await?,
            Method::GET => query_from_get(&req)?,
            _ => return Err(StatusCode::METHOD_NOT_ALLOWED),
        };

        state.resolver.resolve(&query).await.map_err(|e| {
            warn!("DoH resolution failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    };

    let result = match timeout(state.request_timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!("DoH request timed out");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };

    match result {
        Ok(answer) => {
            let mut response = Response::new(Full::new(Bytes::from(answer)));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static(DNS_MESSAGE_CONTENT_TYPE),
            );
            response
        }
        Err(status) => empty(status),
    }
}

/// Reads a POST body, rejecting non-DNS content types.
async fn read_post_body<B>(req: Request<B>) -> Result<Vec<u8>, StatusCode>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    if let Some(content_type) = req.headers().get(CONTENT_TYPE)
        && !is_dns_content_type(content_type)
    {
        return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    let body = req.into_body().collect().await.map_err(|e| {
        warn!("failed to read DoH request body: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(body.to_bytes().to_vec())
}

/// Extracts the base64url `dns` parameter of a GET request.
fn query_from_get<B>(req: &Request<B>) -> Result<Vec<u8>, StatusCode> {
    let query = req.uri().query().ok_or(StatusCode::BAD_REQUEST)?;
    let value = query
        .split('&')
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case("dns"))
        .map(|(_, value)| value)
        .ok_or(StatusCode::BAD_REQUEST)?;

    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| StatusCode::BAD_REQUEST)
}

fn is_dns_content_type(value: &HeaderValue) -> bool {
    value
        .to_str()
        .map(|v| v.to_ascii_lowercase().starts_with(DNS_MESSAGE_CONTENT_TYPE))
        .unwrap_or(false)
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = status;
    response
}
