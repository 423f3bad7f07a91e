//! ClientHello inspection without terminating TLS.
//!
//! The client socket is read through a read-only tee: every byte pulled
//! from it lands in a side buffer so the caller can replay it to the real
//! backend, and nothing can ever be written back. Handshake records are
//! read until the ClientHello is complete, then parsed without any
//! version or cipher negotiation, so legacy and minimal hellos route the
//! same way modern ones do.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tls_parser::{
    SNIType, TlsExtension, TlsMessage, TlsMessageHandshake, parse_tls_extensions,
    parse_tls_message_handshake,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

/// Initial capacity of the peek buffer. Most ClientHellos fit a single record.
const PEEK_CAPACITY: usize = 2048;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
/// Handshake message header: type plus 24-bit length.
const HANDSHAKE_HEADER_LEN: usize = 4;
/// Largest plaintext record fragment.
const MAX_FRAGMENT_LEN: usize = 1 << 14;
/// Largest ClientHello accepted after reassembly.
const MAX_HELLO_LEN: usize = 1 << 16;

/// What the ClientHello told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Requested server name, lower-cased.
    pub server_name: String,
    /// Offered ALPN protocols, in client preference order.
    pub alpn: Vec<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    #[error("no ClientHello received: {0}")]
    NoClientHello(#[source] io::Error),
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),
    #[error("no SNI provided")]
    NoSni,
}

/// Reads the ClientHello from `stream` and returns it together with every
/// byte consumed while doing so.
///
/// Nothing is ever written to `stream`. Only whole TLS records are read,
/// so on return the stream is positioned right after the returned bytes
/// and `peeked` followed by the rest of the stream is exactly what the
/// client sent.
pub async fn sniff_client_hello<S>(stream: &mut S) -> Result<(ClientHelloInfo, Vec<u8>), SniffError>
where
    S: AsyncRead + Unpin,
{
    let mut peeked = Vec::with_capacity(PEEK_CAPACITY);
    let hello = read_client_hello(&mut ReadOnlyTee::new(stream, &mut peeked)).await?;
    let info = parse_client_hello(&hello)?;

    debug!(
        "sniffed ClientHello for {} ({} bytes, alpn {:?})",
        info.server_name,
        peeked.len(),
        info.alpn
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect::<Vec<_>>()
    );

    Ok((info, peeked))
}

/// Reassembles the ClientHello handshake message from one or more
/// handshake records.
async fn read_client_hello<R>(reader: &mut R) -> Result<Vec<u8>, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        reader
            .read_exact(&mut header)
            .await
            .map_err(SniffError::NoClientHello)?;

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniffError::Malformed("not a TLS handshake record"));
        }
        if header[1] != 3 {
            return Err(SniffError::Malformed("unsupported record version"));
        }
        let len = usize::from(u16::from_be_bytes([header[3], header[4]]));
        if len == 0 || len > MAX_FRAGMENT_LEN {
            return Err(SniffError::Malformed("invalid record length"));
        }

        let start = message.len();
        message.resize(start + len, 0);
        reader
            .read_exact(&mut message[start..])
            .await
            .map_err(SniffError::NoClientHello)?;

        if message[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(SniffError::Malformed("first handshake message is not a ClientHello"));
        }
        if message.len() < HANDSHAKE_HEADER_LEN {
            continue;
        }

        let body_len = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
        let total = HANDSHAKE_HEADER_LEN + body_len;
        if total > MAX_HELLO_LEN {
            return Err(SniffError::Malformed("ClientHello too large"));
        }
        if message.len() >= total {
            message.truncate(total);
            return Ok(message);
        }
    }
}

fn parse_client_hello(message: &[u8]) -> Result<ClientHelloInfo, SniffError> {
    let (_, parsed) = parse_tls_message_handshake(message)
        .map_err(|_| SniffError::Malformed("unparsable ClientHello"))?;
    let TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) = parsed else {
        return Err(SniffError::Malformed("first handshake message is not a ClientHello"));
    };

    let extensions = match hello.ext {
        Some(ext) => {
            parse_tls_extensions(ext)
                .map_err(|_| SniffError::Malformed("unparsable ClientHello extensions"))?
                .1
        }
        None => Vec::new(),
    };

    let mut server_name = None;
    let mut alpn = Vec::new();
    for extension in extensions {
        match extension {
            TlsExtension::SNI(names) => {
                server_name = names
                    .into_iter()
                    .find(|(kind, _)| *kind == SNIType::HostName)
                    .map(|(_, name)| name);
            }
            TlsExtension::ALPN(protocols) => {
                alpn = protocols.into_iter().map(<[u8]>::to_vec).collect();
            }
            _ => {}
        }
    }

    let server_name = std::str::from_utf8(server_name.ok_or(SniffError::NoSni)?)
        .map_err(|_| SniffError::Malformed("server name is not valid UTF-8"))?;
    if server_name.is_empty() {
        return Err(SniffError::NoSni);
    }

    Ok(ClientHelloInfo {
        server_name: server_name.to_ascii_lowercase(),
        alpn,
    })
}

/// Duplex view over a readable stream that copies everything read into a
/// side buffer and refuses all writes.
pub struct ReadOnlyTee<'a, R> {
    inner: &'a mut R,
    captured: &'a mut Vec<u8>,
}

impl<'a, R> ReadOnlyTee<'a, R> {
    pub fn new(inner: &'a mut R, captured: &'a mut Vec<u8>) -> Self {
        Self { inner, captured }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadOnlyTee<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.captured.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<R> AsyncWrite for ReadOnlyTee<'_, R> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
