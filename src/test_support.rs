//! Shared fixtures for unit tests.

use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use rcgen::{CertificateParams, KeyPair};
use rustls::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::sign::CertifiedKey;
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsConnector;

use crate::dns::{Upstream, UpstreamError};
use crate::ratelimit::AdmissionGate;

/// A freshly generated self-signed certificate for one host name.
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl SelfSigned {
    pub fn generate(host: &str) -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![host.to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
            key_der: key_pair.serialize_der(),
        }
    }

    pub fn certified_key(&self) -> CertifiedKey {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).unwrap();
        CertifiedKey::new(vec![self.cert_der.clone()], signing_key)
    }

    /// A client config trusting only this certificate.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert_der.clone()).unwrap();

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

/// Captures the first TLS record a real rustls client sends for `server_name`.
pub async fn client_hello_bytes(server_name: ServerName<'static>) -> Vec<u8> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let connector = TlsConnector::from(Arc::new(config));
    let handshake = tokio::spawn(async move {
        let _ = connector.connect(server_name, client).await;
    });

    let mut header = [0u8; 5];
    server.read_exact(&mut header).await.unwrap();
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut record = header.to_vec();
    record.resize(5 + len, 0);
    server.read_exact(&mut record[5..]).await.unwrap();

    handshake.abort();
    record
}

/// Builds a wire-format query with one question.
pub fn dns_query(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), record_type));
    message.to_vec().unwrap()
}

pub fn gate(per_second: u32, burst: u32) -> AdmissionGate {
    AdmissionGate::new(
        NonZeroU32::new(per_second).unwrap(),
        NonZeroU32::new(burst).unwrap(),
    )
}

/// An upstream that records every query and answers with fixed bytes.
pub struct RecordingUpstream {
    calls: Mutex<Vec<Vec<u8>>>,
    response: Option<Vec<u8>>,
}

impl RecordingUpstream {
    pub fn replying(response: &[u8]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            response: Some(response.to_vec()),
        }
    }

    /// Every forward fails as if the upstream never answered.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            response: None,
        }
    }

    pub fn calls(&self) -> Vec<Vec<u8>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for RecordingUpstream {
    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        self.calls.lock().unwrap().push(query.to_vec());
        self.response.clone().ok_or(UpstreamError::Timeout)
    }
}
