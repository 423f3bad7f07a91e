use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("host must not be empty")]
    EmptyHost,
    #[error("invalid override pattern: {0:?}")]
    InvalidPattern(String),
    #[error("invalid override address for {pattern}: {address}")]
    InvalidAddress { pattern: String, address: String },
    #[error("invalid upstream URL: {0}")]
    InvalidUpstream(String),
}

const DEFAULT_PER_SECOND: NonZeroU32 = NonZeroU32::new(10).unwrap();
const DEFAULT_BURST: NonZeroU32 = NonZeroU32::new(50).unwrap();

/// Token bucket settings shared by the DoH and DoT front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady refill rate in tokens per second.
    #[serde(default = "default_per_second")]
    pub per_second: NonZeroU32,
    /// Maximum number of tokens the bucket holds.
    #[serde(default = "default_burst")]
    pub burst: NonZeroU32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: DEFAULT_PER_SECOND,
            burst: DEFAULT_BURST,
        }
    }
}

fn default_per_second() -> NonZeroU32 {
    DEFAULT_PER_SECOND
}

fn default_burst() -> NonZeroU32 {
    DEFAULT_BURST
}

/// Node configuration file format (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The node's own domain. Connections presenting this SNI are routed
    /// to the local TLS backend, and certificates are looked up by it.
    pub host: String,

    /// Override table: domain-name fragment -> IP address literal.
    #[serde(default)]
    pub domains: BTreeMap<String, String>,

    /// Plain TCP listener for SNI routing.
    #[serde(default = "default_sni_listen")]
    pub sni_listen: SocketAddr,

    /// TLS listener for DNS-over-TLS.
    #[serde(default = "default_dot_listen")]
    pub dot_listen: SocketAddr,

    /// Plain HTTP listener for DNS-over-HTTPS (TLS is terminated in front of it).
    #[serde(default = "default_doh_listen")]
    pub doh_listen: SocketAddr,

    /// Local port of the node's self-terminating TLS backend.
    #[serde(default = "default_self_backend_port")]
    pub self_backend_port: u16,

    /// Upstream DoH endpoint used for queries without an override.
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Directory holding `<host>/fullchain.pem` and `<host>/privkey.pem`.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default = "default_sniff_timeout_secs")]
    pub sniff_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bounds DoH request handling and each DoT exchange.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_sni_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_dot_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 853))
}

fn default_doh_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_self_backend_port() -> u16 {
    8443
}

fn default_upstream() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_sniff_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl NodeConfig {
    /// Loads config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a JSON string.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Creates a config for `host` with every other field at its default.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            domains: BTreeMap::new(),
            sni_listen: default_sni_listen(),
            dot_listen: default_dot_listen(),
            doh_listen: default_doh_listen(),
            self_backend_port: default_self_backend_port(),
            upstream: default_upstream(),
            cert_dir: default_cert_dir(),
            rate_limit: RateLimitConfig::default(),
            sniff_timeout_secs: default_sniff_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }

    /// Certificate chain and private key paths for the node's own host.
    pub fn cert_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.cert_dir.join(&self.host);
        (dir.join("fullchain.pem"), dir.join("privkey.pem"))
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_secs(self.sniff_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        for (pattern, address) in &self.domains {
            // An empty fragment would be contained in every name
            if pattern.is_empty() || pattern.chars().any(|c| c.is_whitespace()) {
                return Err(ConfigError::InvalidPattern(pattern.clone()));
            }
            if address.parse::<IpAddr>().is_err() {
                return Err(ConfigError::InvalidAddress {
                    pattern: pattern.clone(),
                    address: address.clone(),
                });
            }
        }

        let upstream = self
            .upstream
            .parse::<http::Uri>()
            .map_err(|_| ConfigError::InvalidUpstream(self.upstream.clone()))?;
        if upstream.scheme_str() != Some("https") || upstream.host().is_none() {
            return Err(ConfigError::InvalidUpstream(self.upstream.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG: &str = r#"
{
    "host": "node.example.org",
    "domains": {
        "example.com": "10.0.0.5",
        "v6.test": "fd00::1"
    }
}
"#;

    /// Tests parsing the minimal config shape: host plus override table.
    /// Every other field falls back to the fixed production defaults.
    #[test]
    fn parse_example_config() {
        let config = NodeConfig::parse(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.host, "node.example.org");
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.domains["example.com"], "10.0.0.5");

        assert_eq!(config.sni_listen.port(), 443);
        assert_eq!(config.dot_listen.port(), 853);
        assert_eq!(config.doh_listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.self_backend_port, 8443);
        assert_eq!(config.upstream, "https://1.1.1.1/dns-query");
        assert_eq!(config.rate_limit.per_second.get(), 10);
        assert_eq!(config.rate_limit.burst.get(), 50);
        assert_eq!(config.sniff_timeout(), Duration::from_secs(5));
    }

    /// Tests that optional fields can be overridden.
    #[test]
    fn parse_custom_listeners_and_limits() {
        let json = r#"{
            "host": "node.example.org",
            "doh_listen": "127.0.0.1:9090",
            "rate_limit": { "per_second": 2, "burst": 4 },
            "http_timeout_secs": 3
        }"#;
        let config = NodeConfig::parse(json).unwrap();
        assert!(config.domains.is_empty());
        assert_eq!(config.doh_listen.port(), 9090);
        assert_eq!(config.rate_limit.per_second.get(), 2);
        assert_eq!(config.rate_limit.burst.get(), 4);
        assert_eq!(config.http_timeout(), Duration::from_secs(3));
    }

    /// Certificates are located under `<cert_dir>/<host>/`.
    #[test]
    fn cert_paths_use_host() {
        let config = NodeConfig::parse(EXAMPLE_CONFIG).unwrap();
        let (chain, key) = config.cert_paths();
        assert_eq!(
            chain,
            PathBuf::from("/etc/letsencrypt/live/node.example.org/fullchain.pem")
        );
        assert_eq!(
            key,
            PathBuf::from("/etc/letsencrypt/live/node.example.org/privkey.pem")
        );
    }

    /// Tests that invalid override addresses are rejected at load time.
    #[test]
    fn invalid_address_rejected() {
        let json = r#"{ "host": "h", "domains": { "example.com": "not-an-ip" } }"#;
        assert!(matches!(
            NodeConfig::parse(json),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    /// An empty fragment would match every query, so it is refused.
    #[test]
    fn empty_pattern_rejected() {
        let json = r#"{ "host": "h", "domains": { "": "10.0.0.1" } }"#;
        assert!(matches!(
            NodeConfig::parse(json),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn empty_host_rejected() {
        assert!(matches!(
            NodeConfig::parse(r#"{ "host": " " }"#),
            Err(ConfigError::EmptyHost)
        ));
    }

    /// Zero rates cannot form a token bucket and fail deserialization.
    #[test]
    fn zero_rate_rejected() {
        let json = r#"{ "host": "h", "rate_limit": { "per_second": 0 } }"#;
        assert!(matches!(NodeConfig::parse(json), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn plain_http_upstream_rejected() {
        let json = r#"{ "host": "h", "upstream": "http://1.1.1.1/dns-query" }"#;
        assert!(matches!(
            NodeConfig::parse(json),
            Err(ConfigError::InvalidUpstream(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, EXAMPLE_CONFIG).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.host, "node.example.org");

        assert!(matches!(
            NodeConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
