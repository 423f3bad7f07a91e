//! Edge node combining an SNI router with a filtering DNS resolver.
//!
//! One process runs three listeners:
//!
//! - An SNI router that reads each TLS ClientHello without answering it and
//!   relays the untouched stream either to the node's own TLS terminator or
//!   to the requested host on port 443.
//! - A DNS-over-HTTPS endpoint (`/dns-query`, plain HTTP behind a local
//!   TLS terminator).
//! - A DNS-over-TLS endpoint using the node's certificate.
//!
//! Both DNS front-ends answer names matching the configured override table
//! locally and forward everything else to an upstream DoH resolver. They
//! share one admission gate; the SNI router is not rate limited.
//!
//! # Example
//!
//! ```no_run
//! use sni_edge::{Node, NodeConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = NodeConfig::load("config.json")?;
//! Node::new(config).run().await
//! # }
//! ```

pub mod cert;
pub mod config;
pub mod dns;
pub mod proxy;
pub mod ratelimit;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, NodeConfig, Overrides, RateLimitConfig};
pub use ratelimit::AdmissionGate;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use dns::{DohServer, DohState, DotServer, HttpsUpstream, QueryResolver};
use proxy::{RouterConfig, SniRouter};

/// A fully configured edge node.
pub struct Node {
    config: NodeConfig,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Loads certificates, binds every listener and serves until one of
    /// them fails.
    ///
    /// Startup fails before any listener is bound when the certificate
    /// cannot be loaded.
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let (chain_path, key_path) = config.cert_paths();
        let certified_key = cert::load_certified_key(&chain_path, &key_path)
            .with_context(|| format!("failed to load certificate for {}", config.host))?;
        let tls_config = cert::server_config(Arc::new(certified_key));

        let overrides = Overrides::new(&config);
        info!("loaded {} DNS override(s)", overrides.len());

        let upstream = HttpsUpstream::new(&config.upstream, config.http_timeout())
            .context("invalid upstream resolver")?;
        let resolver = Arc::new(QueryResolver::new(Arc::new(overrides), Arc::new(upstream)));

        let gate = Arc::new(AdmissionGate::from_config(&config.rate_limit));
        info!(
            "DNS rate limit: {} queries/s, burst {}",
            gate.per_second(),
            gate.burst()
        );

        let doh_state = Arc::new(DohState::new(
            Arc::clone(&resolver),
            Arc::clone(&gate),
            config.http_timeout(),
        ));
        let doh = DohServer::bind(config.doh_listen, doh_state)
            .await
            .with_context(|| format!("failed to bind DoH listener on {}", config.doh_listen))?;

        // DoT uses the same deadline for the whole exchange.
        let dot = DotServer::bind(
            config.dot_listen,
            tls_config,
            resolver,
            gate,
            config.http_timeout(),
        )
        .await
        .with_context(|| format!("failed to bind DoT listener on {}", config.dot_listen))?;

        let router = SniRouter::bind(config.sni_listen, RouterConfig::from_node(&config))
            .await
            .with_context(|| format!("failed to bind SNI listener on {}", config.sni_listen))?;

        info!("node {} is up", config.host);

        tokio::try_join!(
            async { doh.run().await.context("DoH server failed") },
            async { dot.run().await.context("DoT server failed") },
            async { router.run().await.context("SNI router failed") },
        )?;

        Ok(())
    }
}
