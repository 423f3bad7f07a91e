//! TLS passthrough proxy routed by SNI.
//!
//! This module never terminates TLS for proxied connections. It reads the
//! ClientHello, chooses a backend from the requested name, and relays the
//! untouched byte stream.

mod relay;
mod server;
mod sniff;

pub use relay::{Relay, RelayError, RelayStats};
pub use server::{Backend, ConnectionError, RouterConfig, SniRouter};
pub use sniff::{ClientHelloInfo, ReadOnlyTee, SniffError, sniff_client_hello};
