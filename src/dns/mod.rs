//! DNS front-ends and the resolution path behind them.
//!
//! DoH and DoT both hand raw wire-format queries to a [`QueryResolver`],
//! which answers override hits locally and forwards the rest upstream.

mod doh;
mod dot;
mod resolver;
mod upstream;

pub use doh::{DOH_PATH, DohServer, DohState, handle_request};
pub use dot::{DotError, DotServer, FrameError, read_frame, write_frame};
pub use resolver::{QueryResolver, ResolveError};
pub use upstream::{HttpsUpstream, Upstream, UpstreamError};

/// Media type of DNS wire-format bodies (RFC 8484).
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";
