//! Protocol-agnostic DNS query resolution shared by DoH and DoT.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::error::ProtoError;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record};
use tracing::debug;

use super::upstream::{Upstream, UpstreamError};
use crate::config::Overrides;

/// TTL of locally synthesized answers.
const LOCAL_ANSWER_TTL: u32 = 3600;

/// Answers from the override table, forwarding everything else upstream.
pub struct QueryResolver {
    overrides: Arc<Overrides>,
    upstream: Arc<dyn Upstream>,
}

impl QueryResolver {
    pub fn new(overrides: Arc<Overrides>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            overrides,
            upstream,
        }
    }

    /// Resolves one wire-format query into a wire-format response.
    ///
    /// Only the first question decides whether an override applies. On a
    /// miss the original bytes, all questions included, are forwarded and
    /// the upstream bytes are returned without being parsed.
    pub async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let mut message = Message::from_vec(query).map_err(ResolveError::Malformed)?;
        let name = message
            .queries()
            .first()
            .map(|question| question.name().clone())
            .ok_or(ResolveError::NoQuestion)?;

        let Some(address) = self.overrides.lookup(&name.to_string()) else {
            debug!("forwarding query for {} upstream", name);
            return Ok(self.upstream.forward(query).await?);
        };

        debug!("answering {} locally with {}", name, address);
        let rdata = match address {
            IpAddr::V4(v4) => RData::A(A(v4)),
            IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
        };
        message
            .add_answer(Record::from_rdata(name, LOCAL_ANSWER_TTL, rdata))
            .set_message_type(MessageType::Response)
            .set_recursion_available(true);

        message.to_vec().map_err(ResolveError::Encode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("malformed DNS query: {0}")]
    Malformed(#[source] ProtoError),
    #[error("no DNS question found in the request")]
    NoQuestion,
    #[error("failed to encode DNS response: {0}")]
    Encode(#[source] ProtoError),
    #[error("upstream resolution failed: {0}")]
    Upstream(#[from] UpstreamError),
}
