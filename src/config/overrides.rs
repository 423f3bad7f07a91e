use std::net::IpAddr;

use tracing::debug;

use super::node::NodeConfig;

/// Compiled override table for answering DNS queries locally.
///
/// Built once at startup and never mutated, so lookups need no locking.
/// Matching is substring containment: a query name matches when it
/// contains a configured fragment, ignoring ASCII case. This is
/// not suffix matching, so `example.com` also matches
/// `example.com.evil.net`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Lower-cased fragments in sorted order, with their addresses.
    entries: Vec<(String, IpAddr)>,
}

impl Overrides {
    /// Compiles the override table from a validated config.
    /// Entries whose address does not parse are skipped.
    pub fn new(config: &NodeConfig) -> Self {
        Self::from_pairs(
            config
                .domains
                .iter()
                .filter_map(|(pattern, address)| Some((pattern.as_str(), address.parse().ok()?))),
        )
    }

    /// Builds a table from `(fragment, address)` pairs.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, IpAddr)>,
    {
        let mut entries: Vec<(String, IpAddr)> = pairs
            .into_iter()
            .map(|(pattern, address)| (pattern.to_ascii_lowercase(), address))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.dedup_by(|a, b| a.0 == b.0);

        Self { entries }
    }

    /// Returns the address of the first fragment contained in `name`.
    pub fn lookup(&self, name: &str) -> Option<IpAddr> {
        let name = name.to_ascii_lowercase();
        let (pattern, address) = self
            .entries
            .iter()
            .find(|(pattern, _)| name.contains(pattern.as_str()))?;
        debug!("override {} matched {} -> {}", pattern, name, address);
        Some(*address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
