//! Shared admission control for the secure-DNS front-ends.
//!
//! A single token bucket (GCRA via `governor`) is shared by every
//! `/dns-query` request and DoT connection. Checks never block: a request
//! either takes a token immediately or is denied. State lives in one
//! atomic cell, so concurrent checks can neither lose nor double-count
//! tokens. The SNI router is not gated.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::config::RateLimitConfig;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket admission gate.
pub struct AdmissionGate {
    limiter: DirectRateLimiter,
    per_second: NonZeroU32,
    burst: NonZeroU32,
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("per_second", &self.per_second)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    /// Creates a gate refilling `per_second` tokens up to `burst`.
    /// The bucket starts full.
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
            per_second,
            burst,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.per_second, config.burst)
    }

    /// Takes one token if available. Never waits.
    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn per_second(&self) -> u32 {
        self.per_second.get()
    }

    pub fn burst(&self) -> u32 {
        self.burst.get()
    }
}
