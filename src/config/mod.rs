mod node;
mod overrides;

pub use node::{ConfigError, NodeConfig, RateLimitConfig};
pub use overrides::Overrides;
