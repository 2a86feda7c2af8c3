//! Error types for cache configuration

/// Cache configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Key pattern is empty
    #[error("empty key pattern")]
    EmptyPattern,

    /// Size budget of zero
    #[error("cache size budget must be greater than zero")]
    ZeroBudget,

    /// Tier TTL of zero
    #[error("ttl for {0} tier must be greater than zero")]
    ZeroTtl(&'static str),
}
