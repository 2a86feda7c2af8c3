//! Floorlink Cache - TTL store shared by loaders
//!
//! - Five priority tiers, each with a default TTL and poll interval
//! - Per-key TTL overrides and `*` wildcard priority declarations
//! - Size budget enforced by insertion-order eviction
//! - Stale reads for stale-while-revalidate callers

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod pattern;
pub mod policy;
pub mod store;

pub use error::CacheError;
pub use pattern::KeyPattern;
pub use policy::{CachePriority, RefreshStrategy, TierSettings, TtlPolicy, WidgetConfig};
pub use store::{
    CacheEntry, CacheLookup, CacheStats, CacheStore, Freshness, Sizer, DEFAULT_MAX_SIZE,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
