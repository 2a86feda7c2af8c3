//! Priority tiers and TTL resolution
//!
//! Every cache key resolves to a [`CachePriority`], either through an explicit
//! declaration or the policy default. The tier supplies the default TTL and,
//! for scheduled refreshes, the poll interval. An explicit per-key TTL always
//! wins over the tier default.

use crate::error::CacheError;
use crate::pattern::KeyPattern;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Freshness tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    /// Live production values
    Critical,
    /// Frequently changing
    High,
    /// Default tier
    #[default]
    Normal,
    /// Slow-moving aggregates
    Low,
    /// Reference data; never polled
    Static,
}

impl CachePriority {
    /// All tiers, shortest TTL first
    pub const ALL: [CachePriority; 5] = [
        CachePriority::Critical,
        CachePriority::High,
        CachePriority::Normal,
        CachePriority::Low,
        CachePriority::Static,
    ];

    /// Built-in TTL of the tier
    #[must_use]
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Critical => Duration::from_secs(5),
            Self::High => Duration::from_secs(30),
            Self::Normal => Duration::from_secs(60),
            Self::Low => Duration::from_secs(300),
            Self::Static => Duration::from_secs(3600),
        }
    }

    /// Built-in poll interval; `Static` is never scheduled
    #[must_use]
    pub fn default_poll_interval(self) -> Option<Duration> {
        match self {
            Self::Static => None,
            other => Some(other.default_ttl()),
        }
    }

    /// Lowercase tier name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Static => "static",
        }
    }
}

/// How a widget keeps its data current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefreshStrategy {
    /// Tight polling at the tier interval
    Realtime,
    /// Periodic polling
    #[default]
    Polling,
    /// Fetched only when asked for
    OnDemand,
    /// Updated by the push channel
    Push,
    /// Push with a polling fallback
    Hybrid,
}

impl RefreshStrategy {
    /// Whether a recurring refresh is scheduled for this strategy
    #[inline]
    #[must_use]
    pub fn schedules_refresh(self) -> bool {
        !matches!(self, Self::OnDemand)
    }

    /// Whether push updates are accepted
    #[inline]
    #[must_use]
    pub fn accepts_push(self) -> bool {
        matches!(self, Self::Push | Self::Hybrid | Self::Realtime)
    }
}

fn enabled() -> bool {
    true
}

/// Per-widget freshness declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfig {
    /// Tier
    #[serde(default)]
    pub priority: CachePriority,
    /// Refresh strategy
    #[serde(default)]
    pub refresh_strategy: RefreshStrategy,
    /// Explicit TTL overriding the tier
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Whether a recurring refresh may be scheduled
    #[serde(default = "enabled")]
    pub auto_refresh: bool,
}

impl WidgetConfig {
    /// Config for a tier with the default strategy
    #[must_use]
    pub fn new(priority: CachePriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// With refresh strategy
    #[inline]
    #[must_use]
    pub fn with_strategy(mut self, strategy: RefreshStrategy) -> Self {
        self.refresh_strategy = strategy;
        self
    }

    /// With explicit TTL
    #[inline]
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// With auto refresh switched on or off
    #[inline]
    #[must_use]
    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    /// Explicit TTL, if any
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            priority: CachePriority::Normal,
            refresh_strategy: RefreshStrategy::Polling,
            ttl_ms: None,
            auto_refresh: true,
        }
    }
}

/// TTL and poll interval of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSettings {
    /// Freshness window
    pub ttl: Duration,
    /// Recurring refresh period, `None` for never
    pub poll_interval: Option<Duration>,
}

impl TierSettings {
    /// Built-in settings of `priority`
    #[must_use]
    pub fn defaults(priority: CachePriority) -> Self {
        Self {
            ttl: priority.default_ttl(),
            poll_interval: priority.default_poll_interval(),
        }
    }
}

/// Key → priority → TTL resolution
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    tiers: HashMap<CachePriority, TierSettings>,
    exact: HashMap<String, CachePriority>,
    patterns: Vec<(KeyPattern, CachePriority)>,
    default_priority: CachePriority,
}

impl TtlPolicy {
    /// Policy with built-in tiers and `Normal` as default
    #[must_use]
    pub fn new() -> Self {
        Self {
            tiers: CachePriority::ALL
                .iter()
                .map(|&p| (p, TierSettings::defaults(p)))
                .collect(),
            exact: HashMap::new(),
            patterns: Vec::new(),
            default_priority: CachePriority::Normal,
        }
    }

    /// Policy where undeclared keys fall into `priority`
    #[must_use]
    pub fn with_default_priority(mut self, priority: CachePriority) -> Self {
        self.default_priority = priority;
        self
    }

    /// Override one tier.
    ///
    /// # Errors
    /// `CacheError::ZeroTtl` for a zero TTL
    pub fn with_tier(mut self, priority: CachePriority, settings: TierSettings) -> Result<Self, CacheError> {
        if settings.ttl.is_zero() {
            return Err(CacheError::ZeroTtl(priority.as_str()));
        }
        self.tiers.insert(priority, settings);
        Ok(self)
    }

    /// Declare the priority of a key or `*` pattern.
    ///
    /// # Errors
    /// `CacheError::EmptyPattern` for an empty pattern
    pub fn declare(&mut self, pattern: &str, priority: CachePriority) -> Result<(), CacheError> {
        match KeyPattern::parse(pattern)? {
            KeyPattern::Exact(key) => {
                self.exact.insert(key, priority);
            }
            wildcard => {
                self.patterns.retain(|(p, _)| p != &wildcard);
                self.patterns.push((wildcard, priority));
            }
        }
        Ok(())
    }

    /// Priority of `key`: exact declaration, then first matching pattern,
    /// then the default
    #[must_use]
    pub fn priority_for(&self, key: &str) -> CachePriority {
        if let Some(&priority) = self.exact.get(key) {
            return priority;
        }
        self.patterns
            .iter()
            .find(|(p, _)| p.matches(key))
            .map_or(self.default_priority, |&(_, priority)| priority)
    }

    /// Settings of a tier
    #[must_use]
    pub fn tier(&self, priority: CachePriority) -> TierSettings {
        self.tiers
            .get(&priority)
            .copied()
            .unwrap_or_else(|| TierSettings::defaults(priority))
    }

    /// TTL for `key`; `explicit` overrides the tier
    #[must_use]
    pub fn ttl_for(&self, key: &str, explicit: Option<Duration>) -> Duration {
        explicit.unwrap_or_else(|| self.tier(self.priority_for(key)).ttl)
    }

    /// Poll interval of a tier
    #[must_use]
    pub fn poll_interval(&self, priority: CachePriority) -> Option<Duration> {
        self.tier(priority).poll_interval
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new()
    }
}
