//! Loader configuration
//!
//! One [`FloorlinkConfig`] carries a section per loader plus the shared retry
//! and cache settings. Every field has a default, so a TOML file only needs
//! the keys it changes. Durations are milliseconds.

use floorlink_cache::{CachePriority, TierSettings, TtlPolicy, WidgetConfig, DEFAULT_MAX_SIZE};
use floorlink_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Value out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted field path
        field: &'static str,
        /// What is wrong
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Retry behaviour for backend fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry
    pub delay_ms: u64,
    /// Delay growth per retry; 1.0 keeps it fixed
    pub multiplier: f64,
    /// Upper bound on the delay
    pub max_delay_ms: u64,
}

impl RetrySettings {
    /// Policy these settings describe
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retries, Duration::from_millis(self.delay_ms))
            .with_backoff(self.multiplier, Duration::from_millis(self.max_delay_ms))
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_ms: 1000,
            multiplier: 1.0,
            max_delay_ms: 30_000,
        }
    }
}

/// TTL and poll interval override for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Freshness window
    pub ttl_ms: u64,
    /// Recurring refresh period; absent means never
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

/// Per-tier overrides; absent tiers keep their built-in values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierOverrides {
    /// Critical tier
    pub critical: Option<TierConfig>,
    /// High tier
    pub high: Option<TierConfig>,
    /// Normal tier
    pub normal: Option<TierConfig>,
    /// Low tier
    pub low: Option<TierConfig>,
    /// Static tier
    #[serde(rename = "static")]
    pub static_: Option<TierConfig>,
}

impl TierOverrides {
    fn iter(&self) -> impl Iterator<Item = (CachePriority, TierConfig)> + '_ {
        [
            (CachePriority::Critical, self.critical),
            (CachePriority::High, self.high),
            (CachePriority::Normal, self.normal),
            (CachePriority::Low, self.low),
            (CachePriority::Static, self.static_),
        ]
        .into_iter()
        .filter_map(|(priority, tier)| tier.map(|t| (priority, t)))
    }
}

/// Cache budget and tier settings shared by every loader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Size budget per loader cache, in bytes
    pub max_size_bytes: usize,
    /// Tier overrides
    pub tiers: TierOverrides,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE,
            tiers: TierOverrides::default(),
        }
    }
}

/// Monitoring loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Open the push subscription after each snapshot
    pub hybrid: bool,
    /// Wait between opening the channel and sending the subscribe directive
    pub subscribe_delay_ms: u64,
    /// Budget for one snapshot request
    pub request_timeout_ms: u64,
    /// Snapshot re-fetch period when the push channel is down; absent disables
    pub poll_interval_ms: Option<u64>,
    /// Topics sent with the subscribe directive
    pub topics: Vec<String>,
}

impl MonitoringConfig {
    /// With hybrid mode switched on or off
    #[inline]
    #[must_use]
    pub fn with_hybrid(mut self, hybrid: bool) -> Self {
        self.hybrid = hybrid;
        self
    }

    /// With poll fallback period
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = Some(millis(interval));
        self
    }

    /// With subscribe settle delay
    #[inline]
    #[must_use]
    pub fn with_subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay_ms = millis(delay);
        self
    }

    /// Settle delay
    #[must_use]
    pub fn subscribe_delay(&self) -> Duration {
        Duration::from_millis(self.subscribe_delay_ms)
    }

    /// Request budget
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Poll fallback period
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            hybrid: true,
            subscribe_delay_ms: 500,
            request_timeout_ms: 10_000,
            poll_interval_ms: None,
            topics: vec!["equipment-status".to_string()],
        }
    }
}

/// Mapping loader settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Push each loaded table into the edit state, when one is injected
    pub auto_apply: bool,
    /// Budget for one mapping request
    pub request_timeout_ms: u64,
    /// TTL of cached site tables; absent uses the static tier
    pub cache_ttl_ms: Option<u64>,
}

impl MappingConfig {
    /// With auto apply switched on or off
    #[inline]
    #[must_use]
    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    /// Request budget
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Explicit cache TTL
    #[must_use]
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_ms.map(Duration::from_millis)
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            auto_apply: true,
            request_timeout_ms: 10_000,
            cache_ttl_ms: None,
        }
    }
}

/// Dashboard loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Settings for widgets that were never registered
    pub default_widget: WidgetConfig,
    /// Widgets registered at construction
    pub widgets: BTreeMap<String, WidgetConfig>,
    /// Budget for one widget request
    pub request_timeout_ms: u64,
}

impl DashboardConfig {
    /// With one widget registered
    #[must_use]
    pub fn with_widget(mut self, name: impl Into<String>, config: WidgetConfig) -> Self {
        self.widgets.insert(name.into(), config);
        self
    }

    /// Request budget
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            default_widget: WidgetConfig::default(),
            widgets: BTreeMap::new(),
            request_timeout_ms: 10_000,
        }
    }
}

/// Complete loader configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloorlinkConfig {
    /// Retry behaviour
    pub retry: RetrySettings,
    /// Cache settings
    pub cache: CacheSettings,
    /// Monitoring section
    pub monitoring: MonitoringConfig,
    /// Mapping section
    pub mapping: MappingConfig,
    /// Dashboard section
    pub dashboard: DashboardConfig,
}

impl FloorlinkConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With retry settings
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// With monitoring section
    #[inline]
    #[must_use]
    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// With mapping section
    #[inline]
    #[must_use]
    pub fn with_mapping(mut self, mapping: MappingConfig) -> Self {
        self.mapping = mapping;
        self
    }

    /// With dashboard section
    #[inline]
    #[must_use]
    pub fn with_dashboard(mut self, dashboard: DashboardConfig) -> Self {
        self.dashboard = dashboard;
        self
    }

    /// Parse and validate TOML.
    ///
    /// # Errors
    /// `ConfigError::Parse` or `ConfigError::Invalid`
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    /// `ConfigError::Io`, `ConfigError::Parse` or `ConfigError::Invalid`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(ConfigError::invalid("cache.max_size_bytes", "must be greater than zero"));
        }
        if self.monitoring.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("monitoring.request_timeout_ms", "must be greater than zero"));
        }
        if self.monitoring.poll_interval_ms == Some(0) {
            return Err(ConfigError::invalid("monitoring.poll_interval_ms", "must be greater than zero"));
        }
        if self.mapping.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("mapping.request_timeout_ms", "must be greater than zero"));
        }
        if self.dashboard.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("dashboard.request_timeout_ms", "must be greater than zero"));
        }
        for (priority, tier) in self.cache.tiers.iter() {
            if tier.ttl_ms == 0 {
                return Err(ConfigError::invalid(
                    "cache.tiers",
                    format!("{} ttl_ms must be greater than zero", priority.as_str()),
                ));
            }
        }
        Ok(())
    }

    /// TTL policy with the configured tier overrides and `default_priority`
    /// for undeclared keys.
    ///
    /// # Errors
    /// `ConfigError::Invalid` for a zero tier TTL
    pub fn ttl_policy(&self, default_priority: CachePriority) -> Result<TtlPolicy, ConfigError> {
        self.cache
            .tiers
            .iter()
            .try_fold(TtlPolicy::new().with_default_priority(default_priority), |policy, (priority, tier)| {
                policy
                    .with_tier(
                        priority,
                        TierSettings {
                            ttl: Duration::from_millis(tier.ttl_ms),
                            poll_interval: tier.poll_interval_ms.map(Duration::from_millis),
                        },
                    )
                    .map_err(|e| ConfigError::invalid("cache.tiers", e.to_string()))
            })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
