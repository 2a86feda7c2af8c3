//! Floorlink Loaders - Concrete data sources and their registry
//!
//! Three loaders built on the [`floorlink_core`] lifecycle contract:
//! - [`MonitoringLoader`]: equipment snapshot kept current over a push channel
//! - [`MappingLoader`]: site-scoped frontend id ↔ equipment id index
//! - [`DashboardLoader`]: widgets on tiered TTLs with stale-while-revalidate
//!
//! [`LoaderRegistry`] builds and caches them from one [`FloorlinkConfig`] and
//! one set of injected [`LoaderDeps`].
//!
//! # Example
//!
//! ```rust,ignore
//! use floorlink_loaders::prelude::*;
//!
//! # async fn example(deps: LoaderDeps) -> Result<(), RegistryError> {
//! let registry = LoaderRegistry::new();
//! registry.configure(deps, FloorlinkConfig::default());
//! let mapping = registry.get_loader(LoaderMode::Mapping, None).await?;
//! mapping.initialize().await?;
//! let results = registry.load_all(&LoadAllParams::default()).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod dashboard;
pub mod deps;
pub mod mapping;
pub mod monitoring;
pub mod registry;
pub mod simulator;

pub use config::{
    CacheSettings, ConfigError, DashboardConfig, FloorlinkConfig, MappingConfig,
    MonitoringConfig, RetrySettings, TierConfig, TierOverrides,
};
pub use dashboard::{
    DashboardEvent, DashboardLoader, DashboardOutput, DashboardParams, UpdateSource,
    WidgetResult, WidgetValue,
};
pub use deps::LoaderDeps;
pub use mapping::{
    LegacySiteConfigAdapter, LegacySiteConfigSource, MappingEvent, MappingIndex, MappingLoader,
    MappingParams, MappingResult, SiteChange,
};
pub use monitoring::{
    normalize_status, EquipmentState, EquipmentStatus, MonitoringEvent, MonitoringLoader,
    MonitoringParams, MonitoringSnapshot, MonitoringStats, StatusCounts, SubscriptionState,
};
pub use registry::{
    LoadAllParams, LoadOutput, LoaderHandle, LoaderMode, LoaderOverrides, LoaderRegistry,
    ModeResult, RegistryError, RegistryStatus,
};
pub use simulator::{PlantLayout, PlantOp, SimulatedPlant};

/// Prelude module for common imports
pub mod prelude {
    //! Registry, loaders and configuration in one import
    pub use crate::{
        DashboardLoader, DashboardParams, FloorlinkConfig, LoadAllParams, LoaderDeps,
        LoaderHandle, LoaderMode, LoaderRegistry, MappingLoader, MappingParams, MonitoringLoader,
        MonitoringParams, RegistryError,
    };
    pub use floorlink_core::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
