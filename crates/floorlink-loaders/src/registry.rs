//! Loader registry
//!
//! [`LoaderRegistry`] is an explicit object the host creates once and passes
//! around by reference. It holds the shared collaborators and configuration,
//! builds loaders on demand, caches one instance per [`LoaderMode`], and runs
//! batch operations across them with per-loader results.

use crate::config::FloorlinkConfig;
use crate::dashboard::{DashboardLoader, DashboardOutput, DashboardParams};
use crate::deps::LoaderDeps;
use crate::mapping::{MappingLoader, MappingParams, MappingResult};
use crate::monitoring::{MonitoringLoader, MonitoringParams, MonitoringSnapshot};
use floorlink_core::{DataLoader, HealthReport, LoaderError, LoaderStatus};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Kind of data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderMode {
    /// Live equipment status
    Monitoring,
    /// Site id mapping
    Mapping,
    /// Dashboard widgets
    Dashboard,
}

impl LoaderMode {
    /// Every mode, in load order
    pub const ALL: [LoaderMode; 3] = [Self::Mapping, Self::Monitoring, Self::Dashboard];

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring",
            Self::Mapping => "mapping",
            Self::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for LoaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoaderMode {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monitoring" => Ok(Self::Monitoring),
            "mapping" => Ok(Self::Mapping),
            "dashboard" => Ok(Self::Dashboard),
            _ => Err(RegistryError::UnknownMode(s.to_string())),
        }
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// `configure()` was never called
    #[error("registry not configured")]
    NotConfigured,

    /// Unrecognized mode name
    #[error("unknown loader mode: {0}")]
    UnknownMode(String),

    /// Building the loader failed
    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// Per-instance replacements for the registry-wide settings
#[derive(Debug, Clone, Default)]
pub struct LoaderOverrides {
    /// Whole configuration for this instance
    pub config: Option<FloorlinkConfig>,
    /// Collaborators that replace the shared ones
    pub deps: LoaderDeps,
}

/// One concrete loader behind a uniform handle
#[derive(Debug, Clone)]
pub enum LoaderHandle {
    /// See [`MonitoringLoader`]
    Monitoring(Arc<MonitoringLoader>),
    /// See [`MappingLoader`]
    Mapping(Arc<MappingLoader>),
    /// See [`DashboardLoader`]
    Dashboard(Arc<DashboardLoader>),
}

/// Output of a load through a [`LoaderHandle`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", content = "output", rename_all = "lowercase")]
pub enum LoadOutput {
    /// See [`MonitoringSnapshot`]
    Monitoring(MonitoringSnapshot),
    /// See [`MappingResult`]
    Mapping(MappingResult),
    /// See [`DashboardOutput`]
    Dashboard(DashboardOutput),
}

/// Parameters of [`LoaderRegistry::load_all`], one set per mode
#[derive(Debug, Clone, Default)]
pub struct LoadAllParams {
    /// For the monitoring loader
    pub monitoring: MonitoringParams,
    /// For the mapping loader
    pub mapping: MappingParams,
    /// For the dashboard loader
    pub dashboard: DashboardParams,
}

/// Result of one loader in a batch operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeResult<T> {
    /// Loader mode
    pub mode: LoaderMode,
    /// Outcome for that loader
    pub result: Result<T, LoaderError>,
}

/// Registry-wide status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStatus {
    /// `configure()` has been called
    pub configured: bool,
    /// Status of each cached loader
    pub loaders: Vec<LoaderStatus>,
}

macro_rules! dispatch {
    ($handle:expr, $loader:ident => $body:expr) => {
        match $handle {
            LoaderHandle::Monitoring($loader) => $body,
            LoaderHandle::Mapping($loader) => $body,
            LoaderHandle::Dashboard($loader) => $body,
        }
    };
}

impl LoaderHandle {
    /// Mode of the wrapped loader
    #[must_use]
    pub fn mode(&self) -> LoaderMode {
        match self {
            Self::Monitoring(_) => LoaderMode::Monitoring,
            Self::Mapping(_) => LoaderMode::Mapping,
            Self::Dashboard(_) => LoaderMode::Dashboard,
        }
    }

    /// Monitoring loader, if that is what this is
    #[must_use]
    pub fn as_monitoring(&self) -> Option<&Arc<MonitoringLoader>> {
        match self {
            Self::Monitoring(loader) => Some(loader),
            _ => None,
        }
    }

    /// Mapping loader, if that is what this is
    #[must_use]
    pub fn as_mapping(&self) -> Option<&Arc<MappingLoader>> {
        match self {
            Self::Mapping(loader) => Some(loader),
            _ => None,
        }
    }

    /// Dashboard loader, if that is what this is
    #[must_use]
    pub fn as_dashboard(&self) -> Option<&Arc<DashboardLoader>> {
        match self {
            Self::Dashboard(loader) => Some(loader),
            _ => None,
        }
    }

    /// See [`DataLoader::initialize`]
    ///
    /// # Errors
    /// Whatever the loader's initialize fails with
    pub async fn initialize(&self) -> Result<(), LoaderError> {
        dispatch!(self, loader => loader.initialize().await)
    }

    /// Load with the mode's entry of `params`
    ///
    /// # Errors
    /// Whatever the loader's load fails with
    pub async fn load(&self, params: &LoadAllParams) -> Result<LoadOutput, LoaderError> {
        match self {
            Self::Monitoring(loader) => loader.load(params.monitoring).await.map(LoadOutput::Monitoring),
            Self::Mapping(loader) => loader.load(params.mapping.clone()).await.map(LoadOutput::Mapping),
            Self::Dashboard(loader) => loader
                .load(params.dashboard.clone())
                .await
                .map(LoadOutput::Dashboard),
        }
    }

    /// See [`DataLoader::abort`]
    pub fn abort(&self) -> bool {
        dispatch!(self, loader => loader.abort())
    }

    /// See [`DataLoader::dispose`]
    pub async fn dispose(&self) {
        dispatch!(self, loader => loader.dispose().await);
    }

    /// See [`DataLoader::status`]
    #[must_use]
    pub fn status(&self) -> LoaderStatus {
        dispatch!(self, loader => loader.status())
    }

    /// See [`DataLoader::health_check`]
    pub async fn health_check(&self) -> HealthReport {
        dispatch!(self, loader => loader.health_check().await)
    }

    /// See [`DataLoader::reconnect`]
    ///
    /// # Errors
    /// Whatever the loader's reconnect fails with
    pub async fn reconnect(&self) -> Result<(), LoaderError> {
        dispatch!(self, loader => loader.reconnect().await)
    }

    fn is_disposed(&self) -> bool {
        dispatch!(self, loader => loader.core().is_disposed())
    }
}

#[derive(Debug, Default)]
struct Settings {
    deps: Option<LoaderDeps>,
    config: FloorlinkConfig,
}

/// Builds, caches and batch-drives loaders
#[derive(Debug, Default)]
pub struct LoaderRegistry {
    settings: RwLock<Settings>,
    loaders: Mutex<BTreeMap<LoaderMode, LoaderHandle>>,
}

impl LoaderRegistry {
    /// Unconfigured registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set shared collaborators and configuration for loaders built from now on
    pub fn configure(&self, deps: LoaderDeps, config: FloorlinkConfig) {
        debug!(?deps, "registry configured");
        *self.settings.write() = Settings {
            deps: Some(deps),
            config,
        };
    }

    /// Whether `configure()` has been called
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.settings.read().deps.is_some()
    }

    /// Cached loader for `mode`, built and cached on first use.
    ///
    /// `overrides` only apply when a new instance is built.
    ///
    /// # Errors
    /// - `RegistryError::NotConfigured` before `configure()`
    /// - `RegistryError::Loader` when construction fails
    pub async fn get_loader(
        &self,
        mode: LoaderMode,
        overrides: Option<&LoaderOverrides>,
    ) -> Result<LoaderHandle, RegistryError> {
        let cached = self.loaders.lock().get(&mode).cloned();
        match cached {
            Some(handle) if !handle.is_disposed() => Ok(handle),
            _ => self.create_loader(mode, overrides, true).await,
        }
    }

    /// Build a new loader for `mode`.
    ///
    /// With `cache` the instance replaces, and disposes, any cached one;
    /// otherwise the caller owns it outright.
    ///
    /// # Errors
    /// - `RegistryError::NotConfigured` before `configure()`
    /// - `RegistryError::Loader` when construction fails
    pub async fn create_loader(
        &self,
        mode: LoaderMode,
        overrides: Option<&LoaderOverrides>,
        cache: bool,
    ) -> Result<LoaderHandle, RegistryError> {
        let (deps, config) = {
            let settings = self.settings.read();
            let base = settings.deps.as_ref().ok_or(RegistryError::NotConfigured)?;
            match overrides {
                Some(o) => (
                    base.merged_with(&o.deps),
                    o.config.clone().unwrap_or_else(|| settings.config.clone()),
                ),
                None => (base.clone(), settings.config.clone()),
            }
        };

        let handle = match mode {
            LoaderMode::Monitoring => {
                let loader = MonitoringLoader::new(config.monitoring.clone(), config.retry.policy(), &deps);
                if let Some(mapping) = self.cached_mapping() {
                    loader.set_resolver(mapping);
                }
                LoaderHandle::Monitoring(loader)
            }
            LoaderMode::Mapping => LoaderHandle::Mapping(MappingLoader::new(&config, &deps)?),
            LoaderMode::Dashboard => LoaderHandle::Dashboard(DashboardLoader::new(&config, &deps)?),
        };
        info!(%mode, cached = cache, "loader created");

        if cache {
            if let LoaderHandle::Mapping(mapping) = &handle {
                let monitoring = self.cached(LoaderMode::Monitoring);
                if let Some(monitoring) = monitoring.as_ref().and_then(LoaderHandle::as_monitoring) {
                    monitoring.set_resolver(mapping.clone());
                }
            }
            let replaced = self.loaders.lock().insert(mode, handle.clone());
            if let Some(old) = replaced {
                old.dispose().await;
            }
        }
        Ok(handle)
    }

    /// Cached loader for `mode` without building one
    #[must_use]
    pub fn cached(&self, mode: LoaderMode) -> Option<LoaderHandle> {
        self.loaders.lock().get(&mode).cloned()
    }

    fn cached_mapping(&self) -> Option<Arc<MappingLoader>> {
        self.cached(LoaderMode::Mapping)
            .and_then(|handle| handle.as_mapping().cloned())
            .filter(|mapping| !mapping.core().is_disposed())
    }

    /// Dispose and forget the cached loader for `mode`
    pub async fn remove_loader(&self, mode: LoaderMode) -> bool {
        let removed = self.loaders.lock().remove(&mode);
        match removed {
            Some(handle) => {
                handle.dispose().await;
                debug!(%mode, "loader removed");
                true
            }
            None => false,
        }
    }

    /// Dispose every cached loader
    pub async fn dispose_all(&self) {
        let handles: Vec<LoaderHandle> = std::mem::take(&mut *self.loaders.lock())
            .into_values()
            .collect();
        let count = handles.len();
        join_all(handles.iter().map(LoaderHandle::dispose)).await;
        info!(count, "all loaders disposed");
    }

    /// Initialize every cached loader; one failure never stops the others
    pub async fn initialize_all(&self) -> Vec<ModeResult<()>> {
        let handles = self.handles();
        let results = join_all(handles.iter().map(LoaderHandle::initialize)).await;
        per_mode(&handles, results, "initialize")
    }

    /// Load every cached loader concurrently; one failure never stops the others
    pub async fn load_all(&self, params: &LoadAllParams) -> Vec<ModeResult<LoadOutput>> {
        let handles = self.handles();
        let results = join_all(handles.iter().map(|handle| handle.load(params))).await;
        per_mode(&handles, results, "load")
    }

    /// Health of every cached loader
    pub async fn health_all(&self) -> Vec<HealthReport> {
        let handles = self.handles();
        join_all(handles.iter().map(LoaderHandle::health_check)).await
    }

    /// Configuration flag and status of every cached loader
    #[must_use]
    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            configured: self.is_configured(),
            loaders: self.handles().iter().map(LoaderHandle::status).collect(),
        }
    }

    /// Dispose everything and forget the configuration
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn reset(&self) {
        self.dispose_all().await;
        *self.settings.write() = Settings::default();
    }

    /// Cached handles in load order
    fn handles(&self) -> Vec<LoaderHandle> {
        let loaders = self.loaders.lock();
        LoaderMode::ALL
            .iter()
            .filter_map(|mode| loaders.get(mode).cloned())
            .collect()
    }
}

fn per_mode<T>(
    handles: &[LoaderHandle],
    results: Vec<Result<T, LoaderError>>,
    operation: &str,
) -> Vec<ModeResult<T>> {
    handles
        .iter()
        .zip(results)
        .map(|(handle, result)| {
            if let Err(error) = &result {
                warn!(mode = %handle.mode(), operation, error = %error, "loader failed in batch");
            }
            ModeResult {
                mode: handle.mode(),
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use floorlink_core::{LoaderState, PushMessage, PushSignal};
    use floorlink_test_utils::{
        site_payload, three_unit_snapshot, ChannelPush, CountingDashboardApi, CountingMonitoringApi,
        MockMappingApi,
    };
    use pretty_assertions::assert_eq;

    fn mapping_api() -> MockMappingApi {
        let mut api = MockMappingApi::new();
        api.expect_fetch_current_site().returning(|| Ok(site_payload("home", 3)));
        api.expect_fetch_site().returning(|site| Ok(site_payload(site, 3)));
        api
    }

    fn configured() -> LoaderRegistry {
        let registry = LoaderRegistry::new();
        registry.configure(
            LoaderDeps::new()
                .with_monitoring_api(CountingMonitoringApi::new(three_unit_snapshot()))
                .with_mapping_api(Arc::new(mapping_api()))
                .with_dashboard_api(CountingDashboardApi::new()),
            FloorlinkConfig::default(),
        );
        registry
    }

    #[test]
    fn modes_parse() {
        assert_eq!("Monitoring".parse::<LoaderMode>(), Ok(LoaderMode::Monitoring));
        assert_eq!(" dashboard ".parse::<LoaderMode>(), Ok(LoaderMode::Dashboard));
        assert_eq!(
            "kiosk".parse::<LoaderMode>(),
            Err(RegistryError::UnknownMode("kiosk".into()))
        );
        for mode in LoaderMode::ALL {
            assert_eq!(mode.to_string().parse::<LoaderMode>(), Ok(mode));
        }
    }

    #[tokio::test]
    async fn unconfigured_registry_refuses() {
        let registry = LoaderRegistry::new();
        let err = registry.get_loader(LoaderMode::Mapping, None).await.unwrap_err();
        assert_eq!(err, RegistryError::NotConfigured);
        assert!(!registry.status().configured);
    }

    #[tokio::test]
    async fn get_loader_caches_one_instance() {
        let registry = configured();
        let a = registry.get_loader(LoaderMode::Mapping, None).await.unwrap();
        let b = registry.get_loader(LoaderMode::Mapping, None).await.unwrap();
        assert_eq!(a.status().instance_id, b.status().instance_id);

        let fresh = registry.create_loader(LoaderMode::Mapping, None, false).await.unwrap();
        assert_ne!(fresh.status().instance_id, a.status().instance_id);
        assert_eq!(registry.status().loaders.len(), 1);
    }

    #[tokio::test]
    async fn cached_replacement_disposes_previous() {
        let registry = configured();
        let first = registry.get_loader(LoaderMode::Dashboard, None).await.unwrap();
        let second = registry.create_loader(LoaderMode::Dashboard, None, true).await.unwrap();

        assert_eq!(first.status().state, LoaderState::Disposed);
        assert_eq!(second.status().state, LoaderState::Idle);
    }

    #[tokio::test]
    async fn overrides_replace_single_collaborators() {
        let registry = configured();
        let overrides = LoaderOverrides {
            deps: LoaderDeps {
                monitoring_api: None,
                ..LoaderDeps::new()
            },
            config: Some(FloorlinkConfig::default().with_monitoring(
                crate::config::MonitoringConfig::default().with_hybrid(false),
            )),
        };
        let handle = registry
            .create_loader(LoaderMode::Monitoring, Some(&overrides), false)
            .await
            .unwrap();
        // shared snapshot client still applies
        assert_eq!(handle.initialize().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn monitoring_resolves_ids_through_mapping() {
        let registry = configured();
        let push = ChannelPush::new();
        let overrides = LoaderOverrides {
            deps: LoaderDeps::new().with_push(push.clone()),
            config: None,
        };
        registry.get_loader(LoaderMode::Mapping, None).await.unwrap();
        registry.get_loader(LoaderMode::Monitoring, Some(&overrides)).await.unwrap();

        let init = registry.initialize_all().await;
        assert!(init.iter().all(|r| r.result.is_ok()));
        let mapping = registry.cached(LoaderMode::Mapping).unwrap();
        mapping.load(&LoadAllParams::default()).await.unwrap();
        let loaded = registry.load_all(&LoadAllParams::default()).await;
        assert_eq!(
            loaded.iter().map(|r| r.mode).collect::<Vec<_>>(),
            vec![LoaderMode::Mapping, LoaderMode::Monitoring]
        );

        let monitoring = registry.cached(LoaderMode::Monitoring).unwrap();
        let monitoring = monitoring.as_monitoring().unwrap();
        assert_eq!(monitoring.equipment("eq-2").unwrap().frontend_id.as_deref(), Some("fe-2"));

        push.send(PushSignal::Message(PushMessage::new("eq-3", "stopped")));
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(monitoring.equipment("eq-3").unwrap().frontend_id.as_deref(), Some("fe-3"));
    }

    #[tokio::test]
    async fn load_all_isolates_failures() {
        let registry = LoaderRegistry::new();
        let mut failing = MockMappingApi::new();
        failing
            .expect_fetch_current_site()
            .returning(|| Err(LoaderError::validation("bad table")));
        registry.configure(
            LoaderDeps::new()
                .with_monitoring_api(CountingMonitoringApi::new(three_unit_snapshot()))
                .with_mapping_api(Arc::new(failing)),
            FloorlinkConfig::default(),
        );
        for mode in [LoaderMode::Mapping, LoaderMode::Monitoring] {
            registry.get_loader(mode, None).await.unwrap();
        }
        registry.initialize_all().await;

        let results = registry.load_all(&LoadAllParams::default()).await;

        assert!(matches!(results[0].result, Err(LoaderError::Validation(_))));
        assert!(matches!(results[1].result, Ok(LoadOutput::Monitoring(_))));
    }

    #[tokio::test]
    async fn remove_and_reset() {
        let registry = configured();
        let handle = registry.get_loader(LoaderMode::Mapping, None).await.unwrap();
        assert!(registry.remove_loader(LoaderMode::Mapping).await);
        assert!(!registry.remove_loader(LoaderMode::Mapping).await);
        assert_eq!(handle.status().state, LoaderState::Disposed);

        registry.get_loader(LoaderMode::Dashboard, None).await.unwrap();
        registry.reset().await;
        assert_eq!(
            registry.status(),
            RegistryStatus {
                configured: false,
                loaders: Vec::new()
            }
        );
    }
}
