//! Site-scoped equipment id mapping
//!
//! [`MappingLoader`] loads one site's frontend id → equipment id table,
//! cache-aside, and serves lookups in both directions from an immutable
//! [`MappingIndex`]. A rebuilt index replaces the previous one in a single
//! swap.

mod index;
mod legacy;

pub use index::{MappingIndex, MappingResult};
pub use legacy::{
    LegacyMappingRow, LegacySiteConfig, LegacySiteConfigAdapter, LegacySiteConfigSource,
    LEGACY_API_VERSION,
};

use crate::config::{FloorlinkConfig, MappingConfig};
use crate::deps::{require, LoaderDeps};
use async_trait::async_trait;
use chrono::Utc;
use floorlink_cache::{CachePriority, CacheStore};
use floorlink_core::{
    with_retry, with_timeout, CancellationToken, DataLoader, EditState, EquipmentName,
    HealthReport, IdResolver, LifecycleEvent, LoaderCore, LoaderError, LoaderEvent, MappingApi,
    MappingEntry, MappingPayload, RetryPolicy, MAPPING_API_VERSION,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CURRENT_SITE_KEY: &str = "mapping:current";
const NAMES_KEY: &str = "mapping:names";

fn site_key(site_id: &str) -> String {
    format!("mapping:site:{site_id}")
}

/// Parameters of [`MappingLoader::load`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingParams {
    /// Site to load; `None` loads the backend's current site
    pub site_id: Option<String>,
    /// Skip the cache
    pub force_refresh: bool,
}

impl MappingParams {
    /// Load a specific site
    #[must_use]
    pub fn site(site_id: impl Into<String>) -> Self {
        Self {
            site_id: Some(site_id.into()),
            force_refresh: false,
        }
    }

    /// Bypass the cache
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Outcome of a site change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteChange {
    /// Site before the change
    pub previous: Option<String>,
    /// Requested site
    pub current: String,
    /// Whether the new table loaded
    pub success: bool,
    /// Mappings loaded, on success
    pub count: Option<usize>,
    /// Failure, otherwise
    pub error: Option<String>,
}

/// Events of [`MappingLoader`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MappingEvent {
    /// Shared lifecycle event
    Lifecycle(LifecycleEvent),
    /// A new index is live
    MappingLoaded(MappingResult),
    /// `change_site` finished
    SiteChanged(SiteChange),
    /// Mappings were pushed into the edit state
    EditStateApplied {
        /// Site of the applied table
        site_id: Option<String>,
        /// Entries accepted
        applied: usize,
    },
}

impl MappingEvent {
    /// Name of [`MappingEvent::MappingLoaded`]
    pub const MAPPING_LOADED: &'static str = "mappingLoaded";
    /// Name of [`MappingEvent::SiteChanged`]
    pub const SITE_CHANGED: &'static str = "siteChanged";
    /// Name of [`MappingEvent::EditStateApplied`]
    pub const EDIT_STATE_APPLIED: &'static str = "editStateApplied";
}

impl LoaderEvent for MappingEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Lifecycle(event) => event.name(),
            Self::MappingLoaded(_) => Self::MAPPING_LOADED,
            Self::SiteChanged(_) => Self::SITE_CHANGED,
            Self::EditStateApplied { .. } => Self::EDIT_STATE_APPLIED,
        }
    }
}

impl From<LifecycleEvent> for MappingEvent {
    fn from(event: LifecycleEvent) -> Self {
        Self::Lifecycle(event)
    }
}

/// Cached backend responses
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum Cached {
    Site(MappingPayload),
    Names(Vec<EquipmentName>),
}

/// Cache-aside loader for site mapping tables
pub struct MappingLoader {
    core: LoaderCore<MappingEvent>,
    config: MappingConfig,
    retry: RetryPolicy,
    api: Option<Arc<dyn MappingApi>>,
    edit_state: Option<Arc<dyn EditState>>,
    cache: CacheStore<Cached>,
    index: RwLock<Arc<MappingIndex>>,
    last: Mutex<Option<MappingResult>>,
}

impl MappingLoader {
    /// Loader name used in logs and bus event names
    pub const NAME: &'static str = "mapping";

    /// Create loader in `Idle`.
    ///
    /// # Errors
    /// `LoaderError::Initialization` when the cache settings are invalid
    pub fn new(config: &FloorlinkConfig, deps: &LoaderDeps) -> Result<Arc<Self>, LoaderError> {
        let policy = config
            .ttl_policy(CachePriority::Static)
            .map_err(|e| LoaderError::Initialization(e.to_string()))?;
        let cache = CacheStore::new(config.cache.max_size_bytes, policy)
            .map_err(|e| LoaderError::Initialization(e.to_string()))?;

        Ok(Arc::new(Self {
            core: LoaderCore::new(Self::NAME, deps.bus.clone()),
            config: config.mapping.clone(),
            retry: config.retry.policy(),
            api: deps.mapping_api.clone(),
            edit_state: deps.edit_state.clone(),
            cache,
            index: RwLock::new(Arc::new(MappingIndex::default())),
            last: Mutex::new(None),
        }))
    }

    /// Current index
    #[must_use]
    pub fn index(&self) -> Arc<MappingIndex> {
        self.index.read().clone()
    }

    /// Entry for a frontend id
    #[must_use]
    pub fn lookup(&self, frontend_id: &str) -> Option<MappingEntry> {
        self.index.read().lookup(frontend_id).cloned()
    }

    /// Frontend id for an equipment id
    #[must_use]
    pub fn reverse_lookup(&self, equipment_id: &str) -> Option<String> {
        self.index.read().reverse_lookup(equipment_id).map(str::to_string)
    }

    /// All entries ordered by frontend id
    #[must_use]
    pub fn entries(&self) -> Vec<MappingEntry> {
        self.index.read().entries().cloned().collect()
    }

    /// Site of the live index
    #[must_use]
    pub fn current_site(&self) -> Option<String> {
        self.index.read().site_id().map(str::to_string)
    }

    /// Number of mappings in the live index
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.read().len()
    }

    /// Switch to `site_id`.
    ///
    /// Returns the cached summary without fetching when the loader is
    /// initialized and already on `site_id`. Otherwise clears the cache,
    /// loads the new site and emits [`MappingEvent::SiteChanged`].
    ///
    /// # Errors
    /// Whatever the underlying load fails with
    pub async fn change_site(&self, site_id: &str) -> Result<MappingResult, LoaderError> {
        if self.core.is_disposed() {
            return Err(self.core.reject("change_site"));
        }
        let previous = self.current_site();
        if self.core.is_initialized() && previous.as_deref() == Some(site_id) {
            if let Some(result) = self.last.lock().clone() {
                debug!(loader = Self::NAME, site_id, "already on site");
                return Ok(result);
            }
        }

        info!(loader = Self::NAME, from = ?previous, to = site_id, "changing site");
        self.cache.clear();
        let outcome = self.load(MappingParams::site(site_id).forced()).await;

        self.core.emit(MappingEvent::SiteChanged(SiteChange {
            previous,
            current: site_id.to_string(),
            success: outcome.is_ok(),
            count: outcome.as_ref().ok().map(|r| r.count),
            error: outcome.as_ref().err().map(ToString::to_string),
        }));
        outcome
    }

    /// Equipment names available for mapping, cache-aside.
    ///
    /// # Errors
    /// - `LoaderError::State` when disposed or not initialized
    /// - fetch failures after retries
    pub async fn equipment_names(&self) -> Result<Vec<EquipmentName>, LoaderError> {
        if self.core.is_disposed() || !self.core.is_initialized() {
            return Err(self.core.reject("equipment_names"));
        }
        if let Some(Cached::Names(names)) = self.cache.get_fresh(NAMES_KEY) {
            return Ok(names);
        }
        let api = require(self.api.as_ref(), "mapping api")?;
        let timeout = self.config.request_timeout();
        let names = with_retry(&self.retry, &CancellationToken::new(), |_| {
            let api = api.clone();
            async move { with_timeout(timeout, api.fetch_equipment_names()).await }
        })
        .await?;
        self.cache
            .set(NAMES_KEY, Cached::Names(names.clone()), self.config.cache_ttl());
        Ok(names)
    }

    /// Push the live index into the edit state.
    ///
    /// # Errors
    /// `LoaderError::MissingDependency` when no edit state was injected
    pub fn apply_to_edit_state(&self) -> Result<usize, LoaderError> {
        let edit_state = require(self.edit_state.as_ref(), "edit state")?;
        Ok(self.apply_index(&edit_state, &self.index()))
    }

    fn apply_index(&self, edit_state: &Arc<dyn EditState>, index: &MappingIndex) -> usize {
        let entries: Vec<MappingEntry> = index.entries().cloned().collect();
        let applied = edit_state.apply_mappings(index.site_id(), &entries);
        debug!(loader = Self::NAME, applied, "mappings applied to edit state");
        self.core.emit(MappingEvent::EditStateApplied {
            site_id: index.site_id().map(str::to_string),
            applied,
        });
        applied
    }

    async fn fetch_payload(
        &self,
        site_id: Option<&str>,
        token: &CancellationToken,
    ) -> Result<MappingPayload, LoaderError> {
        let api = require(self.api.as_ref(), "mapping api")?;
        let timeout = self.config.request_timeout();
        with_retry(&self.retry, token, |_| {
            let api = api.clone();
            let site_id = site_id.map(str::to_string);
            async move {
                match site_id {
                    Some(site) => with_timeout(timeout, api.fetch_site(&site)).await,
                    None => with_timeout(timeout, api.fetch_current_site()).await,
                }
            }
        })
        .await
    }

    async fn run_load(
        &self,
        params: MappingParams,
        token: CancellationToken,
    ) -> Result<MappingResult, LoaderError> {
        let key = params
            .site_id
            .as_deref()
            .map_or_else(|| CURRENT_SITE_KEY.to_string(), site_key);

        let cached = if params.force_refresh {
            None
        } else {
            match self.cache.get_fresh(&key) {
                Some(Cached::Site(payload)) => Some(payload),
                _ => None,
            }
        };

        let requested = params.site_id.as_deref();
        let index = match cached {
            Some(payload) => {
                debug!(loader = Self::NAME, key = %key, "cache hit");
                MappingIndex::build(payload, requested, Utc::now())?
            }
            None => {
                let payload = self.fetch_payload(requested, &token).await?;
                // only payloads that index cleanly are cached
                let index = MappingIndex::build(payload.clone(), requested, Utc::now())?;
                let ttl = self.config.cache_ttl();
                if let Some(site) = payload.site_id.as_deref() {
                    self.cache.set(site_key(site), Cached::Site(payload.clone()), ttl);
                }
                if requested.is_none() {
                    self.cache.set(CURRENT_SITE_KEY, Cached::Site(payload), ttl);
                }
                index
            }
        };

        let index = Arc::new(index);
        let result = index.summary();
        *self.index.write() = index.clone();
        info!(loader = Self::NAME, site_id = ?result.site_id, count = result.count, "mapping loaded");
        self.core.emit(MappingEvent::MappingLoaded(result.clone()));

        if self.config.auto_apply {
            if let Some(edit_state) = &self.edit_state {
                self.apply_index(edit_state, &index);
            }
        }
        Ok(result)
    }
}

impl IdResolver for MappingLoader {
    fn frontend_id_for(&self, equipment_id: &str) -> Option<String> {
        self.reverse_lookup(equipment_id)
    }
}

impl std::fmt::Debug for MappingLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingLoader")
            .field("state", &self.core.state())
            .field("site", &self.current_site())
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataLoader for MappingLoader {
    type Params = MappingParams;
    type Output = MappingResult;
    type Event = MappingEvent;

    fn core(&self) -> &LoaderCore<MappingEvent> {
        &self.core
    }

    async fn initialize(&self) -> Result<(), LoaderError> {
        self.core
            .initialize_with(|| async {
                let api = require(self.api.as_ref(), "mapping api")?;
                let version = api.api_version();
                if version != MAPPING_API_VERSION {
                    info!(loader = Self::NAME, version, "mapping source behind adapter");
                }
                Ok(())
            })
            .await
    }

    async fn load(&self, params: MappingParams) -> Result<MappingResult, LoaderError> {
        self.core
            .load_with(&self.last, |token| self.run_load(params, token))
            .await
    }

    async fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        self.cache.clear();
        *self.index.write() = Arc::new(MappingIndex::default());
        *self.last.lock() = None;
        self.core.finish_dispose();
    }

    async fn health_check(&self) -> HealthReport {
        let mut report = self.core.health();
        let index = self.index();
        if index.loaded_at().is_some() && !index.connected() {
            warn!(loader = Self::NAME, site_id = ?index.site_id(), "site reports disconnected");
            report.push_issue("site reports disconnected");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floorlink_core::LoaderState;
    use floorlink_test_utils::{site_payload, MockMappingApi, RecordingEditState};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn loader(api: MockMappingApi, deps: LoaderDeps) -> Arc<MappingLoader> {
        let config = FloorlinkConfig::default().with_retry(crate::config::RetrySettings {
            retries: 0,
            ..Default::default()
        });
        MappingLoader::new(&config, &deps.with_mapping_api(Arc::new(api))).unwrap()
    }

    #[tokio::test]
    async fn load_site_builds_index() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site()
            .with(eq("site_x"))
            .times(1)
            .returning(|site| Ok(site_payload(site, 4)));
        let loader = loader(api, LoaderDeps::new());
        loader.initialize().await.unwrap();

        let result = loader.load(MappingParams::site("site_x")).await.unwrap();

        assert_eq!(
            result,
            MappingResult {
                connected: true,
                site_id: Some("site_x".into()),
                count: 4
            }
        );
        for entry in loader.entries() {
            assert_eq!(loader.reverse_lookup(&entry.equipment_id), Some(entry.frontend_id.clone()));
        }
        assert_eq!(loader.frontend_id_for("eq-3").as_deref(), Some("fe-3"));
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site().times(2).returning(|site| Ok(site_payload(site, 2)));
        let loader = loader(api, LoaderDeps::new());
        loader.initialize().await.unwrap();

        loader.load(MappingParams::site("a")).await.unwrap();
        loader.load(MappingParams::site("a")).await.unwrap();
        loader.load(MappingParams::site("a").forced()).await.unwrap();
    }

    #[tokio::test]
    async fn current_site_uses_its_own_endpoint() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_current_site()
            .times(1)
            .returning(|| Ok(site_payload("home", 1)));
        api.expect_fetch_site().never();
        let loader = loader(api, LoaderDeps::new());
        loader.initialize().await.unwrap();

        let result = loader.load(MappingParams::default()).await.unwrap();
        assert_eq!(result.site_id.as_deref(), Some("home"));

        // already there, no second fetch
        let again = loader.change_site("home").await.unwrap();
        assert_eq!(again.count, 1);
    }

    #[tokio::test]
    async fn invalid_payload_keeps_previous_index() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site()
            .with(eq("good"))
            .returning(|site| Ok(site_payload(site, 2)));
        api.expect_fetch_site().with(eq("bad")).returning(|_| {
            let mut payload = site_payload("bad", 2);
            payload.mappings.get_mut("fe-2").unwrap().equipment_id = "eq-1".into();
            Ok(payload)
        });
        let loader = loader(api, LoaderDeps::new());
        loader.initialize().await.unwrap();
        loader.load(MappingParams::site("good")).await.unwrap();

        let err = loader.load(MappingParams::site("bad")).await.unwrap_err();

        assert!(matches!(err, LoaderError::Validation(_)));
        assert_eq!(loader.core().state(), LoaderState::Error);
        assert_eq!(loader.current_site().as_deref(), Some("good"));
        assert_eq!(loader.count(), 2);
    }

    #[tokio::test]
    async fn rejected_payload_is_not_cached() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        let mut api = MockMappingApi::new();
        api.expect_fetch_site().times(2).returning(move |site| {
            let mut payload = site_payload(site, 2);
            if seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                payload.mappings.get_mut("fe-2").unwrap().equipment_id = "eq-1".into();
            }
            Ok(payload)
        });
        let loader = loader(api, LoaderDeps::new());
        loader.initialize().await.unwrap();

        let err = loader.load(MappingParams::site("s")).await.unwrap_err();
        assert!(matches!(err, LoaderError::Validation(_)));

        let result = loader.load(MappingParams::site("s")).await.unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn change_site_reloads_and_notifies() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site().returning(|site| Ok(site_payload(site, 3)));
        let loader = loader(api, LoaderDeps::new());
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        loader.on(MappingEvent::SITE_CHANGED, move |e| {
            if let MappingEvent::SiteChanged(change) = e {
                sink.lock().push(change.clone());
            }
        });
        loader.initialize().await.unwrap();
        loader.load(MappingParams::site("a")).await.unwrap();

        loader.change_site("b").await.unwrap();

        assert_eq!(loader.current_site().as_deref(), Some("b"));
        assert_eq!(
            changes.lock().as_slice(),
            [SiteChange {
                previous: Some("a".into()),
                current: "b".into(),
                success: true,
                count: Some(3),
                error: None,
            }]
        );
    }

    #[tokio::test]
    async fn auto_apply_to_edit_state() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site().returning(|site| Ok(site_payload(site, 2)));
        let edit_state = RecordingEditState::new();
        let loader = loader(api, LoaderDeps::new().with_edit_state(edit_state.clone()));
        loader.initialize().await.unwrap();

        loader.load(MappingParams::site("a")).await.unwrap();

        let (site, entries) = edit_state.last().unwrap();
        assert_eq!(site.as_deref(), Some("a"));
        assert_eq!(entries.len(), 2);
        assert_eq!(loader.apply_to_edit_state(), Ok(2));
        assert_eq!(edit_state.call_count(), 2);
    }

    #[tokio::test]
    async fn auto_apply_can_be_disabled() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site().returning(|site| Ok(site_payload(site, 2)));
        let edit_state = RecordingEditState::new();
        let mut config = FloorlinkConfig::default();
        config.mapping = config.mapping.with_auto_apply(false);
        let deps = LoaderDeps::new()
            .with_edit_state(edit_state.clone())
            .with_mapping_api(Arc::new(api));
        let loader = MappingLoader::new(&config, &deps).unwrap();
        loader.initialize().await.unwrap();

        loader.load(MappingParams::site("a")).await.unwrap();
        assert_eq!(edit_state.call_count(), 0);
    }

    #[tokio::test]
    async fn equipment_names_cache_aside() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_equipment_names().times(1).returning(|| {
            Ok(vec![EquipmentName {
                equipment_id: "eq-1".into(),
                equipment_name: "Press".into(),
                equipment_code: None,
            }])
        });
        let loader = loader(api, LoaderDeps::new());
        assert!(loader.equipment_names().await.is_err());
        loader.initialize().await.unwrap();

        assert_eq!(loader.equipment_names().await.unwrap().len(), 1);
        assert_eq!(loader.equipment_names().await.unwrap()[0].equipment_name, "Press");
    }

    #[tokio::test]
    async fn dispose_clears_index() {
        let mut api = MockMappingApi::new();
        api.expect_fetch_site().returning(|site| Ok(site_payload(site, 2)));
        let loader = loader(api, LoaderDeps::new());
        loader.initialize().await.unwrap();
        loader.load(MappingParams::site("a")).await.unwrap();

        loader.dispose().await;

        assert_eq!(loader.count(), 0);
        assert_eq!(loader.reverse_lookup("eq-1"), None);
        assert!(matches!(
            loader.change_site("a").await,
            Err(LoaderError::State { operation: "change_site", .. })
        ));
    }
}
