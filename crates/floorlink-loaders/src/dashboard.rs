//! Priority-tiered widget data
//!
//! Every widget has a [`WidgetConfig`] naming its cache tier and refresh
//! strategy. Reads are stale-while-revalidate: an expired value is served
//! at once, flagged `stale`, while a single background refresh replaces it.
//! Widgets that poll get one timer each, running at their tier's interval
//! until cancelled or the loader is disposed.

use crate::config::{DashboardConfig, FloorlinkConfig};
use crate::deps::{host_hidden, require, LoaderDeps};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use floorlink_cache::{CachePriority, CacheStore, WidgetConfig};
use floorlink_core::{
    with_retry, with_timeout, CancellationToken, DashboardApi, DataLoader, HealthReport,
    HostVisibility, LifecycleEvent, LoaderCore, LoaderError, LoaderEvent, RetryPolicy,
};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

const POLL_PREFIX: &str = "poll:";
const REFRESH_PREFIX: &str = "refresh:";

fn cache_key(widget: &str) -> String {
    format!("widget:{widget}")
}

/// Where a widget value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateSource {
    /// Foreground fetch on a cache miss
    Fetch,
    /// Background or scheduled refresh
    Refresh,
    /// Pushed by the backend
    Push,
}

/// Value handed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetValue {
    /// Widget payload
    pub value: Value,
    /// Served past its TTL; a refresh is under way
    pub stale: bool,
    /// When the payload was fetched or pushed
    pub fetched_at: DateTime<Utc>,
}

/// Per-widget outcome of a batch load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetResult {
    /// Widget name
    pub widget: String,
    /// Value or the error that widget failed with
    pub result: Result<WidgetValue, LoaderError>,
}

impl WidgetResult {
    /// Whether this widget loaded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Parameters of [`DashboardLoader::load`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardParams {
    /// Widgets to load; empty loads every registered widget
    pub widgets: Vec<String>,
    /// Ignore cached values
    pub force_refresh: bool,
}

impl DashboardParams {
    /// Load the named widgets
    #[must_use]
    pub fn widgets<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            widgets: names.into_iter().map(Into::into).collect(),
            force_refresh: false,
        }
    }
}

/// Output of [`DashboardLoader::load`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardOutput {
    /// One entry per requested widget, in request order
    pub widgets: Vec<WidgetResult>,
    /// Widgets that loaded
    pub loaded: usize,
    /// Widgets that failed
    pub failed: usize,
    /// Completion time
    pub loaded_at: DateTime<Utc>,
}

/// Events of [`DashboardLoader`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DashboardEvent {
    /// Shared lifecycle event
    Lifecycle(LifecycleEvent),
    /// A widget has a new value. Emitted on every replace, equal or not.
    WidgetUpdated {
        /// Widget name
        widget: String,
        /// New payload
        value: Value,
        /// Origin of the value
        source: UpdateSource,
        /// When it was fetched
        fetched_at: DateTime<Utc>,
    },
    /// A widget fetch failed; any cached value is kept
    WidgetFailed {
        /// Widget name
        widget: String,
        /// Failure
        message: String,
    },
}

impl DashboardEvent {
    /// Name of [`DashboardEvent::WidgetUpdated`]
    pub const WIDGET_UPDATED: &'static str = "widgetUpdated";
    /// Name of [`DashboardEvent::WidgetFailed`]
    pub const WIDGET_FAILED: &'static str = "widgetFailed";
}

impl LoaderEvent for DashboardEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Lifecycle(event) => event.name(),
            Self::WidgetUpdated { .. } => Self::WIDGET_UPDATED,
            Self::WidgetFailed { .. } => Self::WIDGET_FAILED,
        }
    }
}

impl From<LifecycleEvent> for DashboardEvent {
    fn from(event: LifecycleEvent) -> Self {
        Self::Lifecycle(event)
    }
}

#[derive(Debug, Clone, Serialize)]
struct CachedWidget {
    value: Value,
    fetched_at: DateTime<Utc>,
}

/// Widget loader with tiered caching and per-widget refresh timers
pub struct DashboardLoader {
    core: LoaderCore<DashboardEvent>,
    me: Weak<Self>,
    config: DashboardConfig,
    retry: RetryPolicy,
    api: Option<Arc<dyn DashboardApi>>,
    visibility: Option<Arc<dyn HostVisibility>>,
    cache: CacheStore<CachedWidget>,
    widgets: RwLock<BTreeMap<String, WidgetConfig>>,
    refreshing: Mutex<HashSet<String>>,
    failing: Mutex<BTreeSet<String>>,
    shutdown: CancellationToken,
    last: Mutex<Option<DashboardOutput>>,
}

impl DashboardLoader {
    /// Loader name used in logs and bus event names
    pub const NAME: &'static str = "dashboard";

    /// Create loader in `Idle` and register the configured widgets.
    ///
    /// # Errors
    /// `LoaderError::Initialization` when the cache settings are invalid
    pub fn new(config: &FloorlinkConfig, deps: &LoaderDeps) -> Result<Arc<Self>, LoaderError> {
        let policy = config
            .ttl_policy(config.dashboard.default_widget.priority)
            .map_err(|e| LoaderError::Initialization(e.to_string()))?;
        let cache = CacheStore::new(config.cache.max_size_bytes, policy)
            .map_err(|e| LoaderError::Initialization(e.to_string()))?;

        let loader = Arc::new_cyclic(|me| Self {
            core: LoaderCore::new(Self::NAME, deps.bus.clone()),
            me: me.clone(),
            config: config.dashboard.clone(),
            retry: config.retry.policy(),
            api: deps.dashboard_api.clone(),
            visibility: deps.visibility.clone(),
            cache,
            widgets: RwLock::new(BTreeMap::new()),
            refreshing: Mutex::new(HashSet::new()),
            failing: Mutex::new(BTreeSet::new()),
            shutdown: CancellationToken::new(),
            last: Mutex::new(None),
        });
        for (name, widget) in &config.dashboard.widgets {
            loader.register_widget(name.clone(), *widget);
        }
        Ok(loader)
    }

    /// Declare or replace a widget's settings.
    ///
    /// A widget already on a timer is rescheduled under the new settings.
    pub fn register_widget(&self, name: impl Into<String>, config: WidgetConfig) {
        let name = name.into();
        if let Err(error) = self.cache.declare_priority(&cache_key(&name), config.priority) {
            debug!(loader = Self::NAME, widget = %name, error = %error, "priority not declared");
        }
        let scheduled = self.core.timers().is_active(&poll_key(&name));
        self.widgets.write().insert(name.clone(), config);
        debug!(loader = Self::NAME, widget = %name, priority = config.priority.as_str(), "widget registered");
        if scheduled {
            self.schedule_widget(&name, true);
        }
    }

    /// Settings in effect for `name`
    #[must_use]
    pub fn widget_config(&self, name: &str) -> WidgetConfig {
        self.widgets
            .read()
            .get(name)
            .copied()
            .unwrap_or(self.config.default_widget)
    }

    /// Registered widget names
    #[must_use]
    pub fn widget_names(&self) -> Vec<String> {
        self.widgets.read().keys().cloned().collect()
    }

    /// Widgets with a live refresh timer
    #[must_use]
    pub fn scheduled_widgets(&self) -> Vec<String> {
        self.core
            .timers()
            .active_keys()
            .into_iter()
            .filter_map(|key| key.strip_prefix(POLL_PREFIX).map(str::to_string))
            .collect()
    }

    /// Stop the timer and any background refresh of `name`
    pub fn cancel_refresh(&self, name: &str) -> bool {
        let polled = self.core.timers().cancel(&poll_key(name));
        let refreshing = self.core.timers().cancel(&refresh_key(name));
        self.refreshing.lock().remove(name);
        polled || refreshing
    }

    /// Drop cached values whose widget name matches `pattern` (`*` wildcard)
    pub fn invalidate(&self, pattern: &str) -> usize {
        if pattern.is_empty() {
            return 0;
        }
        let removed = self.cache.invalidate(&cache_key(pattern));
        debug!(loader = Self::NAME, pattern, removed, "widgets invalidated");
        removed
    }

    /// Cached value of `name` without fetching, stale or not
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<WidgetValue> {
        self.cache.lookup(&cache_key(name)).map(|hit| WidgetValue {
            stale: !hit.is_fresh(),
            value: hit.value.value,
            fetched_at: hit.value.fetched_at,
        })
    }

    /// Value of one widget.
    ///
    /// Fresh hits return at once. Stale hits return at once too and start a
    /// background refresh unless one is already running. Misses are fetched.
    ///
    /// # Errors
    /// - `LoaderError::State` when disposed or not initialized
    /// - fetch failures on a miss
    pub async fn load_widget(&self, name: &str) -> Result<WidgetValue, LoaderError> {
        if self.core.is_disposed() || !self.core.is_initialized() {
            return Err(self.core.reject("load_widget"));
        }
        if let Some(value) = self.serve_cached(name) {
            return Ok(value);
        }
        self.fetch_and_store(name, UpdateSource::Fetch, &self.shutdown.child_token())
            .await
    }

    /// Values of several widgets; one failure never aborts the others.
    ///
    /// # Errors
    /// `LoaderError::State` when disposed or not initialized
    pub async fn load_widgets(&self, names: &[String]) -> Result<Vec<WidgetResult>, LoaderError> {
        if self.core.is_disposed() || !self.core.is_initialized() {
            return Err(self.core.reject("load_widgets"));
        }
        Ok(self.batch(names, false, &self.shutdown.child_token()).await)
    }

    /// Replace a widget value pushed by the backend.
    ///
    /// Only widgets whose strategy accepts push are updated.
    pub fn apply_push(&self, name: &str, value: Value) -> bool {
        if self.core.is_disposed() {
            return false;
        }
        let config = self.widget_config(name);
        if !config.refresh_strategy.accepts_push() {
            debug!(loader = Self::NAME, widget = name, "push ignored for non-push widget");
            return false;
        }
        self.store(name, value, UpdateSource::Push);
        true
    }

    fn serve_cached(&self, name: &str) -> Option<WidgetValue> {
        let hit = self.cache.lookup(&cache_key(name))?;
        let stale = !hit.is_fresh();
        if stale {
            trace!(loader = Self::NAME, widget = name, age_ms = hit.age.as_millis(), "serving stale");
            self.spawn_refresh(name);
        }
        Some(WidgetValue {
            value: hit.value.value,
            stale,
            fetched_at: hit.value.fetched_at,
        })
    }

    fn store(&self, name: &str, value: Value, source: UpdateSource) -> WidgetValue {
        let fetched_at = Utc::now();
        let ttl = self.widget_config(name).ttl();
        let evicted = self.cache.set(
            cache_key(name),
            CachedWidget {
                value: value.clone(),
                fetched_at,
            },
            ttl,
        );
        if !evicted.is_empty() {
            debug!(loader = Self::NAME, evicted = ?evicted, "cache budget reached");
        }
        self.failing.lock().remove(name);
        self.core.emit(DashboardEvent::WidgetUpdated {
            widget: name.to_string(),
            value: value.clone(),
            source,
            fetched_at,
        });
        WidgetValue {
            value,
            stale: false,
            fetched_at,
        }
    }

    async fn fetch(&self, name: &str, token: &CancellationToken) -> Result<Value, LoaderError> {
        let api = require(self.api.as_ref(), "dashboard api")?;
        let timeout = self.config.request_timeout();
        with_retry(&self.retry, token, |_| {
            let api = api.clone();
            async move { with_timeout(timeout, api.fetch_widget(name)).await }
        })
        .await
    }

    async fn fetch_and_store(
        &self,
        name: &str,
        source: UpdateSource,
        token: &CancellationToken,
    ) -> Result<WidgetValue, LoaderError> {
        match self.fetch(name, token).await {
            Ok(value) => {
                let stored = self.store(name, value, source);
                self.schedule_widget(name, false);
                Ok(stored)
            }
            Err(error) => {
                if !matches!(error, LoaderError::Cancelled) {
                    self.failing.lock().insert(name.to_string());
                    self.core.emit(DashboardEvent::WidgetFailed {
                        widget: name.to_string(),
                        message: error.to_string(),
                    });
                }
                Err(error)
            }
        }
    }

    async fn batch(
        &self,
        names: &[String],
        force: bool,
        token: &CancellationToken,
    ) -> Vec<WidgetResult> {
        let mut served: Vec<Option<WidgetValue>> = Vec::with_capacity(names.len());
        let mut misses = Vec::new();
        for (slot, name) in names.iter().enumerate() {
            let hit = if force { None } else { self.serve_cached(name) };
            if hit.is_none() {
                misses.push((slot, name.as_str()));
            }
            served.push(hit);
        }
        debug!(
            loader = Self::NAME,
            requested = names.len(),
            misses = misses.len(),
            "widget batch"
        );

        let fetched = join_all(
            misses
                .iter()
                .map(|(_, name)| self.fetch_and_store(name, UpdateSource::Fetch, token)),
        )
        .await;
        let mut fetched: BTreeMap<usize, Result<WidgetValue, LoaderError>> = misses
            .iter()
            .map(|(slot, _)| *slot)
            .zip(fetched)
            .collect();

        names
            .iter()
            .zip(served)
            .enumerate()
            .map(|(slot, (name, hit))| WidgetResult {
                widget: name.clone(),
                result: match hit {
                    Some(value) => Ok(value),
                    None => fetched.remove(&slot).unwrap_or(Err(LoaderError::Cancelled)),
                },
            })
            .collect()
    }

    fn spawn_refresh(&self, name: &str) {
        if !self.refreshing.lock().insert(name.to_string()) {
            trace!(loader = Self::NAME, widget = name, "refresh already running");
            return;
        }
        let me = self.me.clone();
        let widget = name.to_string();
        self.core.timers().spawn(refresh_key(name), async move {
            let Some(loader) = me.upgrade() else {
                return;
            };
            let token = loader.shutdown.child_token();
            if let Err(error) = loader.fetch_and_store(&widget, UpdateSource::Refresh, &token).await {
                debug!(loader = Self::NAME, widget = %widget, error = %error, "background refresh failed");
            }
            loader.refreshing.lock().remove(&widget);
        });
    }

    /// Start the widget's refresh timer; `replace` restarts a live one
    fn schedule_widget(&self, name: &str, replace: bool) {
        let config = self.widget_config(name);
        let key = poll_key(name);
        if !config.auto_refresh || !config.refresh_strategy.schedules_refresh() {
            self.core.timers().cancel(&key);
            return;
        }
        let Some(period) = self.cache.poll_interval(config.priority) else {
            self.core.timers().cancel(&key);
            return;
        };
        if !replace && self.core.timers().is_active(&key) {
            return;
        }
        let me = self.me.clone();
        let widget = name.to_string();
        self.core.timers().every(key, period, move || {
            let me = me.clone();
            let widget = widget.clone();
            async move {
                if let Some(loader) = me.upgrade() {
                    loader.poll_tick(&widget).await;
                }
            }
        });
    }

    async fn poll_tick(&self, name: &str) {
        if self.core.is_disposed() {
            return;
        }
        if host_hidden(self.visibility.as_ref()) {
            trace!(loader = Self::NAME, widget = name, "host hidden, skipping refresh");
            return;
        }
        if self.refreshing.lock().contains(name) {
            return;
        }
        match self.fetch(name, &self.shutdown.child_token()).await {
            Ok(value) => {
                self.store(name, value, UpdateSource::Refresh);
            }
            Err(LoaderError::Cancelled) => {}
            Err(error) => {
                self.failing.lock().insert(name.to_string());
                self.core.warn(&error);
            }
        }
    }

    async fn run_load(
        &self,
        params: DashboardParams,
        token: CancellationToken,
    ) -> Result<DashboardOutput, LoaderError> {
        let names = if params.widgets.is_empty() {
            self.widget_names()
        } else {
            params.widgets
        };
        let widgets = self.batch(&names, params.force_refresh, &token).await;
        if token.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }

        let failed = widgets.iter().filter(|w| !w.is_ok()).count();
        if failed > 0 && failed == widgets.len() {
            let first = widgets.into_iter().find_map(|w| w.result.err());
            return Err(first.unwrap_or(LoaderError::Cancelled));
        }
        info!(loader = Self::NAME, loaded = widgets.len() - failed, failed, "dashboard loaded");
        Ok(DashboardOutput {
            loaded: widgets.len() - failed,
            failed,
            widgets,
            loaded_at: Utc::now(),
        })
    }
}

fn poll_key(widget: &str) -> String {
    format!("{POLL_PREFIX}{widget}")
}

fn refresh_key(widget: &str) -> String {
    format!("{REFRESH_PREFIX}{widget}")
}

impl std::fmt::Debug for DashboardLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardLoader")
            .field("state", &self.core.state())
            .field("widgets", &self.widgets.read().len())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataLoader for DashboardLoader {
    type Params = DashboardParams;
    type Output = DashboardOutput;
    type Event = DashboardEvent;

    fn core(&self) -> &LoaderCore<DashboardEvent> {
        &self.core
    }

    async fn initialize(&self) -> Result<(), LoaderError> {
        self.core
            .initialize_with(|| async {
                require(self.api.as_ref(), "dashboard api")?;
                Ok(())
            })
            .await
    }

    async fn load(&self, params: DashboardParams) -> Result<DashboardOutput, LoaderError> {
        self.core
            .load_with(&self.last, |token| self.run_load(params, token))
            .await
    }

    async fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        self.shutdown.cancel();
        self.cache.clear();
        self.refreshing.lock().clear();
        self.failing.lock().clear();
        *self.last.lock() = None;
        self.core.finish_dispose();
    }

    async fn health_check(&self) -> HealthReport {
        let mut report = self.core.health();
        let failing = self.failing.lock().clone();
        if !failing.is_empty() {
            let names: Vec<_> = failing.into_iter().collect();
            report.push_issue(format!("widgets failing: {}", names.join(", ")));
        }
        report
    }
}
