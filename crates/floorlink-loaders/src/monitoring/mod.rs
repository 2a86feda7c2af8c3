//! Live equipment monitoring
//!
//! [`MonitoringLoader`] pulls a full equipment snapshot, then keeps it current
//! through the push channel. Each push message moves one unit between status
//! buckets, so the aggregate counts are maintained without rescanning the
//! table and always sum to the number of units held.
//!
//! The push channel is optional. When it cannot be opened the failure is
//! reported as a warning event and `load()` still succeeds on the strength of
//! the snapshot. An optional poll timer re-fetches the snapshot while the
//! channel is down.

mod status;

pub use status::{normalize_status, EquipmentStatus, StatusCounts};

use crate::config::MonitoringConfig;
use crate::deps::{host_hidden, require, LoaderDeps};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use floorlink_core::{
    with_retry, with_timeout, CancellationToken, DataLoader, EquipmentRecord, HealthReport,
    HostVisibility, IdResolver, LifecycleEvent, LoaderCore, LoaderError, LoaderEvent,
    MonitoringApi, PushClient, PushMessage, PushSignal, RetryPolicy, Snapshot,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const PUMP_TASK: &str = "push-pump";
const POLL_TIMER: &str = "snapshot-poll";

/// Parameters of [`MonitoringLoader::load`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitoringParams {
    /// Load the snapshot only, leave the push channel alone
    pub skip_subscription: bool,
    /// Re-open the push channel even when it is live
    pub force_refresh: bool,
}

impl MonitoringParams {
    /// Snapshot only
    #[must_use]
    pub fn snapshot_only() -> Self {
        Self {
            skip_subscription: true,
            force_refresh: false,
        }
    }
}

/// Current state of one unit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentState {
    /// Backend id
    pub id: String,
    /// UI id, when a resolver knows it
    pub frontend_id: Option<String>,
    /// Display name
    pub name: String,
    /// Normalized status
    pub status: EquipmentStatus,
    /// Status string as received
    pub raw_status: Option<String>,
    /// Connectivity flag
    pub is_connected: bool,
    /// Last update time
    pub last_updated: Option<DateTime<Utc>>,
}

impl EquipmentState {
    fn from_record(record: EquipmentRecord, frontend_id: Option<String>) -> Self {
        Self {
            status: status_of(record.status.as_deref(), record.is_connected),
            frontend_id,
            id: record.id,
            name: record.name,
            raw_status: record.status,
            is_connected: record.is_connected,
            last_updated: record.last_updated,
        }
    }
}

/// Connectivity totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStats {
    /// Units held
    pub total: usize,
    /// Units reporting connected
    pub connected_count: usize,
    /// Units reporting disconnected
    pub disconnected_count: usize,
    /// Push updates applied since the last snapshot
    pub updates_applied: u64,
    /// Time of the last applied snapshot
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    /// Connectivity totals
    pub stats: MonitoringStats,
    /// Units per status
    pub status_counts: StatusCounts,
    /// Push channel live after the load
    pub subscribed: bool,
    /// Completion time
    pub loaded_at: DateTime<Utc>,
}

/// Push channel state reported in [`MonitoringEvent::SubscriptionChanged`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Opening the channel
    Connecting,
    /// Transport is up
    Connected,
    /// Subscribe directive accepted
    Subscribed,
    /// Transport is retrying
    Reconnecting,
    /// Channel is down
    Disconnected,
}

/// Events of [`MonitoringLoader`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MonitoringEvent {
    /// Shared lifecycle event
    Lifecycle(LifecycleEvent),
    /// A full snapshot replaced the table
    SnapshotApplied {
        /// Units held
        total: usize,
        /// Units per status
        counts: StatusCounts,
    },
    /// A push message changed one unit
    StatusUpdated {
        /// Backend id
        equipment_id: String,
        /// UI id, when known
        frontend_id: Option<String>,
        /// Status before the update, `None` for a unit not in the snapshot
        previous: Option<EquipmentStatus>,
        /// Status after the update
        status: EquipmentStatus,
        /// Units per status after the update
        counts: StatusCounts,
    },
    /// Push channel state changed
    SubscriptionChanged {
        /// New state
        state: SubscriptionState,
        /// Reconnect attempt, for `Reconnecting`
        attempt: Option<u32>,
        /// Reason, when the transport gave one
        reason: Option<String>,
    },
}

impl MonitoringEvent {
    /// Name of [`MonitoringEvent::SnapshotApplied`]
    pub const SNAPSHOT_APPLIED: &'static str = "snapshotApplied";
    /// Name of [`MonitoringEvent::StatusUpdated`]
    pub const STATUS_UPDATED: &'static str = "statusUpdated";
    /// Name of [`MonitoringEvent::SubscriptionChanged`]
    pub const SUBSCRIPTION_CHANGED: &'static str = "subscriptionChanged";
}

impl LoaderEvent for MonitoringEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Lifecycle(event) => event.name(),
            Self::SnapshotApplied { .. } => Self::SNAPSHOT_APPLIED,
            Self::StatusUpdated { .. } => Self::STATUS_UPDATED,
            Self::SubscriptionChanged { .. } => Self::SUBSCRIPTION_CHANGED,
        }
    }
}

impl From<LifecycleEvent> for MonitoringEvent {
    fn from(event: LifecycleEvent) -> Self {
        Self::Lifecycle(event)
    }
}

fn status_of(raw: Option<&str>, is_connected: bool) -> EquipmentStatus {
    if is_connected {
        normalize_status(raw)
    } else {
        EquipmentStatus::Disconnected
    }
}

fn as_subscription_error(error: LoaderError) -> LoaderError {
    match error {
        e @ (LoaderError::Subscription(_) | LoaderError::Cancelled) => e,
        other => LoaderError::Subscription(other.to_string()),
    }
}

#[derive(Debug, Default)]
struct EquipmentTable {
    units: HashMap<String, EquipmentState>,
    counts: StatusCounts,
    connected: usize,
    updates_applied: u64,
    snapshot_at: Option<DateTime<Utc>>,
}

impl EquipmentTable {
    fn replace(&mut self, units: HashMap<String, EquipmentState>) {
        self.counts = StatusCounts::tally(units.values().map(|u| u.status));
        self.connected = units.values().filter(|u| u.is_connected).count();
        self.units = units;
        self.updates_applied = 0;
        self.snapshot_at = Some(Utc::now());
    }

    fn update(&mut self, msg: &PushMessage, frontend_id: Option<String>) -> (Option<EquipmentStatus>, EquipmentStatus) {
        let is_connected = msg.is_connected.unwrap_or(true);
        let status = status_of(msg.status.as_deref(), is_connected);
        let stamp = msg.timestamp.unwrap_or_else(Utc::now);

        let previous = match self.units.get_mut(&msg.id) {
            Some(unit) => {
                let previous = unit.status;
                self.counts.shift(previous, status);
                match (unit.is_connected, is_connected) {
                    (true, false) => self.connected -= 1,
                    (false, true) => self.connected += 1,
                    _ => {}
                }
                unit.status = status;
                unit.raw_status.clone_from(&msg.status);
                unit.is_connected = is_connected;
                unit.last_updated = Some(stamp);
                if frontend_id.is_some() {
                    unit.frontend_id = frontend_id;
                }
                Some(previous)
            }
            None => {
                self.counts.increment(status);
                if is_connected {
                    self.connected += 1;
                }
                self.units.insert(
                    msg.id.clone(),
                    EquipmentState {
                        id: msg.id.clone(),
                        frontend_id,
                        name: msg.id.clone(),
                        status,
                        raw_status: msg.status.clone(),
                        is_connected,
                        last_updated: Some(stamp),
                    },
                );
                None
            }
        };
        self.updates_applied += 1;
        (previous, status)
    }

    fn stats(&self) -> MonitoringStats {
        MonitoringStats {
            total: self.units.len(),
            connected_count: self.connected,
            disconnected_count: self.units.len() - self.connected,
            updates_applied: self.updates_applied,
            last_snapshot_at: self.snapshot_at,
        }
    }
}

/// Snapshot + push-subscription loader for live equipment status
pub struct MonitoringLoader {
    core: LoaderCore<MonitoringEvent>,
    me: Weak<Self>,
    config: MonitoringConfig,
    retry: RetryPolicy,
    api: Option<Arc<dyn MonitoringApi>>,
    push: Option<Arc<dyn PushClient>>,
    visibility: Option<Arc<dyn HostVisibility>>,
    resolver: RwLock<Option<Arc<dyn IdResolver>>>,
    table: Mutex<EquipmentTable>,
    subscribed: AtomicBool,
    subscription_wanted: AtomicBool,
    shutdown: CancellationToken,
    last: Mutex<Option<MonitoringSnapshot>>,
}

impl MonitoringLoader {
    /// Loader name used in logs and bus event names
    pub const NAME: &'static str = "monitoring";

    /// Create loader in `Idle`
    #[must_use]
    pub fn new(config: MonitoringConfig, retry: RetryPolicy, deps: &LoaderDeps) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            core: LoaderCore::new(Self::NAME, deps.bus.clone()),
            me: me.clone(),
            config,
            retry,
            api: deps.monitoring_api.clone(),
            push: deps.push.clone(),
            visibility: deps.visibility.clone(),
            resolver: RwLock::new(None),
            table: Mutex::new(EquipmentTable::default()),
            subscribed: AtomicBool::new(false),
            subscription_wanted: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            last: Mutex::new(None),
        })
    }

    /// Translate backend ids to UI ids from now on; re-labels units held
    pub fn set_resolver(&self, resolver: Arc<dyn IdResolver>) {
        {
            let mut table = self.table.lock();
            for unit in table.units.values_mut() {
                unit.frontend_id = resolver.frontend_id_for(&unit.id);
            }
        }
        *self.resolver.write() = Some(resolver);
        debug!(loader = Self::NAME, "id resolver attached");
    }

    /// Current state of one unit
    #[must_use]
    pub fn equipment(&self, id: &str) -> Option<EquipmentState> {
        self.table.lock().units.get(id).cloned()
    }

    /// All units, sorted by id
    #[must_use]
    pub fn equipment_list(&self) -> Vec<EquipmentState> {
        let mut units: Vec<_> = self.table.lock().units.values().cloned().collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    /// Units per status
    #[must_use]
    pub fn status_counts(&self) -> StatusCounts {
        self.table.lock().counts
    }

    /// Connectivity totals
    #[must_use]
    pub fn stats(&self) -> MonitoringStats {
        self.table.lock().stats()
    }

    /// Push channel is open and subscribed
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst) && self.push.as_ref().is_some_and(|p| p.is_connected())
    }

    fn wants_subscription(&self, params: MonitoringParams) -> bool {
        !params.skip_subscription && self.config.hybrid && self.push.is_some()
    }

    fn output(&self) -> MonitoringSnapshot {
        let (stats, status_counts) = {
            let table = self.table.lock();
            (table.stats(), table.counts)
        };
        MonitoringSnapshot {
            stats,
            status_counts,
            subscribed: self.is_subscribed(),
            loaded_at: Utc::now(),
        }
    }

    async fn fetch_snapshot(&self, token: &CancellationToken) -> Result<Snapshot, LoaderError> {
        let api = require(self.api.as_ref(), "monitoring api")?;
        let timeout = self.config.request_timeout();
        with_retry(&self.retry, token, |attempt| {
            let api = api.clone();
            async move {
                if attempt > 0 {
                    debug!(loader = Self::NAME, attempt, "retrying snapshot");
                }
                with_timeout(timeout, api.fetch_snapshot()).await
            }
        })
        .await
    }

    fn apply_snapshot(&self, snapshot: Snapshot) {
        let resolver = self.resolver.read().clone();
        let units: HashMap<_, _> = snapshot
            .equipment
            .into_iter()
            .map(|record| {
                let frontend_id = resolver.as_ref().and_then(|r| r.frontend_id_for(&record.id));
                (record.id.clone(), EquipmentState::from_record(record, frontend_id))
            })
            .collect();

        let (total, counts) = {
            let mut table = self.table.lock();
            table.replace(units);
            (table.units.len(), table.counts)
        };
        debug!(loader = Self::NAME, total, "snapshot applied");
        self.core.emit(MonitoringEvent::SnapshotApplied { total, counts });
    }

    fn apply_update(&self, msg: &PushMessage) {
        let frontend_id = self
            .resolver
            .read()
            .as_ref()
            .and_then(|r| r.frontend_id_for(&msg.id));
        let (previous, status, counts) = {
            let mut table = self.table.lock();
            let (previous, status) = table.update(msg, frontend_id.clone());
            (previous, status, table.counts)
        };
        trace!(loader = Self::NAME, id = %msg.id, ?previous, %status, "status update");
        self.core.emit(MonitoringEvent::StatusUpdated {
            equipment_id: msg.id.clone(),
            frontend_id,
            previous,
            status,
            counts,
        });
    }

    fn notify_subscription(&self, state: SubscriptionState, attempt: Option<u32>, reason: Option<String>) {
        self.core.emit(MonitoringEvent::SubscriptionChanged {
            state,
            attempt,
            reason,
        });
    }

    fn handle_signal(&self, signal: PushSignal) {
        match signal {
            PushSignal::Message(msg) => self.apply_update(&msg),
            PushSignal::Connected => self.notify_subscription(SubscriptionState::Connected, None, None),
            PushSignal::Reconnecting { attempt } => {
                self.notify_subscription(SubscriptionState::Reconnecting, Some(attempt), None);
            }
            PushSignal::Disconnected { reason } => {
                self.subscribed.store(false, Ordering::SeqCst);
                let detail = reason.as_deref().map_or_else(String::new, |r| format!(": {r}"));
                self.notify_subscription(SubscriptionState::Disconnected, None, reason);
                self.core
                    .warn(&LoaderError::Subscription(format!("push channel disconnected{detail}")));
            }
            PushSignal::Error(message) => self.core.warn(&LoaderError::Subscription(message)),
        }
    }

    fn spawn_pump(&self, mut signals: mpsc::UnboundedReceiver<PushSignal>) {
        let me = self.me.clone();
        self.core.timers().spawn(PUMP_TASK, async move {
            while let Some(signal) = signals.recv().await {
                let Some(loader) = me.upgrade() else {
                    return;
                };
                loader.handle_signal(signal);
            }
            if let Some(loader) = me.upgrade() {
                loader.subscribed.store(false, Ordering::SeqCst);
                debug!(loader = Self::NAME, "push channel closed");
            }
        });
    }

    async fn open_subscription(&self, token: &CancellationToken) -> Result<(), LoaderError> {
        let push = require(self.push.as_ref(), "push client")?;
        self.notify_subscription(SubscriptionState::Connecting, None, None);
        self.core.timers().cancel(PUMP_TASK);
        self.subscribed.store(false, Ordering::SeqCst);

        let signals = push.connect().await.map_err(as_subscription_error)?;
        self.spawn_pump(signals);

        tokio::select! {
            biased;
            () = token.cancelled() => return Err(LoaderError::Cancelled),
            () = tokio::time::sleep(self.config.subscribe_delay()) => {}
        }

        if let Err(error) = push.subscribe(&self.config.topics).await {
            self.close_subscription(&push).await;
            return Err(as_subscription_error(error));
        }
        self.subscribed.store(true, Ordering::SeqCst);
        info!(loader = Self::NAME, topics = ?self.config.topics, "push subscription active");
        self.notify_subscription(SubscriptionState::Subscribed, None, None);
        Ok(())
    }

    async fn close_subscription(&self, push: &Arc<dyn PushClient>) {
        self.core.timers().cancel(PUMP_TASK);
        push.disconnect().await;
        self.subscribed.store(false, Ordering::SeqCst);
    }

    fn schedule_polling(&self) {
        let Some(period) = self.config.poll_interval() else {
            return;
        };
        if self.core.timers().is_active(POLL_TIMER) {
            return;
        }
        let me = self.me.clone();
        self.core.timers().every(POLL_TIMER, period, move || {
            let me = me.clone();
            async move {
                if let Some(loader) = me.upgrade() {
                    loader.poll_tick().await;
                }
            }
        });
    }

    async fn poll_tick(&self) {
        if self.core.is_disposed() || self.core.is_loading() {
            return;
        }
        if host_hidden(self.visibility.as_ref()) {
            debug!(loader = Self::NAME, "host hidden, skipping poll");
            return;
        }
        if self.is_subscribed() {
            trace!(loader = Self::NAME, "push channel live, skipping poll");
            return;
        }
        match self.fetch_snapshot(&self.shutdown.child_token()).await {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            Err(LoaderError::Cancelled) => {}
            Err(error) => self.core.warn(&error),
        }
    }

    async fn run_load(&self, params: MonitoringParams, token: CancellationToken) -> Result<MonitoringSnapshot, LoaderError> {
        let snapshot = self.fetch_snapshot(&token).await?;
        self.apply_snapshot(snapshot);

        if self.wants_subscription(params) {
            self.subscription_wanted.store(true, Ordering::SeqCst);
            if params.force_refresh || !self.is_subscribed() {
                match self.open_subscription(&token).await {
                    Ok(()) => {}
                    Err(LoaderError::Cancelled) => return Err(LoaderError::Cancelled),
                    Err(error) => self.core.warn(&error),
                }
            }
        }

        self.schedule_polling();
        Ok(self.output())
    }
}

impl std::fmt::Debug for MonitoringLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringLoader")
            .field("state", &self.core.state())
            .field("units", &self.table.lock().units.len())
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataLoader for MonitoringLoader {
    type Params = MonitoringParams;
    type Output = MonitoringSnapshot;
    type Event = MonitoringEvent;

    fn core(&self) -> &LoaderCore<MonitoringEvent> {
        &self.core
    }

    async fn initialize(&self) -> Result<(), LoaderError> {
        self.core
            .initialize_with(|| async {
                require(self.api.as_ref(), "monitoring api")?;
                if self.config.hybrid && self.push.is_none() {
                    info!(loader = Self::NAME, "no push client, running pull-only");
                }
                Ok(())
            })
            .await
    }

    async fn load(&self, params: MonitoringParams) -> Result<MonitoringSnapshot, LoaderError> {
        self.core
            .load_with(&self.last, |token| self.run_load(params, token))
            .await
    }

    async fn dispose(&self) {
        if !self.core.begin_dispose() {
            return;
        }
        self.shutdown.cancel();
        if let Some(push) = &self.push {
            if self.subscription_wanted.load(Ordering::SeqCst) {
                push.disconnect().await;
            }
        }
        self.subscribed.store(false, Ordering::SeqCst);
        *self.table.lock() = EquipmentTable::default();
        *self.last.lock() = None;
        self.core.finish_dispose();
    }

    async fn health_check(&self) -> HealthReport {
        let mut report = self.core.health();
        if self.core.is_initialized()
            && self.subscription_wanted.load(Ordering::SeqCst)
            && !self.is_subscribed()
        {
            report.push_issue("push subscription not active");
        }
        report
    }

    /// Re-open the push channel; the snapshot table is kept as is
    async fn reconnect(&self) -> Result<(), LoaderError> {
        if self.core.is_disposed() || !self.core.is_initialized() {
            return Err(self.core.reject("reconnect"));
        }
        let push = require(self.push.as_ref(), "push client")?;
        info!(loader = Self::NAME, "reconnecting push channel");

        self.close_subscription(&push).await;
        self.subscription_wanted.store(true, Ordering::SeqCst);
        match self.open_subscription(&self.shutdown.child_token()).await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(loader = Self::NAME, error = %error, "reconnect failed");
                self.core.warn(&error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floorlink_core::{ErrorKind, LoaderState};
    use floorlink_test_utils::{record, three_unit_snapshot, ChannelPush, CountingMonitoringApi, ToggleVisibility};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn loader_with(
        api: &Arc<CountingMonitoringApi>,
        push: Option<&Arc<ChannelPush>>,
        config: MonitoringConfig,
    ) -> Arc<MonitoringLoader> {
        let mut deps = LoaderDeps::new().with_monitoring_api(api.clone());
        if let Some(push) = push {
            deps = deps.with_push(push.clone());
        }
        MonitoringLoader::new(config, RetryPolicy::none(), &deps)
    }

    fn collect(loader: &MonitoringLoader, event: &'static str) -> Arc<Mutex<Vec<MonitoringEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        loader.on(event, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[tokio::test]
    async fn snapshot_without_subscription() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let loader = loader_with(&api, None, MonitoringConfig::default());
        loader.initialize().await.unwrap();

        let out = loader.load(MonitoringParams::snapshot_only()).await.unwrap();

        assert_eq!(out.stats.connected_count, 2);
        assert_eq!(out.stats.disconnected_count, 1);
        assert_eq!(out.status_counts.disconnected, 1);
        assert_eq!(out.status_counts.run, 1);
        assert_eq!(out.status_counts.idle, 1);
        assert!(!out.subscribed);
        assert_eq!(loader.equipment("eq-3").unwrap().status, EquipmentStatus::Disconnected);
    }

    #[tokio::test]
    async fn initialize_requires_snapshot_client() {
        let loader = MonitoringLoader::new(MonitoringConfig::default(), RetryPolicy::none(), &LoaderDeps::new());
        let err = loader.initialize().await.unwrap_err();
        assert_eq!(err, LoaderError::MissingDependency("monitoring api"));
        assert_eq!(loader.core().state(), LoaderState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn hybrid_load_subscribes_after_settle_delay() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let push = ChannelPush::new();
        let loader = loader_with(&api, Some(&push), MonitoringConfig::default());
        loader.initialize().await.unwrap();

        let started = tokio::time::Instant::now();
        let out = loader.load(MonitoringParams::default()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(out.subscribed);
        assert_eq!(push.subscriptions(), vec![vec!["equipment-status".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_failure_is_a_warning() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let push = ChannelPush::new();
        push.fail_subscribe(true);
        let loader = loader_with(&api, Some(&push), MonitoringConfig::default());
        let warnings = collect(&loader, LifecycleEvent::WARNING);
        loader.initialize().await.unwrap();

        let out = loader.load(MonitoringParams::default()).await.unwrap();

        assert!(!out.subscribed);
        assert_eq!(loader.core().state(), LoaderState::Loaded);
        assert!(matches!(
            warnings.lock().as_slice(),
            [MonitoringEvent::Lifecycle(LifecycleEvent::Warning { kind: ErrorKind::Subscription, .. })]
        ));
        let health = loader.health_check().await;
        assert!(!health.healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn push_updates_shift_counts() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let push = ChannelPush::new();
        let loader = loader_with(&api, Some(&push), MonitoringConfig::default());
        let updates = collect(&loader, MonitoringEvent::STATUS_UPDATED);
        loader.initialize().await.unwrap();
        loader.load(MonitoringParams::default()).await.unwrap();

        assert!(push.push_status("eq-1", "ALARM"));
        assert!(push.push_status("eq-3", "running"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let counts = loader.status_counts();
        assert_eq!(counts.run, 1);
        assert_eq!(counts.sudden_stop, 1);
        assert_eq!(counts.disconnected, 0);
        assert_eq!(counts.total(), 3);
        assert_eq!(loader.stats().connected_count, 3);
        assert_eq!(updates.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_unit_joins_the_table() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let push = ChannelPush::new();
        let loader = loader_with(&api, Some(&push), MonitoringConfig::default());
        loader.initialize().await.unwrap();
        loader.load(MonitoringParams::default()).await.unwrap();

        push.push_status("eq-9", "idle");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(loader.stats().total, 4);
        assert_eq!(loader.status_counts().total(), 4);
        assert_eq!(loader.status_counts().idle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_snapshot() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let push = ChannelPush::new();
        let loader = loader_with(&api, Some(&push), MonitoringConfig::default());
        loader.initialize().await.unwrap();
        loader.load(MonitoringParams::default()).await.unwrap();

        push.drop_channel("network blip");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!loader.is_subscribed());

        loader.reconnect().await.unwrap();

        assert!(loader.is_subscribed());
        assert_eq!(api.calls(), 1);
        assert_eq!(push.connect_count(), 2);
        assert_eq!(loader.stats().total, 3);
    }

    #[tokio::test]
    async fn reconnect_without_push_client() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let loader = loader_with(&api, None, MonitoringConfig::default());
        assert!(matches!(loader.reconnect().await, Err(LoaderError::State { .. })));

        loader.initialize().await.unwrap();
        assert_eq!(
            loader.reconnect().await,
            Err(LoaderError::MissingDependency("push client"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_fallback_skips_hidden_host() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let visibility = ToggleVisibility::new();
        let deps = LoaderDeps::new()
            .with_monitoring_api(api.clone())
            .with_visibility(visibility.clone());
        let config = MonitoringConfig::default().with_poll_interval(Duration::from_secs(5));
        let loader = MonitoringLoader::new(config, RetryPolicy::none(), &deps);
        loader.initialize().await.unwrap();
        loader.load(MonitoringParams::snapshot_only()).await.unwrap();
        assert_eq!(api.calls(), 1);

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(api.calls(), 2);

        visibility.set_hidden(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.calls(), 2);

        api.set_snapshot(Snapshot {
            equipment: vec![record("eq-1", Some("stop"), true)],
        });
        visibility.set_hidden(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.calls(), 3);
        assert_eq!(loader.stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_closes_channel_and_stops_timers() {
        let api = CountingMonitoringApi::new(three_unit_snapshot());
        let push = ChannelPush::new();
        let config = MonitoringConfig::default().with_poll_interval(Duration::from_secs(1));
        let loader = loader_with(&api, Some(&push), config);
        loader.initialize().await.unwrap();
        loader.load(MonitoringParams::default()).await.unwrap();
        assert!(loader.status().active_timers >= 1);

        loader.dispose().await;
        loader.dispose().await;

        assert_eq!(push.disconnect_count(), 1);
        assert_eq!(loader.status().active_timers, 0);
        assert_eq!(loader.stats().total, 0);
        assert!(loader.load(MonitoringParams::default()).await.is_err());
        assert_eq!(loader.core().state(), LoaderState::Disposed);
    }
}
