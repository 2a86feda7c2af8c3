//! Testing utilities for the Floorlink workspace
//!
//! Shared fixtures, recording collaborators and mocks.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use floorlink_core::{
    DashboardApi, EditState, EquipmentName, EquipmentRecord, EventBus, HostVisibility, MappingApi,
    MappingEntry, MappingPayload, MappingRecord, MonitoringApi, PushClient, PushMessage, PushSignal,
    Snapshot, LoaderError,
};
use mockall::mock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn record(id: &str, status: Option<&str>, connected: bool) -> EquipmentRecord {
    EquipmentRecord {
        id: id.to_string(),
        name: format!("Unit {id}"),
        status: status.map(str::to_string),
        is_connected: connected,
        last_updated: None,
    }
}

/// Three units, one of them disconnected
pub fn three_unit_snapshot() -> Snapshot {
    Snapshot {
        equipment: vec![
            record("eq-1", Some("RUNNING"), true),
            record("eq-2", Some("idle"), true),
            record("eq-3", Some("RUNNING"), false),
        ],
    }
}

pub fn site_payload(site_id: &str, units: usize) -> MappingPayload {
    MappingPayload {
        connected: true,
        site_id: Some(site_id.to_string()),
        mappings: (1..=units)
            .map(|i| {
                (
                    format!("fe-{i}"),
                    MappingRecord {
                        equipment_id: format!("eq-{i}"),
                        equipment_name: format!("Unit {i}"),
                        equipment_code: Some(format!("U{i:03}")),
                        line_name: Some(format!("Line {}", (i - 1) / 4 + 1)),
                        updated_at: None,
                    },
                )
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Recording collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn names(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn messages(&self) -> Vec<(String, serde_json::Value)> {
        self.messages.lock().clone()
    }
}

impl EventBus for RecordingBus {
    fn emit(&self, name: &str, payload: serde_json::Value) {
        self.messages.lock().push((name.to_string(), payload));
    }
}

#[derive(Debug, Default)]
pub struct RecordingEditState {
    calls: Mutex<Vec<(Option<String>, Vec<MappingEntry>)>>,
}

impl RecordingEditState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last(&self) -> Option<(Option<String>, Vec<MappingEntry>)> {
        self.calls.lock().last().cloned()
    }
}

impl EditState for RecordingEditState {
    fn apply_mappings(&self, site_id: Option<&str>, entries: &[MappingEntry]) -> usize {
        self.calls
            .lock()
            .push((site_id.map(str::to_string), entries.to_vec()));
        entries.len()
    }
}

#[derive(Debug, Default)]
pub struct ToggleVisibility {
    hidden: AtomicBool,
}

impl ToggleVisibility {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }
}

impl HostVisibility for ToggleVisibility {
    fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Counting request/response fakes
// ---------------------------------------------------------------------------

/// Snapshot client with a call counter, optional latency and queued failures
#[derive(Debug, Default)]
pub struct CountingMonitoringApi {
    snapshot: Mutex<Snapshot>,
    failures: Mutex<VecDeque<LoaderError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl CountingMonitoringApi {
    pub fn new(snapshot: Snapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            ..Self::default()
        })
    }

    pub fn set_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_next(&self, error: LoaderError) {
        self.failures.lock().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MonitoringApi for CountingMonitoringApi {
    async fn fetch_snapshot(&self) -> Result<Snapshot, LoaderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.snapshot.lock().clone()),
        }
    }
}

/// Widget client returning `<widget>#<n>` values, counting calls per widget
#[derive(Debug, Default)]
pub struct CountingDashboardApi {
    calls: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl CountingDashboardApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_widget(&self, widget: &str) {
        self.failing.lock().push(widget.to_string());
    }

    pub fn heal_widget(&self, widget: &str) {
        self.failing.lock().retain(|w| w != widget);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls_for(&self, widget: &str) -> usize {
        self.calls.lock().iter().filter(|w| *w == widget).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl DashboardApi for CountingDashboardApi {
    async fn fetch_widget(&self, widget: &str) -> Result<serde_json::Value, LoaderError> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(widget.to_string());
            calls.iter().filter(|w| *w == widget).count()
        };
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().iter().any(|w| w == widget) {
            return Err(LoaderError::validation(format!("widget {widget} rejected")));
        }
        Ok(serde_json::json!(format!("{widget}#{n}")))
    }
}

// ---------------------------------------------------------------------------
// Push channel fake
// ---------------------------------------------------------------------------

/// Push client backed by an unbounded channel the test drives directly
#[derive(Debug, Default)]
pub struct ChannelPush {
    sender: Mutex<Option<mpsc::UnboundedSender<PushSignal>>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscriptions: Mutex<Vec<Vec<String>>>,
}

impl ChannelPush {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Deliver a signal; false when no channel is open
    pub fn send(&self, signal: PushSignal) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    pub fn push_status(&self, id: &str, status: &str) -> bool {
        self.send(PushSignal::Message(PushMessage::new(id, status)))
    }

    /// Simulate the transport dropping the channel
    pub fn drop_channel(&self, reason: &str) {
        self.send(PushSignal::Disconnected {
            reason: Some(reason.to_string()),
        });
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl PushClient for ChannelPush {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<PushSignal>, LoaderError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(LoaderError::network("push endpoint unreachable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(PushSignal::Connected);
        *self.sender.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), LoaderError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(LoaderError::Subscription("subscribe rejected".to_string()));
        }
        self.subscriptions.lock().push(topics.to_vec());
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

mock! {
    pub MonitoringApi {}

    #[async_trait]
    impl MonitoringApi for MonitoringApi {
        async fn fetch_snapshot(&self) -> Result<Snapshot, LoaderError>;
    }
}

mock! {
    pub MappingApi {}

    #[async_trait]
    impl MappingApi for MappingApi {
        async fn fetch_current_site(&self) -> Result<MappingPayload, LoaderError>;
        async fn fetch_site(&self, site_id: &str) -> Result<MappingPayload, LoaderError>;
        async fn fetch_equipment_names(&self) -> Result<Vec<EquipmentName>, LoaderError>;
    }
}

mock! {
    pub DashboardApi {}

    #[async_trait]
    impl DashboardApi for DashboardApi {
        async fn fetch_widget(&self, widget: &str) -> Result<serde_json::Value, LoaderError>;
    }
}
