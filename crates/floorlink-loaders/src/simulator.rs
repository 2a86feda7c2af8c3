//! In-process plant
//!
//! [`SimulatedPlant`] stands in for every backend collaborator at once: the
//! snapshot endpoint, site mapping endpoints, widget endpoint, the push
//! channel, the editor state and the host visibility signal. Everything it
//! returns is derived from the unit index, so runs are reproducible.

use crate::deps::LoaderDeps;
use async_trait::async_trait;
use chrono::Utc;
use floorlink_core::{
    DashboardApi, EditState, EquipmentName, EquipmentRecord, HostVisibility, LoaderError,
    MappingApi, MappingEntry, MappingPayload, MappingRecord, MonitoringApi, PushClient,
    PushMessage, PushSignal, Snapshot,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const STATUS_CYCLE: [&str; 6] = ["RUNNING", "idle", "RUNNING", "stopped", "standby", "emergency"];

/// Backend operation, for failure injection and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlantOp {
    /// Snapshot fetch
    Snapshot,
    /// Current or named site fetch
    Site,
    /// Names fetch
    Names,
    /// Widget fetch
    Widget,
    /// Push connect
    Connect,
    /// Push subscribe
    Subscribe,
}

/// Simulated plant layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlantLayout {
    /// Number of units
    pub equipment: usize,
    /// Site ids; units are dealt round-robin, the first site is current
    pub sites: Vec<String>,
    /// Every n-th unit starts disconnected; 0 disables
    pub disconnected_every: usize,
}

impl Default for PlantLayout {
    fn default() -> Self {
        Self {
            equipment: 12,
            sites: vec!["site-a".to_string(), "site-b".to_string()],
            disconnected_every: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct Unit {
    id: String,
    name: String,
    code: String,
    line: String,
    site: String,
    status: Option<String>,
    connected: bool,
}

/// Every collaborator trait over one deterministic plant
#[derive(Debug)]
pub struct SimulatedPlant {
    layout: PlantLayout,
    units: Mutex<Vec<Unit>>,
    failures: Mutex<HashMap<PlantOp, u32>>,
    calls: Mutex<BTreeMap<PlantOp, u64>>,
    widget_ticks: AtomicU64,
    sender: Mutex<Option<mpsc::UnboundedSender<PushSignal>>>,
    connected: AtomicBool,
    hidden: AtomicBool,
    applied: Mutex<Vec<MappingEntry>>,
    update_seq: AtomicU64,
}

impl SimulatedPlant {
    /// Plant with `layout`
    #[must_use]
    pub fn new(layout: PlantLayout) -> Arc<Self> {
        let sites = if layout.sites.is_empty() {
            vec!["site-a".to_string()]
        } else {
            layout.sites.clone()
        };
        let units = (1..=layout.equipment)
            .map(|i| Unit {
                id: format!("eq-{i}"),
                name: format!("Unit {i}"),
                code: format!("U{i:03}"),
                line: format!("Line {}", (i - 1) / 4 + 1),
                site: sites[(i - 1) % sites.len()].clone(),
                status: Some(STATUS_CYCLE[(i - 1) % STATUS_CYCLE.len()].to_string()),
                connected: layout.disconnected_every == 0 || i % layout.disconnected_every != 0,
            })
            .collect();
        Arc::new(Self {
            layout: PlantLayout { sites, ..layout },
            units: Mutex::new(units),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(BTreeMap::new()),
            widget_ticks: AtomicU64::new(0),
            sender: Mutex::new(None),
            connected: AtomicBool::new(false),
            hidden: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            update_seq: AtomicU64::new(0),
        })
    }

    /// Plant with `equipment` units and the default sites
    #[must_use]
    pub fn with_equipment(equipment: usize) -> Arc<Self> {
        Self::new(PlantLayout {
            equipment,
            ..PlantLayout::default()
        })
    }

    /// Every collaborator wired to this plant
    #[must_use]
    pub fn deps(self: &Arc<Self>) -> LoaderDeps {
        LoaderDeps::new()
            .with_monitoring_api(self.clone())
            .with_mapping_api(self.clone())
            .with_dashboard_api(self.clone())
            .with_push(self.clone())
            .with_edit_state(self.clone())
            .with_visibility(self.clone())
    }

    /// Site ids, current first
    #[must_use]
    pub fn sites(&self) -> &[String] {
        &self.layout.sites
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_next(&self, op: PlantOp, times: u32) {
        *self.failures.lock().entry(op).or_default() += times;
    }

    /// Calls made per operation
    #[must_use]
    pub fn calls(&self, op: PlantOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or_default()
    }

    /// Call counters of every operation seen
    #[must_use]
    pub fn call_counts(&self) -> BTreeMap<PlantOp, u64> {
        self.calls.lock().clone()
    }

    /// Toggle host visibility
    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    /// Entries most recently applied to the editor state
    #[must_use]
    pub fn applied_mappings(&self) -> Vec<MappingEntry> {
        self.applied.lock().clone()
    }

    /// Change one unit and push the change. Returns whether it was delivered.
    pub fn push_status(&self, id: &str, status: &str, connected: bool) -> bool {
        {
            let mut units = self.units.lock();
            if let Some(unit) = units.iter_mut().find(|u| u.id == id) {
                unit.status = Some(status.to_string());
                unit.connected = connected;
            }
        }
        let mut msg = PushMessage::new(id, status);
        msg.is_connected = Some(connected);
        msg.timestamp = Some(Utc::now());
        self.send(PushSignal::Message(msg))
    }

    /// Push `count` deterministic status changes. Returns how many were delivered.
    pub fn push_updates(&self, count: usize) -> usize {
        let total = self.units.lock().len();
        if total == 0 {
            return 0;
        }
        let mut delivered = 0;
        for _ in 0..count {
            let seq = usize::try_from(self.update_seq.fetch_add(1, Ordering::SeqCst)).unwrap_or_default();
            let id = format!("eq-{}", seq * 7 % total + 1);
            let status = STATUS_CYCLE[(seq + 1) % STATUS_CYCLE.len()];
            if self.push_status(&id, status, seq % 11 != 10) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a raw signal on the open channel
    pub fn send(&self, signal: PushSignal) -> bool {
        let delivered = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok());
        if !delivered {
            trace!("push dropped, channel closed");
        }
        delivered
    }

    /// Drop the push channel as a transport failure would
    pub fn drop_channel(&self, reason: &str) {
        self.send(PushSignal::Disconnected {
            reason: Some(reason.to_string()),
        });
        self.sender.lock().take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn call(&self, op: PlantOp) -> Result<(), LoaderError> {
        *self.calls.lock().entry(op).or_default() += 1;
        let mut failures = self.failures.lock();
        match failures.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                debug!(?op, "injected failure");
                Err(LoaderError::network(format!("simulated {op:?} failure")))
            }
            _ => Ok(()),
        }
    }

    fn payload(&self, site: &str) -> MappingPayload {
        let mappings = self
            .units
            .lock()
            .iter()
            .filter(|u| u.site == site)
            .map(|u| {
                (
                    u.id.replacen("eq-", "fe-", 1),
                    MappingRecord {
                        equipment_id: u.id.clone(),
                        equipment_name: u.name.clone(),
                        equipment_code: Some(u.code.clone()),
                        line_name: Some(u.line.clone()),
                        updated_at: None,
                    },
                )
            })
            .collect();
        MappingPayload {
            connected: true,
            site_id: Some(site.to_string()),
            mappings,
        }
    }
}

#[async_trait]
impl MonitoringApi for SimulatedPlant {
    async fn fetch_snapshot(&self) -> Result<Snapshot, LoaderError> {
        self.call(PlantOp::Snapshot)?;
        let equipment = self
            .units
            .lock()
            .iter()
            .map(|u| EquipmentRecord {
                id: u.id.clone(),
                name: u.name.clone(),
                status: u.status.clone(),
                is_connected: u.connected,
                last_updated: Some(Utc::now()),
            })
            .collect();
        Ok(Snapshot { equipment })
    }
}

#[async_trait]
impl MappingApi for SimulatedPlant {
    async fn fetch_current_site(&self) -> Result<MappingPayload, LoaderError> {
        self.call(PlantOp::Site)?;
        Ok(self.payload(&self.layout.sites[0]))
    }

    async fn fetch_site(&self, site_id: &str) -> Result<MappingPayload, LoaderError> {
        self.call(PlantOp::Site)?;
        if !self.layout.sites.iter().any(|s| s == site_id) {
            return Err(LoaderError::validation(format!("unknown site {site_id}")));
        }
        Ok(self.payload(site_id))
    }

    async fn fetch_equipment_names(&self) -> Result<Vec<EquipmentName>, LoaderError> {
        self.call(PlantOp::Names)?;
        Ok(self
            .units
            .lock()
            .iter()
            .map(|u| EquipmentName {
                equipment_id: u.id.clone(),
                equipment_name: u.name.clone(),
                equipment_code: Some(u.code.clone()),
            })
            .collect())
    }
}

#[async_trait]
impl DashboardApi for SimulatedPlant {
    async fn fetch_widget(&self, widget: &str) -> Result<Value, LoaderError> {
        self.call(PlantOp::Widget)?;
        let tick = self.widget_ticks.fetch_add(1, Ordering::SeqCst);
        let units = self.units.lock();
        let running = units
            .iter()
            .filter(|u| u.connected && u.status.as_deref() == Some("RUNNING"))
            .count();
        Ok(json!({
            "widget": widget,
            "tick": tick,
            "running": running,
            "total": units.len(),
        }))
    }
}

#[async_trait]
impl PushClient for SimulatedPlant {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<PushSignal>, LoaderError> {
        self.call(PlantOp::Connect)?;
        let (tx, rx) = mpsc::unbounded_channel();
        // receiver is returned below, so this send cannot fail
        let _ = tx.send(PushSignal::Connected);
        *self.sender.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn subscribe(&self, topics: &[String]) -> Result<(), LoaderError> {
        self.call(PlantOp::Subscribe)
            .map_err(|e| LoaderError::Subscription(e.to_string()))?;
        debug!(?topics, "simulated subscription");
        Ok(())
    }

    async fn disconnect(&self) {
        self.sender.lock().take();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl EditState for SimulatedPlant {
    fn apply_mappings(&self, _site_id: Option<&str>, entries: &[MappingEntry]) -> usize {
        *self.applied.lock() = entries.to_vec();
        entries.len()
    }
}

impl HostVisibility for SimulatedPlant {
    fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }
}
