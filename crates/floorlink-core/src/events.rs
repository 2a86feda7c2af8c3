//! Embedded event emitter
//!
//! Each loader owns one [`EventEmitter`]. Listeners live in a single dispatch
//! table keyed by event name; every entry carries a `once` tag and the notify
//! loop drops once-tagged entries as it fires them. Persistent listeners run
//! before one-shot listeners, each group in registration order.
//!
//! Callbacks run outside the table lock, so a listener may register or remove
//! listeners (including itself) while being notified.

use crate::error::ErrorKind;
use crate::state::LoaderState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Event type emitted by a loader
pub trait LoaderEvent: Clone + Serialize + Send + Sync + 'static {
    /// Name the event is dispatched under
    fn name(&self) -> &'static str;
}

/// Events shared by every loader
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LifecycleEvent {
    /// The state machine moved
    StateChanged {
        /// Previous state
        from: LoaderState,
        /// New state
        to: LoaderState,
    },
    /// `initialize()` completed
    Initialized,
    /// A load completed successfully
    Loaded {
        /// Successful loads so far, including this one
        load_count: u64,
        /// Completion time
        at: DateTime<Utc>,
    },
    /// A load or initialize failed
    Error {
        /// Rendered error
        message: String,
        /// Error class
        kind: ErrorKind,
        /// When the failure was recorded
        timestamp: DateTime<Utc>,
    },
    /// Recoverable problem; the operation still succeeded
    Warning {
        /// Rendered error
        message: String,
        /// Error class
        kind: ErrorKind,
        /// When the warning was raised
        timestamp: DateTime<Utc>,
    },
    /// A pending load was cancelled
    Aborted,
    /// The loader was disposed
    Disposed,
}

impl LifecycleEvent {
    /// Name of [`LifecycleEvent::StateChanged`]
    pub const STATE_CHANGED: &'static str = "stateChanged";
    /// Name of [`LifecycleEvent::Initialized`]
    pub const INITIALIZED: &'static str = "initialized";
    /// Name of [`LifecycleEvent::Loaded`]
    pub const LOADED: &'static str = "loaded";
    /// Name of [`LifecycleEvent::Error`]
    pub const ERROR: &'static str = "error";
    /// Name of [`LifecycleEvent::Warning`]
    pub const WARNING: &'static str = "warning";
    /// Name of [`LifecycleEvent::Aborted`]
    pub const ABORTED: &'static str = "aborted";
    /// Name of [`LifecycleEvent::Disposed`]
    pub const DISPOSED: &'static str = "disposed";
}

impl LoaderEvent for LifecycleEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => Self::STATE_CHANGED,
            Self::Initialized => Self::INITIALIZED,
            Self::Loaded { .. } => Self::LOADED,
            Self::Error { .. } => Self::ERROR,
            Self::Warning { .. } => Self::WARNING,
            Self::Aborted => Self::ABORTED,
            Self::Disposed => Self::DISPOSED,
        }
    }
}

/// External bus for cross-cutting observers
pub trait EventBus: Send + Sync {
    /// Receive a forwarded event
    fn emit(&self, name: &str, payload: serde_json::Value);
}

/// Bus payloads are always objects carrying the emitting loader's name.
/// Unit events become `{"loader": ..}`; non-object payloads go under `data`.
fn bus_payload(source: &str, payload: serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::Object(mut fields) => {
            fields
                .entry("loader")
                .or_insert_with(|| serde_json::Value::from(source));
            serde_json::Value::Object(fields)
        }
        serde_json::Value::Null => serde_json::json!({ "loader": source }),
        data => serde_json::json!({ "loader": source, "data": data }),
    }
}

/// Event forwarded through a [`BroadcastBus`]
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Scoped event name, `"<loader>:<event>"`
    pub name: String,
    /// Serialized event
    pub payload: serde_json::Value,
}

/// [`EventBus`] backed by a tokio broadcast channel.
///
/// Publishing is synchronous. With no subscribers events are dropped; slow
/// subscribers see `RecvError::Lagged` instead of blocking loaders.
#[derive(Clone, Debug)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    /// Create a bus with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastBus {
    fn emit(&self, name: &str, payload: serde_json::Value) {
        let _ = self.tx.send(BusMessage {
            name: name.to_string(),
            payload,
        });
    }
}

/// Identifier of a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerEntry<E> {
    id: ListenerId,
    callback: Callback<E>,
    once: bool,
}

type DispatchTable<E> = Mutex<HashMap<&'static str, Vec<ListenerEntry<E>>>>;

/// Type-erased removal, so handles do not carry the event type
trait ListenerRemoval: Send + Sync {
    fn remove(&self, event: &str, id: ListenerId) -> bool;
}

impl<E: Send + Sync> ListenerRemoval for DispatchTable<E> {
    fn remove(&self, event: &str, id: ListenerId) -> bool {
        let mut table = self.lock();
        let Some(entries) = table.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            table.remove(event);
        }
        removed
    }
}

/// Returned by `on`/`once`; removes exactly that listener
#[derive(Clone)]
pub struct ListenerHandle {
    id: ListenerId,
    event: &'static str,
    table: Weak<dyn ListenerRemoval>,
}

impl ListenerHandle {
    /// Listener id, usable with `off`
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Event the listener is registered for
    #[inline]
    #[must_use]
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Remove the listener. Returns `false` if it was already gone (fired
    /// once-listener, cleared event, dropped emitter).
    pub fn unsubscribe(&self) -> bool {
        self.table
            .upgrade()
            .is_some_and(|table| table.remove(self.event, self.id))
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Event emitter with an optional external bus
pub struct EventEmitter<E: LoaderEvent> {
    source: String,
    table: Arc<DispatchTable<E>>,
    next_id: AtomicU64,
    bus: Option<Arc<dyn EventBus>>,
}

impl<E: LoaderEvent> EventEmitter<E> {
    /// Create emitter; `source` scopes names forwarded to the bus
    #[must_use]
    pub fn new(source: impl Into<String>, bus: Option<Arc<dyn EventBus>>) -> Self {
        Self {
            source: source.into(),
            table: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            bus,
        }
    }

    /// Register a persistent listener
    pub fn on<F>(&self, event: &'static str, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(callback), false)
    }

    /// Register a listener that fires at most once
    pub fn once<F>(&self, event: &'static str, callback: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(callback), true)
    }

    /// Remove one listener, or every listener of `event` when `id` is `None`.
    /// Returns the number removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        match id {
            Some(id) => usize::from(self.table.remove(event, id)),
            None => self
                .table
                .lock()
                .remove(event)
                .map_or(0, |entries| entries.len()),
        }
    }

    /// Notify listeners of `event.name()`, then forward to the bus
    pub fn emit(&self, event: E) {
        let name = event.name();
        let callbacks: Vec<Callback<E>> = {
            let mut table = self.table.lock();
            match table.get_mut(name) {
                Some(entries) => {
                    let mut fired: Vec<Callback<E>> = entries
                        .iter()
                        .filter(|e| !e.once)
                        .map(|e| Arc::clone(&e.callback))
                        .collect();
                    fired.extend(
                        entries
                            .iter()
                            .filter(|e| e.once)
                            .map(|e| Arc::clone(&e.callback)),
                    );
                    entries.retain(|e| !e.once);
                    if entries.is_empty() {
                        table.remove(name);
                    }
                    fired
                }
                None => Vec::new(),
            }
        };

        for callback in &callbacks {
            callback(&event);
        }

        if let Some(bus) = &self.bus {
            match serde_json::to_value(&event) {
                Ok(payload) => bus.emit(
                    &format!("{}:{}", self.source, name),
                    bus_payload(&self.source, payload),
                ),
                Err(e) => tracing::warn!(source = %self.source, event = name, error = %e, "event not forwarded"),
            }
        }
    }

    /// Listeners registered for `event`
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.table.lock().get(event).map_or(0, Vec::len)
    }

    /// Listeners across all events
    #[must_use]
    pub fn total_listeners(&self) -> usize {
        self.table.lock().values().map(Vec::len).sum()
    }

    /// Drop every listener
    pub fn clear(&self) {
        self.table.lock().clear();
    }

    /// Whether events are forwarded to an external bus
    #[inline]
    #[must_use]
    pub fn has_bus(&self) -> bool {
        self.bus.is_some()
    }

    fn register(&self, event: &'static str, callback: Callback<E>, once: bool) -> ListenerHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table
            .lock()
            .entry(event)
            .or_default()
            .push(ListenerEntry { id, callback, once });

        let table: Arc<dyn ListenerRemoval> = self.table.clone();
        ListenerHandle {
            id,
            event,
            table: Arc::downgrade(&table),
        }
    }
}

impl<E: LoaderEvent> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("source", &self.source)
            .field("listeners", &self.total_listeners())
            .field("bus", &self.bus.is_some())
            .finish()
    }
}
