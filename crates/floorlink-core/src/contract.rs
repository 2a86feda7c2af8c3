//! Loader lifecycle contract
//!
//! [`LoaderCore`] is the shared base each concrete loader embeds. It owns the
//! state machine, the re-entrancy guard, the cancellation slot, background
//! timers and the event emitter, and implements the parts of the lifecycle
//! that are identical for every data source:
//!
//! - `initialize` is idempotent and moves `Idle → Initializing → Ready`
//! - `load` requires initialization and allows at most one fetch in flight;
//!   a concurrent call gets the last known output instead
//! - `abort` cancels the pending load and frees the guard immediately
//! - `dispose` is terminal, idempotent, and releases timers and listeners
//!
//! Calls made in the wrong state never panic and never move the state
//! machine: they are logged and returned as [`LoaderError::State`].

use crate::cancel::AbortSlot;
use crate::error::{ErrorKind, LoaderError};
use crate::events::{EventBus, EventEmitter, LifecycleEvent, ListenerHandle, ListenerId, LoaderEvent};
use crate::state::{validate_transition, LoaderState};
use crate::timers::TimerSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Observable status of a loader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoaderStatus {
    /// Loader name
    pub name: String,
    /// Instance id
    pub instance_id: Uuid,
    /// Current state
    pub state: LoaderState,
    /// `initialize()` completed and the loader is not disposed
    pub initialized: bool,
    /// A load is in flight
    pub loading: bool,
    /// Most recent failure
    pub last_error: Option<LoaderError>,
    /// Completion time of the most recent successful load
    pub last_loaded_at: Option<DateTime<Utc>>,
    /// Successful loads
    pub load_count: u64,
    /// Failed initializes and loads
    pub error_count: u64,
    /// Registered listeners
    pub listener_count: usize,
    /// Live background tasks
    pub active_timers: usize,
}

/// Result of `health_check()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Loader name
    pub loader: String,
    /// No issues found
    pub healthy: bool,
    /// State at check time
    pub state: LoaderState,
    /// Check time
    pub checked_at: DateTime<Utc>,
    /// Human-readable problems
    pub issues: Vec<String>,
}

impl HealthReport {
    /// Add an issue; marks the report unhealthy
    pub fn push_issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
        self.healthy = false;
    }
}

#[derive(Debug, Default)]
struct Counters {
    last_error: Option<LoaderError>,
    last_loaded_at: Option<DateTime<Utc>>,
    load_count: u64,
    error_count: u64,
}

/// Shared lifecycle base for concrete loaders
#[derive(Debug)]
pub struct LoaderCore<E: LoaderEvent> {
    name: String,
    instance_id: Uuid,
    state: Mutex<LoaderState>,
    initialized: AtomicBool,
    counters: Mutex<Counters>,
    emitter: EventEmitter<E>,
    abort: AbortSlot,
    timers: TimerSet,
}

impl<E> LoaderCore<E>
where
    E: LoaderEvent + From<LifecycleEvent>,
{
    /// Create core in `Idle`
    #[must_use]
    pub fn new(name: impl Into<String>, bus: Option<Arc<dyn EventBus>>) -> Self {
        let name = name.into();
        Self {
            emitter: EventEmitter::new(name.clone(), bus),
            name,
            instance_id: Uuid::new_v4(),
            state: Mutex::new(LoaderState::Idle),
            initialized: AtomicBool::new(false),
            counters: Mutex::new(Counters::default()),
            abort: AbortSlot::new(),
            timers: TimerSet::new(),
        }
    }

    /// Loader name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> LoaderState {
        *self.state.lock()
    }

    /// `Disposing` or `Disposed`
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state().is_shutting_down()
    }

    /// `initialize()` completed and not disposed
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// A load is in flight
    #[inline]
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.abort.is_pending()
    }

    /// Background tasks of this loader
    #[inline]
    #[must_use]
    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Event emitter of this loader
    #[inline]
    #[must_use]
    pub fn emitter(&self) -> &EventEmitter<E> {
        &self.emitter
    }

    /// Notify listeners
    #[inline]
    pub fn emit(&self, event: impl Into<E>) {
        self.emitter.emit(event.into());
    }

    /// Move the state machine. Illegal edges are logged and ignored.
    pub fn transition(&self, to: LoaderState) -> bool {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if let Err(e) = validate_transition(from, to) {
                tracing::warn!(loader = %self.name, error = %e, "ignoring transition");
                return false;
            }
            *state = to;
            from
        };
        tracing::debug!(loader = %self.name, %from, %to, "state changed");
        self.emit(LifecycleEvent::StateChanged { from, to });
        true
    }

    /// Build the error returned for a call made in the wrong state
    pub fn reject(&self, operation: &'static str) -> LoaderError {
        let state = self.state();
        tracing::warn!(loader = %self.name, operation, %state, "call ignored in current state");
        LoaderError::State { operation, state }
    }

    /// Record a failure: `→ Error`, error event, counters
    pub fn fail(&self, error: &LoaderError) {
        tracing::error!(loader = %self.name, error = %error, "operation failed");
        {
            let mut counters = self.counters.lock();
            counters.last_error = Some(error.clone());
            counters.error_count += 1;
        }
        self.transition(LoaderState::Error);
        self.emit(LifecycleEvent::Error {
            message: error.to_string(),
            kind: error.kind(),
            timestamp: Utc::now(),
        });
    }

    /// Report a recoverable problem without changing state
    pub fn warn(&self, error: &LoaderError) {
        tracing::warn!(loader = %self.name, error = %error, "recoverable failure");
        self.emit(LifecycleEvent::Warning {
            message: error.to_string(),
            kind: error.kind(),
            timestamp: Utc::now(),
        });
    }

    /// Run the idempotent initialize sequence around `setup`.
    ///
    /// # Errors
    /// - `LoaderError::State` when disposed or already initializing
    /// - `LoaderError::Initialization` wrapping whatever `setup` failed with
    pub async fn initialize_with<F, Fut>(&self, setup: F) -> Result<(), LoaderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), LoaderError>>,
    {
        let state = self.state();
        if state.is_shutting_down() || state == LoaderState::Initializing {
            return Err(self.reject("initialize"));
        }
        if self.is_initialized() {
            tracing::warn!(loader = %self.name, "already initialized");
            return Ok(());
        }

        self.transition(LoaderState::Initializing);
        let result = setup().await;
        if self.is_disposed() {
            return Err(self.reject("initialize"));
        }

        match result {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                self.transition(LoaderState::Ready);
                self.emit(LifecycleEvent::Initialized);
                tracing::info!(loader = %self.name, "initialized");
                Ok(())
            }
            Err(error) => {
                let error = match error {
                    e @ (LoaderError::Initialization(_) | LoaderError::MissingDependency(_)) => e,
                    other => LoaderError::Initialization(other.to_string()),
                };
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Run one guarded load around `fetch`.
    ///
    /// `last` holds the loader's most recent output; a call made while another
    /// load is in flight returns a clone of it without fetching.
    ///
    /// # Errors
    /// - `LoaderError::State` when disposed, not initialized, or loading with
    ///   no previous output
    /// - `LoaderError::Cancelled` when aborted or disposed mid-flight
    /// - whatever `fetch` failed with
    pub async fn load_with<T, F, Fut>(&self, last: &Mutex<Option<T>>, fetch: F) -> Result<T, LoaderError>
    where
        T: Clone,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, LoaderError>>,
    {
        if self.is_disposed() || !self.is_initialized() {
            return Err(self.reject("load"));
        }

        let Some(ticket) = self.abort.try_begin() else {
            tracing::debug!(loader = %self.name, "load already in flight");
            return last.lock().clone().ok_or(LoaderError::State {
                operation: "load",
                state: LoaderState::Loading,
            });
        };

        if !self.transition(LoaderState::Loading) {
            self.abort.finish(&ticket);
            return Err(self.reject("load"));
        }

        let result = fetch(ticket.token().clone()).await;

        if !self.abort.finish(&ticket) {
            tracing::debug!(loader = %self.name, "discarding result of cancelled load");
            return Err(LoaderError::Cancelled);
        }

        match result {
            Ok(output) => {
                *last.lock() = Some(output.clone());
                let (load_count, at) = {
                    let mut counters = self.counters.lock();
                    counters.load_count += 1;
                    let at = Utc::now();
                    counters.last_loaded_at = Some(at);
                    (counters.load_count, at)
                };
                self.transition(LoaderState::Loaded);
                self.emit(LifecycleEvent::Loaded { load_count, at });
                Ok(output)
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Cancel the pending load. Returns whether anything was cancelled.
    pub fn abort(&self) -> bool {
        if self.is_disposed() || !self.abort.abort() {
            return false;
        }
        tracing::info!(loader = %self.name, "pending load aborted");
        self.counters.lock().last_error = Some(LoaderError::Cancelled);
        self.transition(LoaderState::Error);
        self.emit(LifecycleEvent::Aborted);
        true
    }

    /// First half of `dispose()`: `→ Disposing`, cancel pending work and
    /// timers. Returns `false` if already disposing or disposed.
    pub fn begin_dispose(&self) -> bool {
        if self.is_disposed() {
            tracing::debug!(loader = %self.name, "dispose ignored, already disposed");
            return false;
        }
        self.transition(LoaderState::Disposing);
        self.abort.abort();
        let aborted = self.timers.cancel_all();
        self.initialized.store(false, Ordering::Release);
        tracing::debug!(loader = %self.name, timers = aborted, "disposing");
        true
    }

    /// Second half of `dispose()`: `→ Disposed`, notify, drop all listeners
    pub fn finish_dispose(&self) {
        self.transition(LoaderState::Disposed);
        self.emit(LifecycleEvent::Disposed);
        self.emitter.clear();
        tracing::info!(loader = %self.name, "disposed");
    }

    /// Snapshot of the status counters
    #[must_use]
    pub fn status(&self) -> LoaderStatus {
        let counters = self.counters.lock();
        LoaderStatus {
            name: self.name.clone(),
            instance_id: self.instance_id,
            state: self.state(),
            initialized: self.is_initialized(),
            loading: self.is_loading(),
            last_error: counters.last_error.clone(),
            last_loaded_at: counters.last_loaded_at,
            load_count: counters.load_count,
            error_count: counters.error_count,
            listener_count: self.emitter.total_listeners(),
            active_timers: self.timers.len(),
        }
    }

    /// Baseline health: not disposed, not in `Error`
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let state = self.state();
        let mut report = HealthReport {
            loader: self.name.clone(),
            healthy: true,
            state,
            checked_at: Utc::now(),
            issues: Vec::new(),
        };
        match state {
            LoaderState::Disposing | LoaderState::Disposed => report.push_issue("loader disposed"),
            LoaderState::Idle => report.push_issue("loader not initialized"),
            LoaderState::Error => {
                let last = self.counters.lock().last_error.clone();
                let detail = last.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
                report.push_issue(format!("last operation failed: {detail}"));
            }
            _ => {}
        }
        report
    }

    /// Kind of the most recent error, if any
    #[must_use]
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.counters.lock().last_error.as_ref().map(LoaderError::kind)
    }
}

/// Uniform surface of every loader
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Parameters accepted by `load`
    type Params: Send + 'static;
    /// Result of a successful load
    type Output: Clone + Send + 'static;
    /// Events emitted by this loader
    type Event: LoaderEvent + From<LifecycleEvent>;

    /// Shared lifecycle base
    fn core(&self) -> &LoaderCore<Self::Event>;

    /// Allocate resources; idempotent
    async fn initialize(&self) -> Result<(), LoaderError>;

    /// Fetch and publish data
    async fn load(&self, params: Self::Params) -> Result<Self::Output, LoaderError>;

    /// Cancel in-flight work, then load
    async fn reload(&self, params: Self::Params) -> Result<Self::Output, LoaderError> {
        self.abort();
        self.load(params).await
    }

    /// Cancel the pending load
    fn abort(&self) -> bool {
        self.core().abort()
    }

    /// Terminal teardown; idempotent
    async fn dispose(&self);

    /// Current status
    fn status(&self) -> LoaderStatus {
        self.core().status()
    }

    /// Health report
    async fn health_check(&self) -> HealthReport {
        self.core().health()
    }

    /// Re-open live channels without reloading; loaders without one succeed
    async fn reconnect(&self) -> Result<(), LoaderError> {
        if self.core().is_disposed() {
            return Err(self.core().reject("reconnect"));
        }
        Ok(())
    }

    /// Register a persistent listener
    fn on<F>(&self, event: &'static str, callback: F) -> ListenerHandle
    where
        F: Fn(&Self::Event) + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().emitter().on(event, callback)
    }

    /// Register a one-shot listener
    fn once<F>(&self, event: &'static str, callback: F) -> ListenerHandle
    where
        F: Fn(&Self::Event) + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().emitter().once(event, callback)
    }

    /// Remove one listener or, with `None`, all listeners of `event`
    fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        self.core().emitter().off(event, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type Core = LoaderCore<LifecycleEvent>;

    async fn ready_core() -> Core {
        let core = Core::new("test", None);
        core.initialize_with(|| async { Ok(()) }).await.unwrap();
        core
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let core = Core::new("test", None);
        let setups = &AtomicUsize::new(0);

        for _ in 0..3 {
            core.initialize_with(move || async move {
                setups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }

        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert_eq!(core.state(), LoaderState::Ready);
    }

    #[tokio::test]
    async fn failed_initialize_can_be_retried() {
        let core = Core::new("test", None);
        let err = core
            .initialize_with(|| async { Err(LoaderError::network("no route")) })
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::Initialization(_)));
        assert_eq!(core.state(), LoaderState::Error);
        assert!(!core.is_initialized());

        core.initialize_with(|| async { Ok(()) }).await.unwrap();
        assert_eq!(core.state(), LoaderState::Ready);
    }

    #[tokio::test]
    async fn load_requires_initialize() {
        let core = Core::new("test", None);
        let last = Mutex::new(None::<u32>);
        let err = core.load_with(&last, |_| async { Ok(1) }).await.unwrap_err();
        assert_eq!(
            err,
            LoaderError::State {
                operation: "load",
                state: LoaderState::Idle
            }
        );
        assert_eq!(core.state(), LoaderState::Idle);
    }

    #[tokio::test]
    async fn load_records_success() {
        let core = ready_core().await;
        let last = Mutex::new(None);
        assert_eq!(core.load_with(&last, |_| async { Ok(5) }).await, Ok(5));

        let status = core.status();
        assert_eq!(status.state, LoaderState::Loaded);
        assert_eq!(status.load_count, 1);
        assert!(status.last_loaded_at.is_some());
        assert_eq!(*last.lock(), Some(5));
    }

    #[tokio::test]
    async fn load_failure_sets_error_and_emits() {
        let core = ready_core().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        core.emitter().on(LifecycleEvent::ERROR, move |e| s.lock().push(e.clone()));

        let last = Mutex::new(None::<u32>);
        let err = core
            .load_with(&last, |_| async { Err(LoaderError::validation("bad")) })
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::Validation(_)));
        let status = core.status();
        assert_eq!(status.state, LoaderState::Error);
        assert_eq!(status.last_error, Some(err));
        assert_eq!(status.error_count, 1);
        assert!(matches!(
            seen.lock().as_slice(),
            [LifecycleEvent::Error { kind: ErrorKind::Validation, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_load_returns_last_output() {
        let core = ready_core().await;
        let last = Mutex::new(Some(1));
        let fetches = &AtomicUsize::new(0);

        let slow = core.load_with(&last, move |_| async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(2)
        });
        let fast = core.load_with(&last, move |_| async move {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });

        let (a, b) = tokio::join!(slow, fast);
        assert_eq!(a, Ok(2));
        assert_eq!(b, Ok(1));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_in_flight_load() {
        let core = Arc::new(ready_core().await);
        let last = Arc::new(Mutex::new(None::<u32>));

        let c = core.clone();
        let l = last.clone();
        let task = tokio::spawn(async move {
            c.load_with(&l, |token| async move {
                token.cancelled().await;
                Err(LoaderError::Cancelled)
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(core.is_loading());
        assert!(core.abort());
        assert!(!core.is_loading());
        assert!(!core.abort());

        assert_eq!(task.await.unwrap(), Err(LoaderError::Cancelled));
        assert_eq!(core.state(), LoaderState::Error);
        assert_eq!(core.status().error_count, 0);
    }

    #[tokio::test]
    async fn dispose_is_terminal_and_idempotent() {
        let core = ready_core().await;
        core.emitter().on(LifecycleEvent::LOADED, |_| {});

        assert!(core.begin_dispose());
        core.finish_dispose();
        let first = core.status();

        assert!(!core.begin_dispose());
        let second = core.status();

        assert_eq!(first, second);
        assert_eq!(second.state, LoaderState::Disposed);
        assert_eq!(second.listener_count, 0);
        assert!(!second.initialized);

        let last = Mutex::new(None::<u32>);
        assert!(core.load_with(&last, |_| async { Ok(1) }).await.is_err());
        assert!(core.initialize_with(|| async { Ok(()) }).await.is_err());
        assert!(!core.abort());
        assert_eq!(core.state(), LoaderState::Disposed);
    }

    #[tokio::test]
    async fn health_reflects_state() {
        let core = Core::new("test", None);
        assert!(!core.health().healthy);

        core.initialize_with(|| async { Ok(()) }).await.unwrap();
        assert!(core.health().healthy);

        core.fail(&LoaderError::network("down"));
        let report = core.health();
        assert!(!report.healthy);
        assert!(report.issues[0].contains("down"));
    }

    #[tokio::test]
    async fn state_changes_are_emitted_in_order() {
        let core = Core::new("test", None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        core.emitter().on(LifecycleEvent::STATE_CHANGED, move |e| {
            if let LifecycleEvent::StateChanged { to, .. } = e {
                s.lock().push(*to);
            }
        });

        core.initialize_with(|| async { Ok(()) }).await.unwrap();
        let last = Mutex::new(None);
        core.load_with(&last, |_| async { Ok(()) }).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                LoaderState::Initializing,
                LoaderState::Ready,
                LoaderState::Loading,
                LoaderState::Loaded
            ]
        );
    }
}
