//! Keyed background tasks owned by a loader
//!
//! Polling timers and one-off background work (refreshes, subscription pumps)
//! are spawned through a [`TimerSet`] so `dispose()` can abort all of them.
//! Scheduling a key that already exists replaces the old task.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Keyed set of spawned tasks
#[derive(Debug, Default)]
pub struct TimerSet {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TimerSet {
    /// Create empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, first run one period from now.
    ///
    /// Ticks that fall behind are skipped rather than queued.
    pub fn every<F, Fut>(&self, key: impl Into<String>, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        tracing::debug!(timer = %key, ?period, "scheduling");
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        self.insert(key, handle);
    }

    /// Spawn one-off background work under `key`
    pub fn spawn<Fut>(&self, key: impl Into<String>, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(key.into(), tokio::spawn(fut));
    }

    /// Abort the task under `key`. Returns whether one was running.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tasks.lock().remove(key) {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    /// Abort every task whose key starts with `prefix`
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let mut tasks = self.tasks.lock();
        let keys: Vec<String> = tasks
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(handle) = tasks.remove(key) {
                handle.abort();
            }
        }
        keys.len()
    }

    /// Abort everything. Returns the number of tasks aborted.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (_, handle) in &drained {
            handle.abort();
        }
        drained.len()
    }

    /// Whether a live task runs under `key`
    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .get(key)
            .is_some_and(|h| !h.is_finished())
    }

    /// Keys of live tasks
    #[must_use]
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().values().filter(|h| !h.is_finished()).count()
    }

    /// No live tasks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(key, handle) {
            previous.abort();
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.get_mut().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn every_ticks_until_cancelled() {
        let timers = TimerSet::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        timers.every("poll", Duration::from_secs(1), move || {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert!(timers.cancel("poll"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_task() {
        let timers = TimerSet::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let t = ticks.clone();
            timers.every("widget:a", Duration::from_secs(1), move || {
                let t = t.clone();
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(timers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_and_prefix() {
        let timers = TimerSet::new();
        timers.every("widget:a", Duration::from_secs(1), || async {});
        timers.every("widget:b", Duration::from_secs(1), || async {});
        timers.every("poll", Duration::from_secs(1), || async {});

        assert_eq!(timers.cancel_prefix("widget:"), 2);
        assert_eq!(timers.active_keys(), vec!["poll".to_string()]);
        assert_eq!(timers.cancel_all(), 1);
        assert!(!timers.is_active("poll"));
    }
}
