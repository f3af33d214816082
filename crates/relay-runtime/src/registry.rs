//! Process-wide coordination primitives that replace the teacher's DI-container
//! globals (§9 "Global state"): explicit values passed into the [`crate::builder::Builder`]
//! instead of ambient statics.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Guards idempotent one-shot setup (e.g. "register fanout job for topic X exactly
/// once per process") with test-and-set semantics on a normalized key.
#[derive(Default)]
pub struct OnceExecutionRegistry {
    seen: Mutex<HashSet<String>>,
}

impl OnceExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is seen, `false` on every subsequent call.
    pub fn try_execute_once(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().expect("once-execution registry poisoned");
        seen.insert(key.to_string())
    }
}

/// Reference-counted set of named readiness steps. Background loops await
/// [`StartupLatch::wait_ready`] before their first claim so they never race a schema
/// migration or other host-defined bootstrap step that hasn't finished yet.
pub struct StartupLatch {
    pending: Mutex<HashSet<String>>,
    notify: Notify,
}

impl Default for StartupLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupLatch {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Register a step that must complete before the latch is ready. Steps registered
    /// after the latch has already gone ready re-open it.
    pub fn register(&self, step: &str) {
        let mut pending = self.pending.lock().expect("startup latch poisoned");
        pending.insert(step.to_string());
    }

    /// Mark a step complete. If this was the last pending step, wakes every waiter.
    pub fn complete(&self, step: &str) {
        let now_empty = {
            let mut pending = self.pending.lock().expect("startup latch poisoned");
            pending.remove(step);
            pending.is_empty()
        };
        if now_empty {
            self.notify.notify_waiters();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pending.lock().expect("startup latch poisoned").is_empty()
    }

    /// Resolve once `is_ready()` is true, polling the notifier rather than busy-waiting.
    pub async fn wait_ready(&self) {
        loop {
            if self.is_ready() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn once_execution_registry_fires_exactly_once_per_key() {
        let registry = OnceExecutionRegistry::new();
        assert!(registry.try_execute_once("fanout-etl"));
        assert!(!registry.try_execute_once("fanout-etl"));
        assert!(registry.try_execute_once("fanout-other"));
    }

    #[tokio::test]
    async fn startup_latch_blocks_until_every_registered_step_completes() {
        let latch = Arc::new(StartupLatch::new());
        latch.register("schema-deployment");
        latch.register("discovery-seed");
        assert!(!latch.is_ready());

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move {
                latch.wait_ready().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.complete("schema-deployment");
        assert!(!latch.is_ready());
        latch.complete("discovery-seed");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should have released the waiter")
            .unwrap();
    }
}
