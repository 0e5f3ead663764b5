//! Dedicated-execution scheduler.
//!
//! Work submitted under a key runs with at most one execution in flight for
//! that key. A second submission waits for the running one to settle and then
//! runs itself (FIFO per key); submissions are never coalesced. Distinct keys
//! run concurrently without a global cap.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Scheduler key builders.
pub mod keys {
    pub fn repo_events(repo_id: i64, project_id: i64) -> String {
        format!("import_repo_events:{}-{}", repo_id, project_id)
    }

    pub fn server_repos(server_id: i64) -> String {
        format!("import_server_repos:{}", server_id)
    }

    pub fn server_users(server_id: i64) -> String {
        format!("import_server_users:{}", server_id)
    }

    /// Every export of a task runs under this key, first attempts included.
    pub fn story_export(project_id: i64, task_id: i64) -> String {
        format!("retry_story_export:{}-{}", project_id, task_id)
    }
}

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct TaskScheduler {
    slots: std::sync::Mutex<HashMap<String, Slot>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under `key` and return its output.
    pub async fn schedule<F, T>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = self.acquire_slot(key);
        let output = {
            let _running = slot.lock().await;
            tracing::debug!(key, "Scheduled work started");
            work.await
        };
        self.release_slot(key, slot);
        tracing::debug!(key, "Scheduled work settled");
        output
    }

    /// Run `work` under `key` on a background task. Failures are logged.
    pub fn spawn<F, E>(self: &Arc<Self>, key: String, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.schedule(&key, work).await {
                tracing::error!(key = %key, error = %e, "Scheduled work failed");
            }
        })
    }

    /// Whether an execution is running or waiting under `key`.
    pub fn in_flight(&self, key: &str) -> bool {
        self.lock_slots().contains_key(key)
    }

    /// Number of keys with running or waiting executions.
    pub fn active_keys(&self) -> usize {
        self.lock_slots().len()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // The map holds no invariants a panicking holder could break.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire_slot(&self, key: &str) -> Slot {
        let mut slots = self.lock_slots();
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    fn release_slot(&self, key: &str, slot: Slot) {
        let mut slots = self.lock_slots();
        // Two references left: the map's and ours. Nobody else is waiting.
        if Arc::strong_count(&slot) == 2
            && slots.get(key).is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            slots.remove(key);
        }
    }
}
