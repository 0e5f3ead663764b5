//! In-memory export retry queue with exponential backoff.
//!
//! Entries are not persisted. After a restart the queue is reseeded from task
//! rows that are still incomplete or failed (see `SyncEngine::recover_exports`).

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ExportConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            max_attempts: 10,
        }
    }
}

impl From<&ExportConfig> for RetryPolicy {
    fn from(config: &ExportConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub project_id: i64,
    pub task_id: i64,
    pub delay: Duration,
    /// Failed attempts so far, including the one that queued this entry.
    pub attempts: u32,
    pub queued_at: Instant,
}

impl RetryEntry {
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.queued_at) > self.delay
    }
}

/// Outcome of recording a failed retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued { delay: Duration, attempts: u32 },
    Abandoned { attempts: u32 },
}

pub struct ExportRetryQueue {
    entries: std::sync::Mutex<Vec<RetryEntry>>,
    policy: RetryPolicy,
}

impl ExportRetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            entries: std::sync::Mutex::new(Vec::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RetryEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a retry. A task that is already queued keeps its delay and
    /// attempt count and only has its time refreshed. Returns `true` when a
    /// new entry was added.
    pub fn queue(&self, project_id: i64, task_id: i64, delay: Duration, attempts: u32) -> bool {
        self.queue_at(project_id, task_id, delay, attempts, Instant::now())
    }

    pub fn queue_at(
        &self,
        project_id: i64,
        task_id: i64,
        delay: Duration,
        attempts: u32,
        now: Instant,
    ) -> bool {
        let mut entries = self.lock();
        if let Some(existing) = entries
            .iter_mut()
            .find(|e| e.project_id == project_id && e.task_id == task_id)
        {
            existing.queued_at = now;
            return false;
        }
        entries.push(RetryEntry {
            project_id,
            task_id,
            delay,
            attempts,
            queued_at: now,
        });
        true
    }

    /// First failure of an export: base delay, one attempt.
    pub fn queue_first_failure(&self, project_id: i64, task_id: i64) -> bool {
        self.queue(project_id, task_id, self.policy.base_delay, 1)
    }

    /// Remove and return every entry due at `now`.
    pub fn take_due(&self, now: Instant) -> Vec<RetryEntry> {
        let mut entries = self.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.is_due(now));
        *entries = waiting;
        due
    }

    /// Record that a retry of `entry` failed again: double the delay and
    /// requeue, or drop the entry once the attempt cap is reached.
    pub fn record_failure(&self, entry: &RetryEntry) -> RetryOutcome {
        self.record_failure_at(entry, Instant::now())
    }

    pub fn record_failure_at(&self, entry: &RetryEntry, now: Instant) -> RetryOutcome {
        let attempts = entry.attempts.saturating_add(1);
        if self.policy.is_exhausted(attempts) {
            return RetryOutcome::Abandoned { attempts };
        }
        let delay = self.policy.next_delay(entry.delay);
        self.queue_at(entry.project_id, entry.task_id, delay, attempts, now);
        RetryOutcome::Requeued { delay, attempts }
    }

    pub fn remove(&self, project_id: i64, task_id: i64) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !(e.project_id == project_id && e.task_id == task_id));
        entries.len() != before
    }

    pub fn get(&self, project_id: i64, task_id: i64) -> Option<RetryEntry> {
        self.lock()
            .iter()
            .find(|e| e.project_id == project_id && e.task_id == task_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
