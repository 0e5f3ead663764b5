//! Issue export: turning a local issue story into a forge issue.
//!
//! Every export runs under the task's scheduler key, so one task is never
//! exported by two overlapping attempts. In-flight exports are tracked so the
//! project hook can wait for them to settle before importing (otherwise the
//! hook for our own issue write could race the story update).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;

use super::SyncEngine;
use super::links::{self, relation};
use super::models::{ExternalLink, IssuePayload, Server, Story, Task, TaskAction};
use super::retry::{RetryEntry, RetryOutcome};
use super::scheduler::keys;
use crate::errors::{SyncError, SyncResult};

// ── Tracker ───────────────────────────────────────────────────────────

type Pending = Arc<std::sync::Mutex<HashMap<u64, watch::Receiver<()>>>>;

#[derive(Default)]
pub struct ExportTracker {
    pending: Pending,
    next_id: AtomicU64,
}

/// Marks one export as in flight until dropped.
pub struct ExportGuard {
    pending: Pending,
    id: u64,
    _settled: watch::Sender<()>,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.remove(&self.id);
    }
}

impl ExportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> ExportGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(());
        self.lock().insert(id, rx);
        ExportGuard {
            pending: Arc::clone(&self.pending),
            id,
            _settled: tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, watch::Receiver<()>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Wait until every export in flight at the time of the call has settled.
    /// Exports started afterwards are not waited for.
    pub async fn wait_for_all(&self) {
        let snapshot: Vec<watch::Receiver<()>> = self.lock().values().cloned().collect();
        join_all(snapshot.into_iter().map(|mut rx| async move {
            // Resolves with an error once the guard drops its sender.
            while rx.changed().await.is_ok() {}
        }))
        .await;
    }
}

// ── Exporter ──────────────────────────────────────────────────────────

fn issue_payload(story: &Story, sudo: Option<String>) -> IssuePayload {
    IssuePayload {
        title: story
            .details
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Story {}", story.id)),
        description: story.details.text.clone().unwrap_or_default(),
        labels: story.details.labels.clone(),
        confidential: story.details.confidential,
        sudo,
    }
}

/// Remote issue number of a story already exported to (or imported from)
/// `server_id`. The story's link is the record; the task's last exported
/// issue covers links written before the number was kept there.
fn existing_issue_number(story: &Story, task: &Task, server_id: i64) -> Option<i64> {
    let link = links::find_link(&story.external, server_id)?;
    let issue_id = link.remote_number(relation::ISSUE)?;
    link.remote_number(relation::ISSUE_NUMBER).or_else(|| {
        task.details
            .issue
            .as_ref()
            .filter(|issue| issue.id == issue_id)
            .map(|issue| issue.number)
    })
}

impl SyncEngine {
    /// Export one task's story. On failure the task is marked failed with
    /// the error recorded, and the error is returned. Runs unscheduled and
    /// untracked; engine paths go through `run_export`.
    pub async fn export_story(&self, project_id: i64, task_id: i64) -> SyncResult<Task> {
        match self.try_export(project_id, task_id).await {
            Ok(task) => {
                tracing::info!(project_id, task_id, "Exported story");
                Ok(task)
            }
            Err(err) => {
                tracing::warn!(project_id, task_id, error = %err, "Story export failed");
                if !matches!(err, SyncError::TaskNotFound { .. }) {
                    let message = err.to_string();
                    let recorded = self
                        .db
                        .call(move |db| db.mark_task_failed(project_id, task_id, &message))
                        .await;
                    if let Err(e) = recorded {
                        tracing::error!(project_id, task_id, error = %e, "Failed to record export failure");
                    }
                }
                Err(err)
            }
        }
    }

    async fn try_export(&self, project_id: i64, task_id: i64) -> SyncResult<Task> {
        let task = self
            .db
            .call(move |db| db.get_task(project_id, task_id))
            .await
            .map_err(SyncError::Database)?
            .ok_or(SyncError::TaskNotFound { project_id, id: task_id })?;
        if task.action != TaskAction::ExportIssue {
            return Err(SyncError::NotExportable {
                task_id,
                reason: format!("action is {}", task.action.as_str()),
            });
        }
        let story_id = task.options.story_id.ok_or_else(|| SyncError::NotExportable {
            task_id,
            reason: "no story".into(),
        })?;
        let story = self
            .db
            .call(move |db| db.get_story(project_id, story_id))
            .await
            .map_err(SyncError::Database)?
            .ok_or(SyncError::StoryNotFound { project_id, id: story_id })?;
        let repo_id = task
            .options
            .repo_id
            .or(story.repo_id)
            .ok_or_else(|| SyncError::NotExportable {
                task_id,
                reason: "no target repo".into(),
            })?;
        let repo = self.load_repo(repo_id).await?;
        let server = self
            .linked_active_servers(&repo)
            .await?
            .into_iter()
            .next()
            .ok_or(SyncError::MissingLink { repo_id, server_id: 0 })?;
        let remote_repo = links::find_link(&repo.external, server.id)
            .and_then(|link| link.remote_number(relation::PROJECT))
            .ok_or(SyncError::MissingLink { repo_id, server_id: server.id })?;

        if task.completion < 50 {
            self.db
                .call(move |db| db.set_task_completion(project_id, task_id, 50))
                .await
                .map_err(SyncError::Database)?;
        }

        let sudo = self.sudo_for(&server, task.user_id).await?;
        let payload = issue_payload(&story, sudo);
        let number = existing_issue_number(&story, &task, server.id);
        let issue = self
            .forge
            .create_or_update_issue(&server, remote_repo, number, &payload)
            .await?;

        let link = ExternalLink::for_server(&server)
            .with(relation::PROJECT, remote_repo)
            .with(relation::ISSUE, issue.id)
            .with(relation::ISSUE_NUMBER, issue.number);
        let time = super::db::now();
        self.db
            .call(move |db| {
                db.mark_story_exported(project_id, story_id, link, Some(issue.number), time)?;
                db.mark_task_exported(project_id, task_id, &issue, time)
            })
            .await
            .map_err(SyncError::Database)
    }

    /// Forge account to act as: the exporting user's id on `server`.
    async fn sudo_for(&self, server: &Server, user_id: Option<i64>) -> SyncResult<Option<String>> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        let server_id = server.id;
        let user = self
            .db
            .call(move |db| db.get_user(user_id))
            .await
            .map_err(SyncError::Database)?;
        Ok(user
            .and_then(|u| links::find_link(&u.external, server_id).cloned())
            .and_then(|link| link.remote_id(relation::USER).map(|id| id.to_string())))
    }

    /// Export under the task's scheduler key. The export counts as in flight
    /// from the moment it is requested, including time spent waiting for the
    /// key.
    pub async fn run_export(&self, project_id: i64, task_id: i64) -> SyncResult<Task> {
        let _guard = self.exports.begin();
        self.scheduler
            .schedule(&keys::story_export(project_id, task_id), self.export_story(project_id, task_id))
            .await
    }

    /// Export and queue a first retry on failure.
    pub async fn export_or_queue(&self, project_id: i64, task_id: i64) {
        match self.run_export(project_id, task_id).await {
            Ok(_) => {
                self.retries.remove(project_id, task_id);
            }
            Err(SyncError::TaskNotFound { .. }) => {
                self.retries.remove(project_id, task_id);
            }
            Err(_) => {
                self.retries.queue_first_failure(project_id, task_id);
                tracing::info!(project_id, task_id, "Queued export retry");
            }
        }
    }

    pub fn spawn_export(self: &Arc<Self>, project_id: i64, task_id: i64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.export_or_queue(project_id, task_id).await });
    }

    async fn retry_entry(&self, entry: RetryEntry, now: Instant) {
        let (project_id, task_id) = (entry.project_id, entry.task_id);
        match self.run_export(project_id, task_id).await {
            Ok(_) => {
                tracing::info!(project_id, task_id, attempts = entry.attempts + 1, "Export retry succeeded");
            }
            Err(SyncError::TaskNotFound { .. }) => {}
            Err(_) => match self.retries.record_failure_at(&entry, now) {
                RetryOutcome::Requeued { delay, attempts } => {
                    tracing::info!(project_id, task_id, attempts, delay_secs = delay.as_secs(), "Export retry requeued");
                }
                RetryOutcome::Abandoned { attempts } => {
                    tracing::warn!(project_id, task_id, attempts, "Export abandoned after repeated failures");
                }
            },
        }
    }

    /// Run every retry due at `now`. Returns how many were attempted.
    pub async fn sweep_export_retries(&self, now: Instant) -> usize {
        let due = self.retries.take_due(now);
        let count = due.len();
        join_all(due.into_iter().map(|entry| self.retry_entry(entry, now))).await;
        count
    }

    /// Re-export an issue story after a local edit, provided the export
    /// task's user is one of the story's authors.
    ///
    /// A completed export is reset to 50% and run again. An export that is
    /// still pending is requested again; the scheduler runs it after the
    /// current attempt, so the edit is picked up either way.
    pub async fn reexport_story(&self, project_id: i64, story_id: i64) -> SyncResult<Option<i64>> {
        let found = self
            .db
            .call(move |db| {
                let Some(story) = db.get_story(project_id, story_id)? else {
                    return Ok(None);
                };
                let task = match db.find_completed_export_task(project_id, story_id)? {
                    Some(task) => Some(task),
                    None => db.find_pending_export_task(project_id, story_id)?,
                };
                Ok(task.map(|task| (story, task)))
            })
            .await
            .map_err(SyncError::Database)?;
        let Some((story, task)) = found else {
            tracing::debug!(project_id, story_id, "No export task for story");
            return Ok(None);
        };
        if !task.user_id.is_some_and(|user_id| story.user_ids.contains(&user_id)) {
            tracing::debug!(project_id, story_id, task_id = task.id, "Exporting user is not an author; skipping");
            return Ok(None);
        }

        let task_id = task.id;
        if task.completion >= 100 && !task.failed {
            self.db
                .call(move |db| db.set_task_completion(project_id, task_id, 50))
                .await
                .map_err(SyncError::Database)?;
        } else {
            tracing::info!(
                project_id, story_id, task_id, completion = task.completion, failed = task.failed,
                "Story edited while its export is pending; exporting again"
            );
        }
        self.export_or_queue(project_id, task_id).await;
        Ok(Some(task_id))
    }

    /// Seed the retry queue with recent export tasks that are incomplete or
    /// failed. Returns the number queued.
    pub async fn recover_exports(&self) -> SyncResult<usize> {
        let since = super::db::now() - chrono::Duration::days(self.config.export.recovery_window_days);
        let tasks = self
            .db
            .call(move |db| db.list_pending_exports(since))
            .await
            .map_err(SyncError::Database)?;
        let delay = Duration::from_secs(self.config.export.recovery_delay_secs);
        let mut queued = 0;
        for task in tasks {
            let Some(project_id) = task.project_id else {
                continue;
            };
            if self.retries.queue(project_id, task.id, delay, 1) {
                queued += 1;
            }
        }
        tracing::info!(queued, "Recovered pending exports");
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::db::{DbHandle, SyncDb};
    use crate::engine::models::{
        ApiSettings, RepoDetails, ServerSettings, ServerType, StoryDetails, StoryType, TaskOptions,
        TaskState, WriteOrigin,
    };
    use crate::engine::testing::{ForgeCall, MockForge};

    struct Fixture {
        engine: Arc<SyncEngine>,
        forge: Arc<MockForge>,
        server_id: i64,
        repo_id: i64,
        project_id: i64,
        story_id: i64,
        task_id: i64,
    }

    fn fixture() -> Fixture {
        let db = DbHandle::new(SyncDb::new_in_memory().unwrap());
        let forge = Arc::new(MockForge::new());
        let engine = Arc::new(SyncEngine::new(db, forge.clone(), SyncConfig::default()));
        let (server_id, repo_id, project_id, story_id, task_id) = {
            let db = engine.db.lock_sync().unwrap();
            let settings = ServerSettings {
                api: ApiSettings { access_token: Some("t".into()) },
                ..Default::default()
            };
            let server = db.insert_server(ServerType::Gitlab, "gl", "https://gl.test", &settings).unwrap();
            let repo = db
                .insert_repo(
                    "api",
                    &RepoDetails::default(),
                    &[ExternalLink::for_server(&server).with(relation::PROJECT, 42)],
                )
                .unwrap();
            let user = db
                .insert_user("ann", "Ann", None, &[ExternalLink::for_server(&server).with(relation::USER, 7)])
                .unwrap();
            let project = db.insert_project("p", &[repo.id]).unwrap();
            let story = db
                .insert_story(
                    project.id,
                    StoryType::Issue,
                    &[user.id],
                    &StoryDetails {
                        title: Some("Bug".into()),
                        text: Some("Details".into()),
                        labels: vec!["ui".into()],
                        ..Default::default()
                    },
                )
                .unwrap();
            let task = db
                .insert_task(
                    Some(project.id),
                    TaskAction::ExportIssue,
                    Some(user.id),
                    &TaskOptions { story_id: Some(story.id), repo_id: Some(repo.id) },
                )
                .unwrap();
            (server.id, repo.id, project.id, story.id, task.id)
        };
        Fixture { engine, forge, server_id, repo_id, project_id, story_id, task_id }
    }

    #[tokio::test]
    async fn test_export_creates_issue_and_marks_rows() {
        let f = fixture();
        let task = f.engine.export_story(f.project_id, f.task_id).await.unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.completion, 100);
        assert_eq!(task.details.issue.as_ref().map(|i| i.number), Some(1));

        let (project_id, story_id) = (f.project_id, f.story_id);
        let story = f.engine.db.call(move |db| db.get_story(project_id, story_id)).await.unwrap().unwrap();
        assert_eq!(story.write_origin(), WriteOrigin::Export);
        let link = links::find_link(&story.external, f.server_id).unwrap();
        assert_eq!(link.remote_number(relation::ISSUE_NUMBER), Some(1));

        match &f.forge.issue_calls()[0] {
            ForgeCall::UpsertIssue { number, title, sudo, remote_repo_id, .. } => {
                assert_eq!(*number, None);
                assert_eq!(title, "Bug");
                assert_eq!(sudo.as_deref(), Some("7"));
                assert_eq!(*remote_repo_id, 42);
            }
            other => panic!("Expected UpsertIssue, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_export_updates_same_issue() {
        let f = fixture();
        f.engine.export_story(f.project_id, f.task_id).await.unwrap();
        f.engine.export_story(f.project_id, f.task_id).await.unwrap();
        let calls = f.forge.issue_calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[1], ForgeCall::UpsertIssue { number: Some(1), .. }));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_task() {
        let f = fixture();
        f.forge.fail_next_issue_calls(1);
        let err = f.engine.export_story(f.project_id, f.task_id).await.unwrap_err();
        assert!(err.is_transient());

        let (project_id, task_id) = (f.project_id, f.task_id);
        let task = f.engine.db.call(move |db| db.get_task(project_id, task_id)).await.unwrap().unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.details.error.unwrap().contains("502"));
    }

    #[tokio::test]
    async fn test_export_or_queue_queues_first_failure() {
        let f = fixture();
        f.forge.fail_next_issue_calls(1);
        f.engine.export_or_queue(f.project_id, f.task_id).await;
        let entry = f.engine.retries.get(f.project_id, f.task_id).expect("queued");
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_missing_task() {
        let f = fixture();
        let err = f.engine.export_story(f.project_id, 9999).await.unwrap_err();
        assert!(matches!(err, SyncError::TaskNotFound { .. }));
        f.engine.export_or_queue(f.project_id, 9999).await;
        assert!(f.engine.retries.is_empty());
    }

    async fn edit_story(f: &Fixture, details: StoryDetails) {
        let (project_id, story_id) = (f.project_id, f.story_id);
        f.engine
            .db
            .call(move |db| db.update_story_details(project_id, story_id, &details))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reexport_after_edit_updates_same_issue() {
        let f = fixture();
        f.engine.export_story(f.project_id, f.task_id).await.unwrap();
        // A user edit replaces details wholesale, number included.
        edit_story(&f, StoryDetails { title: Some("Bug v2".into()), ..Default::default() }).await;

        let task_id = f.engine.reexport_story(f.project_id, f.story_id).await.unwrap();
        assert_eq!(task_id, Some(f.task_id));
        let calls = f.forge.issue_calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[1], ForgeCall::UpsertIssue { number: Some(1), title, .. } if title == "Bug v2"));
    }

    #[tokio::test]
    async fn test_issue_hook_from_other_user_keeps_local_authorship() {
        let f = fixture();
        f.engine.export_story(f.project_id, f.task_id).await.unwrap();
        let server = {
            let db = f.engine.db.lock_sync().unwrap();
            let server = db.get_server(f.server_id).unwrap().unwrap();
            db.insert_user("bob", "Bob", None, &[ExternalLink::for_server(&server).with(relation::USER, 8)])
                .unwrap();
            server
        };
        let repo = f.engine.load_repo(f.repo_id).await.unwrap();
        let project = f.engine.load_project(f.project_id).await.unwrap();
        let hook = serde_json::json!({
            "object_kind": "issue",
            "user": {"id": 8, "username": "bob"},
            "object_attributes": {
                "id": 10001, "iid": 1, "title": "Bug", "description": null,
                "state": "closed", "url": "https://gl.test/issues/1"
            }
        });
        let story = f
            .engine
            .import_hook_event(&server, &repo, &project, &hook)
            .await
            .unwrap()
            .expect("issue hooks are handled");

        assert_eq!(story.id, f.story_id, "matched the exported story");
        assert_eq!(story.user_ids.len(), 1);
        let ann = f.engine.db.call(|db| db.list_users()).await.unwrap()[0].id;
        assert_eq!(story.user_ids, vec![ann]);
        assert_eq!(story.details.labels, vec!["ui".to_string()]);
        assert_eq!(story.details.text.as_deref(), Some("Details"));
        assert_eq!(story.details.state.as_deref(), Some("closed"));
        assert_eq!(story.write_origin(), WriteOrigin::Import);

        let mut details = story.details.clone();
        details.text = Some("More details".into());
        edit_story(&f, details).await;
        assert_eq!(f.engine.reexport_story(f.project_id, f.story_id).await.unwrap(), Some(f.task_id));
        let calls = f.forge.issue_calls();
        assert!(matches!(calls.last(), Some(ForgeCall::UpsertIssue { number: Some(1), .. })));
    }

    #[tokio::test]
    async fn test_edit_during_pending_export_is_exported() {
        let f = fixture();
        let (project_id, task_id) = (f.project_id, f.task_id);
        f.engine
            .db
            .call(move |db| db.set_task_completion(project_id, task_id, 50))
            .await
            .unwrap();
        edit_story(&f, StoryDetails { title: Some("Bug v2".into()), ..Default::default() }).await;

        assert_eq!(f.engine.reexport_story(f.project_id, f.story_id).await.unwrap(), Some(f.task_id));
        let calls = f.forge.issue_calls();
        assert!(matches!(&calls[..], [ForgeCall::UpsertIssue { title, .. }] if title == "Bug v2"));
        let task = f.engine.db.call(move |db| db.get_task(project_id, task_id)).await.unwrap().unwrap();
        assert_eq!(task.state(), TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_export_waiting_for_its_key_is_tracked() {
        let f = fixture();
        let key = keys::story_export(f.project_id, f.task_id);
        let (release, hold) = tokio::sync::oneshot::channel::<()>();
        let holder = {
            let engine = Arc::clone(&f.engine);
            let key = key.clone();
            tokio::spawn(async move {
                engine.scheduler.schedule(&key, async { hold.await.ok() }).await;
            })
        };
        while !f.engine.scheduler.in_flight(&key) {
            tokio::task::yield_now().await;
        }

        let export = {
            let engine = Arc::clone(&f.engine);
            let (project_id, task_id) = (f.project_id, f.task_id);
            tokio::spawn(async move { engine.run_export(project_id, task_id).await })
        };
        while f.engine.exports.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let engine = Arc::clone(&f.engine);
            tokio::spawn(async move { engine.exports.wait_for_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "queued export holds the wait");
        assert!(f.forge.issue_calls().is_empty());

        release.send(()).unwrap();
        holder.await.unwrap();
        export.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(f.engine.exports.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_reexport_without_completed_task_is_noop() {
        let f = fixture();
        assert_eq!(f.engine.reexport_story(f.project_id, f.story_id).await.unwrap(), None);
        assert!(f.forge.issue_calls().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_runs_due_retries_only() {
        let f = fixture();
        f.forge.fail_next_issue_calls(2);
        f.engine.export_or_queue(f.project_id, f.task_id).await;
        let queued = f.engine.retries.get(f.project_id, f.task_id).unwrap();

        assert_eq!(f.engine.sweep_export_retries(queued.queued_at + Duration::from_secs(10)).await, 0);

        let now = queued.queued_at + Duration::from_secs(31);
        assert_eq!(f.engine.sweep_export_retries(now).await, 1);
        let requeued = f.engine.retries.get(f.project_id, f.task_id).unwrap();
        assert_eq!(requeued.attempts, 2);
        assert_eq!(requeued.delay, Duration::from_secs(60));

        let later = now + Duration::from_secs(61);
        assert_eq!(f.engine.sweep_export_retries(later).await, 1);
        assert!(f.engine.retries.is_empty());
        assert_eq!(f.forge.issue_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_recover_exports_seeds_queue() {
        let f = fixture();
        let queued = f.engine.recover_exports().await.unwrap();
        assert_eq!(queued, 1);
        let entry = f.engine.retries.get(f.project_id, f.task_id).unwrap();
        assert_eq!(entry.delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tracker_waits_for_snapshot() {
        let tracker = Arc::new(ExportTracker::new());
        tracker.wait_for_all().await;

        let guard = tracker.begin();
        assert_eq!(tracker.in_flight(), 1);
        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_for_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(tracker.in_flight(), 0);
    }
}
