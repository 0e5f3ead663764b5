//! Change-feed reactor: maps row changes to synchronization actions.
//!
//! `decide` is pure, so each table rule can be tested without a database or
//! forge. `run_reactor` batches changes over the debounce window, plans the
//! de-duplicated actions and applies each on its own task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::Instant;

use super::SyncEngine;
use super::db::{Change, ChangeAction, RowChange};
use super::models::{Project, Server, Story, StoryType, System, Task, TaskAction, WriteOrigin};
use crate::errors::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    ImportRepositories { server_id: i64 },
    ImportUsers { server_id: i64 },
    InstallServerHooks { server_id: i64 },
    RemoveServerHooks { server_id: i64 },
    ConnectRepo { project_id: i64, repo_id: i64 },
    DisconnectRepo { project_id: i64, repo_id: i64 },
    InstallProjectHooks { project_id: i64 },
    RemoveProjectHooks { project_id: i64 },
    ReexportStory { project_id: i64, story_id: i64 },
    ExportTask { project_id: i64, task_id: i64 },
    MoveHooks { old: Option<String>, new: Option<String> },
}

/// Actions implied by one row change. Deletes never imply anything.
pub fn decide(change: &RowChange) -> Vec<SyncAction> {
    match change {
        RowChange::Server(c) => on_server(c),
        RowChange::Project(c) => on_project(c),
        RowChange::Story(c) => on_story(c),
        RowChange::Task(c) => on_task(c),
        RowChange::System(c) => on_system(c),
        RowChange::Repo(_) | RowChange::User(_) => Vec::new(),
    }
}

/// Actions for a batch of changes, first occurrence order, no duplicates.
pub fn plan(changes: &[RowChange]) -> Vec<SyncAction> {
    let mut actions: Vec<SyncAction> = Vec::new();
    for action in changes.iter().flat_map(decide) {
        if !actions.contains(&action) {
            actions.push(action);
        }
    }
    actions
}

fn on_server(change: &Change<Server>) -> Vec<SyncAction> {
    let Some(current) = &change.current else {
        return Vec::new();
    };
    let server_id = current.id;
    let mut actions = Vec::new();
    match (change.action, &change.previous) {
        (ChangeAction::Insert, _) => {
            if current.is_active() {
                actions.push(SyncAction::ImportRepositories { server_id });
                actions.push(SyncAction::ImportUsers { server_id });
                actions.push(SyncAction::InstallServerHooks { server_id });
            }
        }
        (ChangeAction::Update, Some(previous)) => {
            let credentials_changed = previous.access_token() != current.access_token()
                || previous.url != current.url;
            if credentials_changed && current.is_active() {
                actions.push(SyncAction::ImportRepositories { server_id });
                actions.push(SyncAction::ImportUsers { server_id });
            }
            if !previous.is_active() && current.is_active() {
                actions.push(SyncAction::InstallServerHooks { server_id });
            } else if previous.is_active() && !current.is_active() && current.access_token().is_some() {
                actions.push(SyncAction::RemoveServerHooks { server_id });
            }
        }
        _ => {}
    }
    actions
}

fn on_project(change: &Change<Project>) -> Vec<SyncAction> {
    let Some(current) = &change.current else {
        return Vec::new();
    };
    let project_id = current.id;
    match (change.action, &change.previous) {
        (ChangeAction::Insert, _) if current.is_live() => current
            .repo_ids
            .iter()
            .map(|&repo_id| SyncAction::ConnectRepo { project_id, repo_id })
            .collect(),
        (ChangeAction::Update, Some(previous)) => {
            let mut actions = Vec::new();
            if previous.is_live() != current.is_live() {
                actions.push(if current.is_live() {
                    SyncAction::InstallProjectHooks { project_id }
                } else {
                    SyncAction::RemoveProjectHooks { project_id }
                });
            }
            if current.is_live() {
                for &repo_id in current.repo_ids.iter().filter(|id| !previous.repo_ids.contains(id)) {
                    actions.push(SyncAction::ConnectRepo { project_id, repo_id });
                }
            }
            for &repo_id in previous.repo_ids.iter().filter(|id| !current.repo_ids.contains(id)) {
                actions.push(SyncAction::DisconnectRepo { project_id, repo_id });
            }
            actions
        }
        _ => Vec::new(),
    }
}

fn on_story(change: &Change<Story>) -> Vec<SyncAction> {
    let (ChangeAction::Update, Some(previous), Some(current)) =
        (change.action, &change.previous, &change.current)
    else {
        return Vec::new();
    };
    if current.story_type != StoryType::Issue
        || current.deleted
        || previous.details == current.details
        || current.write_origin() != WriteOrigin::User
    {
        return Vec::new();
    }
    vec![SyncAction::ReexportStory {
        project_id: current.project_id,
        story_id: current.id,
    }]
}

fn on_task(change: &Change<Task>) -> Vec<SyncAction> {
    let Some(current) = &change.current else {
        return Vec::new();
    };
    let Some(project_id) = current.project_id else {
        return Vec::new();
    };
    if current.action != TaskAction::ExportIssue {
        return Vec::new();
    }
    let options_changed = match (change.action, &change.previous) {
        (ChangeAction::Insert, _) => true,
        (ChangeAction::Update, Some(previous)) => previous.options != current.options,
        _ => false,
    };
    if !options_changed {
        return Vec::new();
    }
    vec![SyncAction::ExportTask { project_id, task_id: current.id }]
}

fn on_system(change: &Change<System>) -> Vec<SyncAction> {
    if change.action == ChangeAction::Delete {
        return Vec::new();
    }
    let old = change.previous.as_ref().and_then(|s| s.details.address.clone());
    let new = change.current.as_ref().and_then(|s| s.details.address.clone());
    if old == new {
        return Vec::new();
    }
    vec![SyncAction::MoveHooks { old, new }]
}

impl SyncEngine {
    pub async fn apply(&self, action: SyncAction) -> SyncResult<()> {
        tracing::debug!(?action, "Applying sync action");
        match action {
            SyncAction::ImportRepositories { server_id } => {
                self.schedule_repo_import(server_id).await.map(|_| ())
            }
            SyncAction::ImportUsers { server_id } => {
                self.schedule_user_import(server_id).await.map(|_| ())
            }
            SyncAction::InstallServerHooks { server_id } => self.install_server_hooks(server_id).await,
            SyncAction::RemoveServerHooks { server_id } => self.remove_server_hooks(server_id).await,
            SyncAction::ConnectRepo { project_id, repo_id } => self.connect_repo(project_id, repo_id).await,
            SyncAction::DisconnectRepo { project_id, repo_id } => {
                self.set_pairing_hooks(repo_id, project_id, false).await
            }
            SyncAction::InstallProjectHooks { project_id } => self.set_project_hooks(project_id, true).await,
            SyncAction::RemoveProjectHooks { project_id } => self.set_project_hooks(project_id, false).await,
            SyncAction::ReexportStory { project_id, story_id } => {
                self.reexport_story(project_id, story_id).await.map(|_| ())
            }
            SyncAction::ExportTask { project_id, task_id } => {
                self.export_or_queue(project_id, task_id).await;
                Ok(())
            }
            SyncAction::MoveHooks { old, new } => {
                // A cleared address falls back to the configured one.
                let fallback = self.config.address.public_url.clone();
                let old = old.or_else(|| fallback.clone());
                let new = new.or(fallback);
                if old == new {
                    return Ok(());
                }
                self.move_hooks(old.as_deref(), new.as_deref()).await
            }
        }
    }

    /// Start importing a newly associated repo and install its hooks.
    async fn connect_repo(&self, project_id: i64, repo_id: i64) -> SyncResult<()> {
        let repo = self.load_repo(repo_id).await?;
        for server in self.linked_active_servers(&repo).await? {
            if let Err(e) = self.schedule_event_import(server.id, repo_id, project_id).await {
                tracing::warn!(server_id = server.id, repo_id, project_id, error = %e, "Initial event import failed");
            }
        }
        self.set_pairing_hooks(repo_id, project_id, true).await
    }

    async fn set_project_hooks(&self, project_id: i64, install: bool) -> SyncResult<()> {
        let project = self.load_project(project_id).await?;
        for repo_id in project.repo_ids {
            match self.set_pairing_hooks(repo_id, project_id, install).await {
                Ok(()) | Err(SyncError::RepoNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Consume the change feed until `shutdown` flips or the feed closes.
    pub async fn run_reactor(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<RowChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let window = Duration::from_millis(self.config.change_feed.debounce_ms);
        tracing::info!(debounce_ms = self.config.change_feed.debounce_ms, "Reactor started");
        loop {
            let first = tokio::select! {
                _ = shutdown.changed() => break,
                received = changes.recv() => received,
            };
            let mut batch = match first {
                Ok(change) => vec![change],
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Reactor lagged behind the change feed");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let deadline = Instant::now() + window;
            loop {
                match tokio::time::timeout_at(deadline, changes.recv()).await {
                    Ok(Ok(change)) => batch.push(change),
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        tracing::warn!(skipped, "Reactor lagged behind the change feed");
                    }
                    Ok(Err(RecvError::Closed)) | Err(_) => break,
                }
            }

            let actions = plan(&batch);
            tracing::debug!(changes = batch.len(), actions = actions.len(), "Reactor batch");
            for action in actions {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    let label = format!("{:?}", action);
                    if let Err(e) = engine.apply(action).await {
                        tracing::warn!(action = %label, error = %e, "Sync action failed");
                    }
                });
            }
        }
        tracing::info!("Reactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::db::{DbHandle, SyncDb, now};
    use crate::engine::links::relation;
    use crate::engine::models::{
        ApiSettings, ExternalLink, RepoDetails, ServerSettings, ServerType, StoryDetails, SystemDetails,
        TaskDetails, TaskOptions,
    };
    use crate::engine::testing::MockForge;
    use std::collections::BTreeMap;

    fn server(token: Option<&str>, disabled: bool) -> Server {
        Server {
            id: 1,
            server_type: ServerType::Gitlab,
            name: "gl".into(),
            url: "https://gl.test".into(),
            settings: ServerSettings {
                api: ApiSettings { access_token: token.map(str::to_string) },
                ..Default::default()
            },
            deleted: false,
            disabled,
            mtime: now(),
        }
    }

    fn project(repo_ids: &[i64], archived: bool) -> Project {
        Project {
            id: 7,
            name: "p".into(),
            repo_ids: repo_ids.to_vec(),
            import_markers: BTreeMap::new(),
            archived,
            deleted: false,
            mtime: now(),
        }
    }

    fn story(title: &str) -> Story {
        let t = now();
        Story {
            id: 3,
            project_id: 7,
            story_type: StoryType::Issue,
            user_ids: vec![1],
            repo_id: Some(2),
            details: StoryDetails { title: Some(title.into()), ..Default::default() },
            external: Vec::new(),
            deleted: false,
            ctime: t,
            mtime: t,
            itime: None,
            etime: None,
        }
    }

    fn task(options: TaskOptions) -> Task {
        let t = now();
        Task {
            id: 9,
            project_id: Some(7),
            action: TaskAction::ExportIssue,
            user_id: Some(1),
            options,
            completion: 0,
            failed: false,
            details: TaskDetails::default(),
            ctime: t,
            mtime: t,
            etime: None,
        }
    }

    fn update<T>(previous: T, current: T) -> Change<T> {
        Change { action: ChangeAction::Update, id: 0, previous: Some(previous), current: Some(current) }
    }

    fn insert<T>(current: T) -> Change<T> {
        Change { action: ChangeAction::Insert, id: 0, previous: None, current: Some(current) }
    }

    #[test]
    fn test_self_caused_story_writes_are_ignored() {
        let previous = story("a");
        let mut imported = story("b");
        imported.itime = Some(imported.mtime);
        assert!(decide(&RowChange::Story(update(previous.clone(), imported))).is_empty());

        let mut exported = story("b");
        exported.etime = Some(exported.mtime);
        assert!(decide(&RowChange::Story(update(previous, exported))).is_empty());
    }

    #[test]
    fn test_user_edit_triggers_reexport() {
        let mut edited = story("b");
        edited.itime = Some(edited.mtime - chrono::Duration::seconds(5));
        let actions = decide(&RowChange::Story(update(story("a"), edited)));
        assert_eq!(actions, vec![SyncAction::ReexportStory { project_id: 7, story_id: 3 }]);
    }

    #[test]
    fn test_story_filters() {
        let mut push = story("b");
        push.story_type = StoryType::Push;
        assert!(decide(&RowChange::Story(update(story("a"), push))).is_empty());

        let mut deleted = story("b");
        deleted.deleted = true;
        assert!(decide(&RowChange::Story(update(story("a"), deleted))).is_empty());

        assert!(decide(&RowChange::Story(update(story("a"), story("a")))).is_empty(), "details unchanged");
        assert!(decide(&RowChange::Story(insert(story("a")))).is_empty());
    }

    #[test]
    fn test_project_repo_diff() {
        let actions = decide(&RowChange::Project(update(project(&[1, 2], false), project(&[2, 3], false))));
        assert_eq!(
            actions,
            vec![
                SyncAction::ConnectRepo { project_id: 7, repo_id: 3 },
                SyncAction::DisconnectRepo { project_id: 7, repo_id: 1 },
            ]
        );
    }

    #[test]
    fn test_project_archive_toggle() {
        let archived = decide(&RowChange::Project(update(project(&[1], false), project(&[1], true))));
        assert_eq!(archived, vec![SyncAction::RemoveProjectHooks { project_id: 7 }]);

        let restored = decide(&RowChange::Project(update(project(&[1], true), project(&[1], false))));
        assert_eq!(restored, vec![SyncAction::InstallProjectHooks { project_id: 7 }]);

        let inserted = decide(&RowChange::Project(insert(project(&[4], false))));
        assert_eq!(inserted, vec![SyncAction::ConnectRepo { project_id: 7, repo_id: 4 }]);
    }

    #[test]
    fn test_server_rules() {
        let added = decide(&RowChange::Server(update(server(None, false), server(Some("t"), false))));
        assert_eq!(
            added,
            vec![
                SyncAction::ImportRepositories { server_id: 1 },
                SyncAction::ImportUsers { server_id: 1 },
                SyncAction::InstallServerHooks { server_id: 1 },
            ]
        );

        let disabled = decide(&RowChange::Server(update(server(Some("t"), false), server(Some("t"), true))));
        assert_eq!(disabled, vec![SyncAction::RemoveServerHooks { server_id: 1 }]);

        let token_cleared = decide(&RowChange::Server(update(server(Some("t"), false), server(None, false))));
        assert!(token_cleared.is_empty(), "no credentials to remove hooks with");

        let rotated = decide(&RowChange::Server(update(server(Some("t"), false), server(Some("u"), false))));
        assert_eq!(
            rotated,
            vec![SyncAction::ImportRepositories { server_id: 1 }, SyncAction::ImportUsers { server_id: 1 }]
        );
    }

    #[test]
    fn test_task_rules() {
        let options = TaskOptions { story_id: Some(3), repo_id: None };
        assert_eq!(
            decide(&RowChange::Task(insert(task(options.clone())))),
            vec![SyncAction::ExportTask { project_id: 7, task_id: 9 }]
        );

        let mut progressed = task(options.clone());
        progressed.completion = 50;
        assert!(decide(&RowChange::Task(update(task(options.clone()), progressed))).is_empty());

        let retargeted = task(TaskOptions { story_id: Some(3), repo_id: Some(2) });
        assert_eq!(decide(&RowChange::Task(update(task(options.clone()), retargeted))).len(), 1);

        let mut global = task(options);
        global.project_id = None;
        assert!(decide(&RowChange::Task(insert(global))).is_empty());
    }

    #[test]
    fn test_deletes_ignored() {
        let change = Change { action: ChangeAction::Delete, id: 3, previous: Some(story("a")), current: None };
        assert!(decide(&RowChange::Story(change)).is_empty());
    }

    #[test]
    fn test_system_address_change() {
        let system = |address: Option<&str>| System {
            id: 1,
            details: SystemDetails { address: address.map(str::to_string), title: None },
            mtime: now(),
        };
        assert_eq!(
            decide(&RowChange::System(update(system(Some("https://a")), system(Some("https://b"))))),
            vec![SyncAction::MoveHooks { old: Some("https://a".into()), new: Some("https://b".into()) }]
        );
        assert!(decide(&RowChange::System(update(system(Some("https://a")), system(Some("https://a"))))).is_empty());
    }

    #[test]
    fn test_plan_dedups() {
        let changes = vec![
            RowChange::Task(insert(task(TaskOptions::default()))),
            RowChange::Task(insert(task(TaskOptions::default()))),
        ];
        assert_eq!(plan(&changes).len(), 1);
    }

    #[tokio::test]
    async fn test_reactor_exports_inserted_task() {
        let db = DbHandle::new(SyncDb::new_in_memory().unwrap());
        let forge = Arc::new(MockForge::new());
        let engine = Arc::new(SyncEngine::new(db, forge.clone(), SyncConfig::default()));
        let (project_id, story_id, repo_id) = {
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
            let project = db.insert_project("p", &[]).unwrap();
            let story = db
                .insert_story(project.id, StoryType::Issue, &[], &StoryDetails::default())
                .unwrap();
            (project.id, story.id, repo.id)
        };

        let (stop, shutdown) = watch::channel(false);
        let reactor = tokio::spawn(Arc::clone(&engine).run_reactor(engine.db.subscribe(), shutdown));

        engine
            .db
            .call(move |db| {
                db.insert_task(
                    Some(project_id),
                    TaskAction::ExportIssue,
                    None,
                    &TaskOptions { story_id: Some(story_id), repo_id: Some(repo_id) },
                )
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while forge.issue_calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("export should run");

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), reactor).await.unwrap().unwrap();
    }
}
