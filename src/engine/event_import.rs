//! Event import: the single-hook fast path and the catch-up scan.
//!
//! Both paths turn an `ActivityItem` into a story keyed by the remote identity
//! recorded in the story's link, so replays update rather than duplicate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::SyncEngine;
use super::db::ImportedStory;
use super::links::{self, relation};
use super::models::{
    ActivityItem, ActivityKind, ExternalLink, ImportMarker, Project, RemoteUserRef, Repo, Server,
    Story, StoryDetails, StoryType,
};
use super::payload;
use super::scheduler::keys;
use crate::errors::{SyncError, SyncResult};

/// Link identifying the remote object behind `kind`.
pub fn activity_link(server: &Server, remote_repo_id: i64, kind: &ActivityKind) -> ExternalLink {
    let link = ExternalLink::for_server(server).with(relation::PROJECT, remote_repo_id);
    match kind {
        ActivityKind::Push { ref_name, head, .. }
        | ActivityKind::Branch { ref_name, head, .. }
        | ActivityKind::Tag { ref_name, head, .. } => {
            link.with(relation::COMMIT, format!("{}:{}", ref_name, head))
        }
        ActivityKind::Issue { id, number, .. } => link
            .with(relation::ISSUE, *id)
            .with(relation::ISSUE_NUMBER, *number),
        ActivityKind::MergeRequest { id, .. } => link.with(relation::MERGE_REQUEST, *id),
        ActivityKind::Wiki { slug, .. } => link.with(relation::WIKI, slug.as_str()),
    }
}

/// Story type and details for an activity item.
pub fn activity_story(kind: &ActivityKind) -> (StoryType, StoryDetails) {
    match kind {
        ActivityKind::Push { ref_name, head, commit_count } => (
            StoryType::Push,
            StoryDetails {
                branch: Some(ref_name.clone()),
                commit: Some(head.clone()),
                commit_count: Some(*commit_count),
                ..Default::default()
            },
        ),
        ActivityKind::Branch { ref_name, head, action } => (
            StoryType::Branch,
            StoryDetails {
                branch: Some(ref_name.clone()),
                commit: Some(head.clone()),
                action: Some(action.as_str().to_string()),
                ..Default::default()
            },
        ),
        ActivityKind::Tag { ref_name, head, action } => (
            StoryType::Tag,
            StoryDetails {
                branch: Some(ref_name.clone()),
                commit: Some(head.clone()),
                action: Some(action.as_str().to_string()),
                ..Default::default()
            },
        ),
        ActivityKind::Issue { number, title, description, state, url, .. } => (
            StoryType::Issue,
            StoryDetails {
                title: Some(title.clone()),
                text: description.clone(),
                state: state.clone(),
                number: Some(*number),
                url: url.clone(),
                ..Default::default()
            },
        ),
        ActivityKind::MergeRequest { number, title, description, state, url, .. } => (
            StoryType::MergeRequest,
            StoryDetails {
                title: Some(title.clone()),
                text: description.clone(),
                state: state.clone(),
                number: Some(*number),
                url: url.clone(),
                ..Default::default()
            },
        ),
        ActivityKind::Wiki { title, url, .. } => (
            StoryType::Wiki,
            StoryDetails {
                title: Some(title.clone()),
                url: url.clone(),
                ..Default::default()
            },
        ),
    }
}

fn remote_repo_id(repo: &Repo, server_id: i64) -> SyncResult<i64> {
    links::find_link(&repo.external, server_id)
        .and_then(|link| link.remote_number(relation::PROJECT))
        .ok_or(SyncError::MissingLink {
            repo_id: repo.id,
            server_id,
        })
}

impl SyncEngine {
    /// Upsert the story for one activity item.
    async fn save_activity(
        &self,
        server: &Server,
        repo: &Repo,
        project: &Project,
        remote_repo: i64,
        item: ActivityItem,
    ) -> SyncResult<Story> {
        let link = activity_link(server, remote_repo, &item.kind);
        let (story_type, details) = activity_story(&item.kind);
        let author = item.author.clone();
        let server_for_authors = server.clone();
        let mut imported = ImportedStory {
            project_id: project.id,
            story_type,
            user_ids: Vec::new(),
            repo_id: Some(repo.id),
            details,
            link,
            ctime: item.created_at,
        };

        self.db
            .call(move |db| {
                if let Some(author) = author.and_then(|a| author_link(&server_for_authors, a)) {
                    if let Some(user) = db.find_user_by_link(&author)? {
                        imported.user_ids.push(user.id);
                    }
                }
                db.upsert_imported_story(&imported)
            })
            .await
            .map_err(SyncError::Database)
    }

    /// Fast path for one project hook delivery. `Ok(None)` means the payload
    /// is not handled here and the caller should schedule a scan.
    pub async fn import_hook_event(
        &self,
        server: &Server,
        repo: &Repo,
        project: &Project,
        body: &Value,
    ) -> SyncResult<Option<Story>> {
        let Some(item) = payload::decode_project_hook(body) else {
            return Ok(None);
        };
        let remote = remote_repo_id(repo, server.id)?;
        let story = self.save_activity(server, repo, project, remote, item).await?;
        tracing::info!(
            server_id = server.id, repo_id = repo.id, project_id = project.id, story_id = story.id,
            story_type = story.story_type.as_str(), "Imported hook event"
        );
        Ok(Some(story))
    }

    /// Catch-up scan: import activity newer than the pairing's marker and
    /// advance the marker. Returns the number of stories written.
    ///
    /// Without a marker the scan starts at `since_hint`, or
    /// `initial_window_days` ago.
    pub async fn import_events(
        &self,
        server_id: i64,
        repo_id: i64,
        project_id: i64,
        since_hint: Option<DateTime<Utc>>,
    ) -> SyncResult<usize> {
        let server = self.load_active_server(server_id).await?;
        let repo = self.load_repo(repo_id).await?;
        let project = self.load_project(project_id).await?;
        let remote = remote_repo_id(&repo, server.id)?;

        let marker = project.import_markers.get(&repo.id).cloned();
        let since = match (&marker, since_hint) {
            (Some(marker), _) => marker.time,
            (None, Some(hint)) => hint,
            (None, None) => {
                super::db::now() - chrono::Duration::days(self.config.import.initial_window_days)
            }
        };
        let after_event = marker.as_ref().map(|m| m.event_id).unwrap_or(i64::MIN);

        let items = self.forge.list_activity_since(&server, remote, since).await?;
        let mut newest: Option<ImportMarker> = None;
        let mut written = 0;
        for item in items {
            let Some(event_id) = item.event_id else {
                continue;
            };
            if event_id <= after_event {
                continue;
            }
            let created_at = item.created_at;
            self.save_activity(&server, &repo, &project, remote, item).await?;
            written += 1;
            if newest.as_ref().is_none_or(|m| event_id > m.event_id) {
                newest = Some(ImportMarker { event_id, time: created_at });
            }
        }

        if let Some(marker) = newest {
            self.db
                .call(move |db| db.set_import_marker(project_id, repo_id, &marker))
                .await
                .map_err(SyncError::Database)?;
        }
        tracing::info!(server_id, repo_id, project_id, written, "Imported repo events");
        Ok(written)
    }

    /// Run `import_events` under the pairing's scheduler key.
    pub async fn schedule_event_import(
        &self,
        server_id: i64,
        repo_id: i64,
        project_id: i64,
    ) -> SyncResult<usize> {
        let key = keys::repo_events(repo_id, project_id);
        self.scheduler
            .schedule(&key, self.import_events(server_id, repo_id, project_id, None))
            .await
    }

    /// Background variant of `schedule_event_import`; failures are logged.
    pub fn spawn_event_import(self: &Arc<Self>, server_id: i64, repo_id: i64, project_id: i64) {
        let engine = Arc::clone(self);
        let key = keys::repo_events(repo_id, project_id);
        self.scheduler.spawn(key, async move {
            engine
                .import_events(server_id, repo_id, project_id, None)
                .await
                .map(|_| ())
        });
    }

    /// Scan every live pairing of every active server. Used at startup.
    pub async fn import_all_events(&self) -> SyncResult<()> {
        let pairings = self
            .db
            .call(|db| {
                let mut pairings = Vec::new();
                for server in db.list_servers()?.into_iter().filter(Server::is_active) {
                    for repo in db.list_repos_linked_to(server.id)? {
                        if repo.deleted {
                            continue;
                        }
                        for project in db.list_projects_with_repo(repo.id)? {
                            if project.is_live() {
                                pairings.push((server.id, repo.id, project.id));
                            }
                        }
                    }
                }
                Ok(pairings)
            })
            .await
            .map_err(SyncError::Database)?;

        for (server_id, repo_id, project_id) in pairings {
            if let Err(e) = self.schedule_event_import(server_id, repo_id, project_id).await {
                tracing::warn!(server_id, repo_id, project_id, error = %e, "Catch-up scan failed");
            }
        }
        Ok(())
    }
}

fn author_link(server: &Server, author: RemoteUserRef) -> Option<ExternalLink> {
    let id = author.id?;
    Some(ExternalLink::for_server(server).with(relation::USER, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::db::{DbHandle, SyncDb};
    use crate::engine::models::{ApiSettings, RefAction, RepoDetails, ServerSettings, ServerType, WriteOrigin};
    use crate::engine::testing::MockForge;
    use serde_json::json;

    struct Fixture {
        engine: Arc<SyncEngine>,
        forge: Arc<MockForge>,
        server: Server,
        repo: Repo,
        project: Project,
    }

    fn fixture() -> Fixture {
        let db = DbHandle::new(SyncDb::new_in_memory().unwrap());
        let forge = Arc::new(MockForge::new());
        let engine = Arc::new(SyncEngine::new(db, forge.clone(), SyncConfig::default()));
        let (server, repo, project) = {
            let db = engine.db.lock_sync().unwrap();
            let settings = ServerSettings {
                api: ApiSettings { access_token: Some("t".into()) },
                ..Default::default()
            };
            let server = db.insert_server(ServerType::Gitlab, "gl", "https://gl.test", &settings).unwrap();
            let link = ExternalLink::for_server(&server).with(relation::PROJECT, 42);
            let repo = db.insert_repo("api", &RepoDetails::default(), &[link]).unwrap();
            let project = db.insert_project("p", &[repo.id]).unwrap();
            db.insert_user("jsmith", "J", None, &[ExternalLink::for_server(&server).with(relation::USER, 4)])
                .unwrap();
            (server, repo, project)
        };
        Fixture { engine, forge, server, repo, project }
    }

    fn push_item(event_id: i64, head: &str) -> ActivityItem {
        ActivityItem {
            event_id: Some(event_id),
            kind: ActivityKind::Push { ref_name: "main".into(), head: head.into(), commit_count: 1 },
            author: Some(RemoteUserRef { id: Some(4), username: Some("jsmith".into()) }),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_activity_link_identity() {
        let f = fixture();
        let link = activity_link(
            &f.server,
            42,
            &ActivityKind::Branch { ref_name: "dev".into(), head: "abc".into(), action: RefAction::Created },
        );
        assert_eq!(link.remote_id(relation::COMMIT).unwrap().to_string(), "dev:abc");
        assert_eq!(link.remote_number(relation::PROJECT), Some(42));
    }

    #[tokio::test]
    async fn test_hook_push_creates_import_story() {
        let f = fixture();
        let body = json!({
            "object_kind": "push", "before": "aaa", "after": "bbb",
            "ref": "refs/heads/main", "user_id": 4, "total_commits_count": 1
        });
        let story = f
            .engine
            .import_hook_event(&f.server, &f.repo, &f.project, &body)
            .await
            .unwrap()
            .expect("push is handled");
        assert_eq!(story.story_type, StoryType::Push);
        assert_eq!(story.write_origin(), WriteOrigin::Import);
        assert_eq!(story.user_ids.len(), 1, "author resolved through user link");
        assert_eq!(story.details.commit.as_deref(), Some("bbb"));
    }

    #[tokio::test]
    async fn test_hook_unhandled_payload() {
        let f = fixture();
        let result = f
            .engine
            .import_hook_event(&f.server, &f.repo, &f.project, &json!({"object_kind": "note"}))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_scan_advances_marker_and_is_idempotent() {
        let f = fixture();
        f.forge.set_activity(42, vec![push_item(10, "a1"), push_item(11, "a2")]);

        let written = f.engine.import_events(f.server.id, f.repo.id, f.project.id, None).await.unwrap();
        assert_eq!(written, 2);
        let project = f.engine.load_project(f.project.id).await.unwrap();
        assert_eq!(project.import_markers.get(&f.repo.id).map(|m| m.event_id), Some(11));

        let again = f.engine.import_events(f.server.id, f.repo.id, f.project.id, None).await.unwrap();
        assert_eq!(again, 0, "events at or below the marker are skipped");
        let stories = f.engine.db.call({
            let project_id = f.project.id;
            move |db| db.list_stories(project_id)
        }).await.unwrap();
        assert_eq!(stories.len(), 2);
    }

    #[tokio::test]
    async fn test_hook_then_scan_updates_same_story() {
        let f = fixture();
        let body = json!({
            "object_kind": "push", "before": "aaa", "after": "a1", "ref": "refs/heads/main"
        });
        f.engine.import_hook_event(&f.server, &f.repo, &f.project, &body).await.unwrap();
        f.forge.set_activity(42, vec![push_item(10, "a1")]);
        f.engine.import_events(f.server.id, f.repo.id, f.project.id, None).await.unwrap();

        let project_id = f.project.id;
        let stories = f.engine.db.call(move |db| db.list_stories(project_id)).await.unwrap();
        assert_eq!(stories.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_requires_link() {
        let f = fixture();
        let unlinked = {
            let db = f.engine.db.lock_sync().unwrap();
            db.insert_repo("bare", &RepoDetails::default(), &[]).unwrap()
        };
        let err = f
            .engine
            .import_events(f.server.id, unlinked.id, f.project.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingLink { .. }));
    }
}
