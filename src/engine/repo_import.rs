//! Bulk reconciliation of forge repositories and accounts.
//!
//! Rows are matched through their server link. Objects that disappeared from
//! the forge lose that link; a row left with no links is marked deleted, never
//! removed.

use std::collections::HashSet;
use std::sync::Arc;

use super::SyncEngine;
use super::db::SyncDb;
use super::links::{self, relation};
use super::models::{ExternalLink, RemoteRepo, RemoteUser, RepoDetails, Server};
use super::scheduler::keys;
use crate::errors::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub detached: usize,
}

fn repo_details(remote: &RemoteRepo) -> RepoDetails {
    RepoDetails {
        full_name: Some(remote.path_with_namespace.clone()),
        web_url: remote.web_url.clone(),
        description: remote.description.clone(),
        archived: remote.archived,
    }
}

fn reconcile_repos(db: &SyncDb, server: &Server, remote: &[RemoteRepo]) -> anyhow::Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut seen = HashSet::new();

    for item in remote {
        seen.insert(item.id);
        let link = ExternalLink::for_server(server).with(relation::PROJECT, item.id);
        let details = repo_details(item);
        match db.find_repo_by_link(&link)? {
            Some(mut repo) => {
                if repo.name != item.name || repo.details != details || repo.deleted {
                    repo.name = item.name.clone();
                    repo.details = details;
                    repo.deleted = false;
                    db.update_repo(&repo)?;
                    summary.updated += 1;
                }
            }
            None => {
                db.insert_repo(&item.name, &details, &[link])?;
                summary.created += 1;
            }
        }
    }

    for mut repo in db.list_repos_linked_to(server.id)? {
        let remote_id = links::find_link(&repo.external, server.id)
            .and_then(|link| link.remote_number(relation::PROJECT));
        if remote_id.is_some_and(|id| seen.contains(&id)) {
            continue;
        }
        links::detach(&mut repo.external, server.id);
        if repo.external.is_empty() {
            repo.deleted = true;
        }
        db.update_repo(&repo)?;
        summary.detached += 1;
    }

    Ok(summary)
}

fn reconcile_users(db: &SyncDb, server: &Server, remote: &[RemoteUser]) -> anyhow::Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut seen = HashSet::new();

    for item in remote {
        seen.insert(item.id);
        let link = ExternalLink::for_server(server).with(relation::USER, item.id);
        match db.find_user_by_link(&link)? {
            Some(mut user) => {
                if user.username != item.username || user.name != item.name || user.email != item.email {
                    user.username = item.username.clone();
                    user.name = item.name.clone();
                    user.email = item.email.clone();
                    db.update_user(&user)?;
                    summary.updated += 1;
                }
            }
            None => {
                db.insert_user(&item.username, &item.name, item.email.as_deref(), &[link])?;
                summary.created += 1;
            }
        }
    }

    for mut user in db.list_users()? {
        if user.deleted {
            continue;
        }
        let Some(link) = links::find_link(&user.external, server.id) else {
            continue;
        };
        if link
            .remote_number(relation::USER)
            .is_some_and(|id| seen.contains(&id))
        {
            continue;
        }
        links::detach(&mut user.external, server.id);
        if user.external.is_empty() {
            user.deleted = true;
        }
        db.update_user(&user)?;
        summary.detached += 1;
    }

    Ok(summary)
}

impl SyncEngine {
    pub async fn import_repositories(&self, server_id: i64) -> SyncResult<ImportSummary> {
        let server = self.load_active_server(server_id).await?;
        let remote = self.forge.get_repositories(&server).await?;
        let fetched = remote.len();
        let summary = self
            .db
            .call(move |db| reconcile_repos(db, &server, &remote))
            .await
            .map_err(SyncError::Database)?;
        tracing::info!(
            server_id, fetched, created = summary.created, updated = summary.updated,
            detached = summary.detached, "Imported repositories"
        );
        Ok(summary)
    }

    pub async fn import_users(&self, server_id: i64) -> SyncResult<ImportSummary> {
        let server = self.load_active_server(server_id).await?;
        let remote = self.forge.get_users(&server).await?;
        let fetched = remote.len();
        let summary = self
            .db
            .call(move |db| reconcile_users(db, &server, &remote))
            .await
            .map_err(SyncError::Database)?;
        tracing::info!(
            server_id, fetched, created = summary.created, updated = summary.updated,
            detached = summary.detached, "Imported users"
        );
        Ok(summary)
    }

    pub async fn schedule_repo_import(&self, server_id: i64) -> SyncResult<ImportSummary> {
        self.scheduler
            .schedule(&keys::server_repos(server_id), self.import_repositories(server_id))
            .await
    }

    pub async fn schedule_user_import(&self, server_id: i64) -> SyncResult<ImportSummary> {
        self.scheduler
            .schedule(&keys::server_users(server_id), self.import_users(server_id))
            .await
    }

    pub fn spawn_repo_import(self: &Arc<Self>, server_id: i64) {
        let engine = Arc::clone(self);
        self.scheduler.spawn(keys::server_repos(server_id), async move {
            engine.import_repositories(server_id).await.map(|_| ())
        });
    }

    pub fn spawn_user_import(self: &Arc<Self>, server_id: i64) {
        let engine = Arc::clone(self);
        self.scheduler.spawn(keys::server_users(server_id), async move {
            engine.import_users(server_id).await.map(|_| ())
        });
    }

    /// Repository import for every active server. Used at startup.
    pub async fn import_all_repositories(&self) -> SyncResult<()> {
        for server_id in self.active_server_ids().await? {
            if let Err(e) = self.schedule_repo_import(server_id).await {
                tracing::warn!(server_id, error = %e, "Repository import failed");
            }
        }
        Ok(())
    }

    /// User import for every active server. Driven by the rescan timer.
    pub async fn import_all_users(&self) -> SyncResult<()> {
        for server_id in self.active_server_ids().await? {
            if let Err(e) = self.schedule_user_import(server_id).await {
                tracing::warn!(server_id, error = %e, "User import failed");
            }
        }
        Ok(())
    }

    async fn active_server_ids(&self) -> SyncResult<Vec<i64>> {
        let servers = self
            .db
            .call(|db| db.list_servers())
            .await
            .map_err(SyncError::Database)?;
        Ok(servers
            .into_iter()
            .filter(Server::is_active)
            .map(|s| s.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::engine::db::DbHandle;
    use crate::engine::models::{ApiSettings, ServerSettings, ServerType};
    use crate::engine::testing::MockForge;

    fn remote_repo(id: i64, name: &str) -> RemoteRepo {
        RemoteRepo {
            id,
            name: name.into(),
            path_with_namespace: format!("group/{}", name),
            web_url: None,
            description: None,
            archived: false,
        }
    }

    fn setup() -> (Arc<SyncEngine>, Arc<MockForge>, Server) {
        let db = DbHandle::new(SyncDb::new_in_memory().unwrap());
        let forge = Arc::new(MockForge::new());
        let engine = Arc::new(SyncEngine::new(db, forge.clone(), SyncConfig::default()));
        let settings = ServerSettings {
            api: ApiSettings { access_token: Some("t".into()) },
            ..Default::default()
        };
        let server = engine
            .db
            .lock_sync()
            .unwrap()
            .insert_server(ServerType::Gitlab, "gl", "https://gl.test", &settings)
            .unwrap();
        (engine, forge, server)
    }

    #[tokio::test]
    async fn test_import_creates_then_updates() {
        let (engine, forge, server) = setup();
        forge.set_repositories(vec![remote_repo(1, "api"), remote_repo(2, "web")]);
        let first = engine.import_repositories(server.id).await.unwrap();
        assert_eq!(first, ImportSummary { created: 2, updated: 0, detached: 0 });

        let second = engine.import_repositories(server.id).await.unwrap();
        assert_eq!(second, ImportSummary::default(), "unchanged repos are not rewritten");

        forge.set_repositories(vec![remote_repo(1, "api-renamed"), remote_repo(2, "web")]);
        let third = engine.import_repositories(server.id).await.unwrap();
        assert_eq!(third.updated, 1);
    }

    #[tokio::test]
    async fn test_disappeared_repo_is_detached_and_marked_deleted() {
        let (engine, forge, server) = setup();
        forge.set_repositories(vec![remote_repo(1, "api"), remote_repo(2, "web")]);
        engine.import_repositories(server.id).await.unwrap();

        forge.set_repositories(vec![remote_repo(1, "api")]);
        let summary = engine.import_repositories(server.id).await.unwrap();
        assert_eq!(summary.detached, 1);

        let repos = engine.db.call(|db| db.list_repos()).await.unwrap();
        assert_eq!(repos.len(), 2, "never hard-deleted");
        let web = repos.iter().find(|r| r.name == "web").unwrap();
        assert!(web.deleted);
        assert!(web.external.is_empty());
    }

    #[tokio::test]
    async fn test_multi_homed_repo_survives_detach() {
        let (engine, forge, server) = setup();
        let other = ExternalLink::new(ServerType::Gitlab, 99).with(relation::PROJECT, 5);
        let link = ExternalLink::for_server(&server).with(relation::PROJECT, 1);
        engine
            .db
            .lock_sync()
            .unwrap()
            .insert_repo("shared", &RepoDetails::default(), &[link, other])
            .unwrap();

        forge.set_repositories(vec![]);
        engine.import_repositories(server.id).await.unwrap();
        let repo = engine.db.call(|db| db.list_repos()).await.unwrap().remove(0);
        assert!(!repo.deleted);
        assert_eq!(repo.external.len(), 1);
        assert_eq!(repo.external[0].server_id, 99);
    }

    #[tokio::test]
    async fn test_import_users() {
        let (engine, forge, server) = setup();
        forge.set_users(vec![
            RemoteUser { id: 4, username: "jsmith".into(), name: "J".into(), email: None },
            RemoteUser { id: 5, username: "ann".into(), name: "A".into(), email: None },
        ]);
        let first = engine.schedule_user_import(server.id).await.unwrap();
        assert_eq!(first.created, 2);

        forge.set_users(vec![RemoteUser { id: 4, username: "jsmith".into(), name: "J".into(), email: None }]);
        let second = engine.import_users(server.id).await.unwrap();
        assert_eq!(second.detached, 1);
        let users = engine.db.call(|db| db.list_users()).await.unwrap();
        assert!(users.iter().any(|u| u.username == "ann" && u.deleted));
    }

    #[tokio::test]
    async fn test_inactive_server_is_rejected() {
        let (engine, _forge, server) = setup();
        let mut disabled = server.clone();
        disabled.disabled = true;
        engine.db.call(move |db| db.update_server(&disabled)).await.unwrap();
        let err = engine.import_repositories(server.id).await.unwrap_err();
        assert!(matches!(err, SyncError::ServerInactive { .. }));
    }
}
