//! Webhook management: callback URL resolution and hook install/remove.
//!
//! The callback base address has one source of truth: the system row's
//! `details.address`, falling back to `[address] public_url` from the config.

use super::SyncEngine;
use super::links::{self, relation};
use super::models::{Project, Repo, Server};
use crate::errors::{SyncError, SyncResult};

pub fn system_hook_url(address: &str, server_id: i64) -> String {
    format!("{}/hook/system/{}", address.trim_end_matches('/'), server_id)
}

pub fn project_hook_url(address: &str, server_id: i64, repo_id: i64, project_id: i64) -> String {
    format!(
        "{}/hook/project/{}/{}/{}",
        address.trim_end_matches('/'),
        server_id,
        repo_id,
        project_id
    )
}

fn remote_repo_id(repo: &Repo, server_id: i64) -> Option<i64> {
    links::find_link(&repo.external, server_id).and_then(|link| link.remote_number(relation::PROJECT))
}

impl SyncEngine {
    /// Externally visible base URL, if one is configured anywhere.
    pub async fn callback_address(&self) -> SyncResult<Option<String>> {
        let system = self
            .db
            .call(|db| db.get_system())
            .await
            .map_err(SyncError::Database)?;
        let address = system
            .and_then(|s| s.details.address)
            .filter(|a| !a.trim().is_empty())
            .or_else(|| self.config.address.public_url.clone());
        Ok(address.map(|a| a.trim_end_matches('/').to_string()))
    }

    /// Live (repo, project) pairings of repos linked to `server_id`.
    async fn server_pairings(&self, server_id: i64) -> SyncResult<Vec<(Repo, Project)>> {
        self.db
            .call(move |db| {
                let mut pairings = Vec::new();
                for repo in db.list_repos_linked_to(server_id)? {
                    if repo.deleted {
                        continue;
                    }
                    for project in db.list_projects_with_repo(repo.id)? {
                        if project.is_live() {
                            pairings.push((repo.clone(), project));
                        }
                    }
                }
                Ok(pairings)
            })
            .await
            .map_err(SyncError::Database)
    }

    pub async fn install_project_hook(
        &self,
        server: &Server,
        repo: &Repo,
        project: &Project,
        address: &str,
    ) -> SyncResult<()> {
        let remote = remote_repo_id(repo, server.id).ok_or(SyncError::MissingLink {
            repo_id: repo.id,
            server_id: server.id,
        })?;
        let url = project_hook_url(address, server.id, repo.id, project.id);
        self.forge.install_hook(server, Some(remote), &url).await?;
        tracing::info!(server_id = server.id, repo_id = repo.id, project_id = project.id, "Installed project hook");
        Ok(())
    }

    pub async fn remove_project_hook(
        &self,
        server: &Server,
        repo: &Repo,
        project: &Project,
        address: &str,
    ) -> SyncResult<()> {
        let Some(remote) = remote_repo_id(repo, server.id) else {
            return Ok(());
        };
        let url = project_hook_url(address, server.id, repo.id, project.id);
        self.forge.remove_hook(server, Some(remote), &url).await?;
        tracing::info!(server_id = server.id, repo_id = repo.id, project_id = project.id, "Removed project hook");
        Ok(())
    }

    /// Install the system hook and one project hook per live pairing.
    /// Individual failures are logged and do not stop the rest.
    pub async fn install_server_hooks_at(&self, server: &Server, address: &str) -> SyncResult<()> {
        if let Err(e) = self
            .forge
            .install_hook(server, None, &system_hook_url(address, server.id))
            .await
        {
            tracing::warn!(server_id = server.id, error = %e, "Failed to install system hook");
        }
        for (repo, project) in self.server_pairings(server.id).await? {
            if let Err(e) = self.install_project_hook(server, &repo, &project, address).await {
                tracing::warn!(
                    server_id = server.id, repo_id = repo.id, project_id = project.id, error = %e,
                    "Failed to install project hook"
                );
            }
        }
        Ok(())
    }

    pub async fn remove_server_hooks_at(&self, server: &Server, address: &str) -> SyncResult<()> {
        if let Err(e) = self
            .forge
            .remove_hook(server, None, &system_hook_url(address, server.id))
            .await
        {
            tracing::warn!(server_id = server.id, error = %e, "Failed to remove system hook");
        }
        for (repo, project) in self.server_pairings(server.id).await? {
            if let Err(e) = self.remove_project_hook(server, &repo, &project, address).await {
                tracing::warn!(
                    server_id = server.id, repo_id = repo.id, project_id = project.id, error = %e,
                    "Failed to remove project hook"
                );
            }
        }
        Ok(())
    }

    pub async fn install_server_hooks(&self, server_id: i64) -> SyncResult<()> {
        let server = self.load_active_server(server_id).await?;
        let Some(address) = self.callback_address().await? else {
            tracing::warn!(server_id, "No callback address configured; skipping hook installation");
            return Ok(());
        };
        self.install_server_hooks_at(&server, &address).await
    }

    /// Remove a server's hooks. Runs for disabled or deleted servers too, as
    /// long as they still carry credentials.
    pub async fn remove_server_hooks(&self, server_id: i64) -> SyncResult<()> {
        let server = self.load_server(server_id).await?;
        if server.access_token().is_none() {
            tracing::debug!(server_id, "Server has no credentials; nothing to remove");
            return Ok(());
        }
        let Some(address) = self.callback_address().await? else {
            return Ok(());
        };
        self.remove_server_hooks_at(&server, &address).await
    }

    /// Install hooks on every active server.
    pub async fn install_all_hooks(&self) -> SyncResult<()> {
        let servers = self
            .db
            .call(|db| db.list_servers())
            .await
            .map_err(SyncError::Database)?;
        for server in servers.into_iter().filter(Server::is_active) {
            if let Err(e) = self.install_server_hooks(server.id).await {
                tracing::warn!(server_id = server.id, error = %e, "Failed to install hooks");
            }
        }
        Ok(())
    }

    /// Re-home every active server's hooks from `old` to `new`.
    pub async fn move_hooks(&self, old: Option<&str>, new: Option<&str>) -> SyncResult<()> {
        let servers = self
            .db
            .call(|db| db.list_servers())
            .await
            .map_err(SyncError::Database)?;
        for server in servers.into_iter().filter(Server::is_active) {
            if let Some(old) = old {
                self.remove_server_hooks_at(&server, old).await?;
            }
            if let Some(new) = new {
                self.install_server_hooks_at(&server, new).await?;
            }
        }
        Ok(())
    }

    /// Install or remove hooks for one (repo, project) pairing on every
    /// active server the repo lives on.
    pub async fn set_pairing_hooks(&self, repo_id: i64, project_id: i64, install: bool) -> SyncResult<()> {
        let Some(address) = self.callback_address().await? else {
            tracing::warn!(repo_id, project_id, "No callback address configured; skipping hooks");
            return Ok(());
        };
        let repo = self.load_repo(repo_id).await?;
        let project = self.load_project(project_id).await?;
        for server in self.linked_active_servers(&repo).await? {
            let result = if install {
                self.install_project_hook(&server, &repo, &project, &address).await
            } else {
                self.remove_project_hook(&server, &repo, &project, &address).await
            };
            if let Err(e) = result {
                tracing::warn!(server_id = server.id, repo_id, project_id, install, error = %e, "Project hook change failed");
            }
        }
        Ok(())
    }
}
