//! Scripted in-memory `ForgeClient` for unit and integration tests.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::forge_client::ForgeClient;
use super::models::{ActivityItem, IssuePayload, RemoteIssueRef, RemoteRepo, RemoteUser, Server};
use crate::errors::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ForgeCall {
    ListActivity {
        server_id: i64,
        remote_repo_id: i64,
    },
    GetRepositories {
        server_id: i64,
    },
    GetUsers {
        server_id: i64,
    },
    UpsertIssue {
        server_id: i64,
        remote_repo_id: i64,
        number: Option<i64>,
        title: String,
        sudo: Option<String>,
    },
    InstallHook {
        server_id: i64,
        remote_repo_id: Option<i64>,
        url: String,
    },
    RemoveHook {
        server_id: i64,
        remote_repo_id: Option<i64>,
        url: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<ForgeCall>,
    activity: HashMap<i64, Vec<ActivityItem>>,
    repos: Vec<RemoteRepo>,
    users: Vec<RemoteUser>,
    issue_failures: u32,
    issues: HashMap<(i64, i64), i64>,
    next_issue: i64,
    hooks: BTreeSet<(i64, Option<i64>, String)>,
}

#[derive(Default)]
pub struct MockForge {
    state: std::sync::Mutex<MockState>,
}

impl MockForge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_activity(&self, remote_repo_id: i64, items: Vec<ActivityItem>) {
        self.lock().activity.insert(remote_repo_id, items);
    }

    pub fn set_repositories(&self, repos: Vec<RemoteRepo>) {
        self.lock().repos = repos;
    }

    pub fn set_users(&self, users: Vec<RemoteUser>) {
        self.lock().users = users;
    }

    /// Make the next `n` issue calls fail with a 502.
    pub fn fail_next_issue_calls(&self, n: u32) {
        self.lock().issue_failures = n;
    }

    pub fn calls(&self) -> Vec<ForgeCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn issue_calls(&self) -> Vec<ForgeCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, ForgeCall::UpsertIssue { .. }))
            .collect()
    }

    /// Hooks currently installed, as `(server_id, remote_repo_id, url)`.
    pub fn installed_hooks(&self) -> Vec<(i64, Option<i64>, String)> {
        self.lock().hooks.iter().cloned().collect()
    }
}

#[async_trait]
impl ForgeClient for MockForge {
    async fn list_activity_since(
        &self,
        server: &Server,
        remote_repo_id: i64,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<ActivityItem>> {
        let mut state = self.lock();
        state.calls.push(ForgeCall::ListActivity {
            server_id: server.id,
            remote_repo_id,
        });
        Ok(state
            .activity
            .get(&remote_repo_id)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_repositories(&self, server: &Server) -> SyncResult<Vec<RemoteRepo>> {
        let mut state = self.lock();
        state.calls.push(ForgeCall::GetRepositories { server_id: server.id });
        Ok(state.repos.clone())
    }

    async fn get_users(&self, server: &Server) -> SyncResult<Vec<RemoteUser>> {
        let mut state = self.lock();
        state.calls.push(ForgeCall::GetUsers { server_id: server.id });
        Ok(state.users.clone())
    }

    async fn create_or_update_issue(
        &self,
        server: &Server,
        remote_repo_id: i64,
        number: Option<i64>,
        issue: &IssuePayload,
    ) -> SyncResult<RemoteIssueRef> {
        let mut state = self.lock();
        state.calls.push(ForgeCall::UpsertIssue {
            server_id: server.id,
            remote_repo_id,
            number,
            title: issue.title.clone(),
            sudo: issue.sudo.clone(),
        });
        if state.issue_failures > 0 {
            state.issue_failures -= 1;
            return Err(SyncError::Forge {
                status: 502,
                message: "Bad Gateway".into(),
            });
        }
        let number = match number {
            Some(number) => number,
            None => {
                state.next_issue += 1;
                state.next_issue
            }
        };
        let id = *state
            .issues
            .entry((remote_repo_id, number))
            .or_insert(10_000 + number);
        Ok(RemoteIssueRef {
            id,
            number,
            url: Some(format!("{}/issues/{}", server.url, number)),
        })
    }

    async fn install_hook(
        &self,
        server: &Server,
        remote_repo_id: Option<i64>,
        url: &str,
    ) -> SyncResult<()> {
        let mut state = self.lock();
        state.calls.push(ForgeCall::InstallHook {
            server_id: server.id,
            remote_repo_id,
            url: url.to_string(),
        });
        state.hooks.insert((server.id, remote_repo_id, url.to_string()));
        Ok(())
    }

    async fn remove_hook(
        &self,
        server: &Server,
        remote_repo_id: Option<i64>,
        url: &str,
    ) -> SyncResult<()> {
        let mut state = self.lock();
        state.calls.push(ForgeCall::RemoveHook {
            server_id: server.id,
            remote_repo_id,
            url: url.to_string(),
        });
        state.hooks.remove(&(server.id, remote_repo_id, url.to_string()));
        Ok(())
    }
}
