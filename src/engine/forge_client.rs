//! Forge API seam.
//!
//! `ForgeClient` is the contract the engine relies on; `GitLabClient` is the
//! GitLab v4 implementation over `reqwest`. Every call receives the `Server`
//! row so one client serves any number of forge instances.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::models::{ActivityItem, IssuePayload, RemoteIssueRef, RemoteRepo, RemoteUser, Server};
use super::payload;
use crate::errors::{SyncError, SyncResult};

const PER_PAGE: usize = 100;
const USER_AGENT: &str = concat!("forge-sync/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Activity of the remote repository at or after `since`, oldest first.
    async fn list_activity_since(
        &self,
        server: &Server,
        remote_repo_id: i64,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<ActivityItem>>;

    async fn get_repositories(&self, server: &Server) -> SyncResult<Vec<RemoteRepo>>;

    async fn get_users(&self, server: &Server) -> SyncResult<Vec<RemoteUser>>;

    /// Create an issue, or update issue `number` when given.
    async fn create_or_update_issue(
        &self,
        server: &Server,
        remote_repo_id: i64,
        number: Option<i64>,
        issue: &IssuePayload,
    ) -> SyncResult<RemoteIssueRef>;

    /// Install a webhook pointing at `url`: a project hook when
    /// `remote_repo_id` is given, a system hook otherwise. Installing a hook
    /// that already exists is a no-op.
    async fn install_hook(
        &self,
        server: &Server,
        remote_repo_id: Option<i64>,
        url: &str,
    ) -> SyncResult<()>;

    /// Remove every webhook pointing at `url`.
    async fn remove_hook(
        &self,
        server: &Server,
        remote_repo_id: Option<i64>,
        url: &str,
    ) -> SyncResult<()>;
}

#[derive(Debug, Deserialize)]
struct GitLabIssue {
    id: i64,
    iid: i64,
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitLabHook {
    id: i64,
    url: String,
}

pub struct GitLabClient {
    http: reqwest::Client,
}

impl GitLabClient {
    pub fn new() -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    fn api_url(server: &Server, path: &str) -> String {
        format!("{}/api/v4{}", server.url.trim_end_matches('/'), path)
    }

    fn token(server: &Server) -> SyncResult<&str> {
        server
            .access_token()
            .ok_or(SyncError::ServerInactive { id: server.id })
    }

    fn hooks_path(remote_repo_id: Option<i64>) -> String {
        match remote_repo_id {
            Some(id) => format!("/projects/{}/hooks", id),
            None => "/hooks".to_string(),
        }
    }

    /// Turn a non-2xx response into `SyncError::Forge` with the body text.
    async fn check(resp: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(SyncError::Forge {
            status: status.as_u16(),
            message,
        })
    }

    /// GET every page of a list endpoint.
    async fn get_paged<T: DeserializeOwned>(
        &self,
        server: &Server,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<Vec<T>> {
        let token = Self::token(server)?;
        let url = Self::api_url(server, path);
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let resp = self
                .http
                .get(&url)
                .header("Authorization", format!("Bearer {}", token))
                .query(query)
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await?;
            let items: Vec<T> = Self::check(resp).await?.json().await?;

            let count = items.len();
            all.extend(items);
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn list_hooks(&self, server: &Server, remote_repo_id: Option<i64>) -> SyncResult<Vec<GitLabHook>> {
        self.get_paged(server, &Self::hooks_path(remote_repo_id), &[]).await
    }
}

fn hook_body(remote_repo_id: Option<i64>, url: &str) -> Value {
    match remote_repo_id {
        Some(_) => json!({
            "url": url,
            "push_events": true,
            "tag_push_events": true,
            "issues_events": true,
            "merge_requests_events": true,
            "wiki_page_events": true,
            "enable_ssl_verification": true,
        }),
        // Project and user lifecycle events are always delivered to system hooks.
        None => json!({
            "url": url,
            "push_events": false,
            "tag_push_events": false,
            "merge_requests_events": false,
            "repository_update_events": false,
            "enable_ssl_verification": true,
        }),
    }
}

#[async_trait]
impl ForgeClient for GitLabClient {
    async fn list_activity_since(
        &self,
        server: &Server,
        remote_repo_id: i64,
        since: DateTime<Utc>,
    ) -> SyncResult<Vec<ActivityItem>> {
        // `after` is an exclusive date; step back a day and filter precisely below.
        let after = (since - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
        let raw: Vec<Value> = self
            .get_paged(
                server,
                &format!("/projects/{}/events", remote_repo_id),
                &[("after", after), ("sort", "asc".to_string())],
            )
            .await?;
        Ok(raw
            .iter()
            .filter_map(payload::decode_event)
            .filter(|item| item.created_at >= since)
            .collect())
    }

    async fn get_repositories(&self, server: &Server) -> SyncResult<Vec<RemoteRepo>> {
        self.get_paged(server, "/projects", &[("order_by", "id".to_string()), ("sort", "asc".to_string())])
            .await
    }

    async fn get_users(&self, server: &Server) -> SyncResult<Vec<RemoteUser>> {
        self.get_paged(server, "/users", &[("order_by", "id".to_string()), ("sort", "asc".to_string())])
            .await
    }

    async fn create_or_update_issue(
        &self,
        server: &Server,
        remote_repo_id: i64,
        number: Option<i64>,
        issue: &IssuePayload,
    ) -> SyncResult<RemoteIssueRef> {
        let token = Self::token(server)?;
        let request = match number {
            Some(iid) => self.http.put(Self::api_url(
                server,
                &format!("/projects/{}/issues/{}", remote_repo_id, iid),
            )),
            None => self
                .http
                .post(Self::api_url(server, &format!("/projects/{}/issues", remote_repo_id))),
        };
        let mut request = request
            .header("Authorization", format!("Bearer {}", token))
            .json(&json!({
                "title": issue.title,
                "description": issue.description,
                "labels": issue.labels.join(","),
                "confidential": issue.confidential,
            }));
        if let Some(sudo) = &issue.sudo {
            request = request.header("Sudo", sudo);
        }

        let created: GitLabIssue = Self::check(request.send().await?).await?.json().await?;
        Ok(RemoteIssueRef {
            id: created.id,
            number: created.iid,
            url: created.web_url,
        })
    }

    async fn install_hook(
        &self,
        server: &Server,
        remote_repo_id: Option<i64>,
        url: &str,
    ) -> SyncResult<()> {
        let existing = self.list_hooks(server, remote_repo_id).await?;
        if existing.iter().any(|hook| hook.url == url) {
            return Ok(());
        }
        let token = Self::token(server)?;
        let resp = self
            .http
            .post(Self::api_url(server, &Self::hooks_path(remote_repo_id)))
            .header("Authorization", format!("Bearer {}", token))
            .json(&hook_body(remote_repo_id, url))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn remove_hook(
        &self,
        server: &Server,
        remote_repo_id: Option<i64>,
        url: &str,
    ) -> SyncResult<()> {
        let token = Self::token(server)?;
        let base = Self::hooks_path(remote_repo_id);
        for hook in self.list_hooks(server, remote_repo_id).await? {
            if hook.url != url {
                continue;
            }
            let resp = self
                .http
                .delete(Self::api_url(server, &format!("{}/{}", base, hook.id)))
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await?;
            match Self::check(resp).await {
                Ok(_) | Err(SyncError::Forge { status: 404, .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
