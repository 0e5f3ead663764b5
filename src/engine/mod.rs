//! Forge synchronization engine.
//!
//! ## Overview
//!
//! The engine mirrors activity from a GitLab forge into local stories, and
//! pushes locally authored issue stories back to the forge. Three trigger
//! sources feed one per-key scheduler: webhooks, row changes in the local
//! database, and timers.
//!
//! ## Module Map
//!
//! ```text
//! ┌────────┐  HTTP   ┌───────────────────────────────────────────────────┐
//! │ Forge  │ ──────> │  webhook.rs  (axum routes: system / project hook) │
//! └────────┘         │       │                                           │
//!     ^              │       │ import_hook_event() / schedule scan        │
//!     │              │       v                                           │
//!     │              │  event_import.rs   repo_import.rs                 │
//!     │              │       │                 │                         │
//!     │   REST       │       └──── scheduler.rs (TaskScheduler) ────┐    │
//!     └───────────── │  forge_client.rs (ForgeClient, GitLabClient)  │    │
//!                    │       ^                                       │    │
//!                    │  export.rs (exporter, ExportTracker) <── retry.rs  │
//!                    │       ^                                           │
//!                    │  reactor.rs  <── db.rs change feed (RowChange)    │
//!                    │  hooks.rs    (callback URLs, hook install/remove) │
//!                    │  server.rs   (startup catch-up, timers, serving)  │
//!                    └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                           |
//! |-----------|----------------------------------------------------------|
//! | `models`  | Rows (`Server`, `Repo`, `Story`, `Task`, ...) and activity |
//! | `links`   | External link matching, attach and detach                |
//! | `payload` | GitLab hook and event decoding into `ActivityItem`       |
//! | `testing` | `MockForge`, a scripted `ForgeClient` for tests          |
//!
//! ## Loop Prevention
//!
//! Import and export writes stamp `itime`/`etime` with the exact instant they
//! store in `mtime`. The reactor only acts on stories whose `write_origin()` is
//! `User`, so an import never triggers an export and vice versa.

pub mod db;
pub mod event_import;
pub mod export;
pub mod forge_client;
pub mod hooks;
pub mod links;
pub mod models;
pub mod payload;
pub mod reactor;
pub mod repo_import;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod testing;
pub mod webhook;

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::errors::{SyncError, SyncResult};

use db::DbHandle;
use export::ExportTracker;
use forge_client::ForgeClient;
use models::{Project, Repo, Server};
use retry::{ExportRetryQueue, RetryPolicy};
use scheduler::TaskScheduler;

/// Shared state of a running engine. Operations are implemented across the
/// engine modules as `impl SyncEngine` blocks.
pub struct SyncEngine {
    pub db: DbHandle,
    pub forge: Arc<dyn ForgeClient>,
    pub scheduler: Arc<TaskScheduler>,
    pub exports: ExportTracker,
    pub retries: ExportRetryQueue,
    pub config: SyncConfig,
}

impl SyncEngine {
    pub fn new(db: DbHandle, forge: Arc<dyn ForgeClient>, config: SyncConfig) -> Self {
        let policy = RetryPolicy::from(&config.export);
        Self {
            db,
            forge,
            scheduler: Arc::new(TaskScheduler::new()),
            exports: ExportTracker::new(),
            retries: ExportRetryQueue::new(policy),
            config,
        }
    }

    pub(crate) async fn load_server(&self, server_id: i64) -> SyncResult<Server> {
        self.db
            .call(move |db| db.get_server(server_id))
            .await
            .map_err(SyncError::Database)?
            .ok_or(SyncError::ServerNotFound { id: server_id })
    }

    /// The server, provided it is active.
    pub(crate) async fn load_active_server(&self, server_id: i64) -> SyncResult<Server> {
        let server = self.load_server(server_id).await?;
        if !server.is_active() {
            return Err(SyncError::ServerInactive { id: server_id });
        }
        Ok(server)
    }

    pub(crate) async fn load_repo(&self, repo_id: i64) -> SyncResult<Repo> {
        self.db
            .call(move |db| db.get_repo(repo_id))
            .await
            .map_err(SyncError::Database)?
            .ok_or(SyncError::RepoNotFound { id: repo_id })
    }

    pub(crate) async fn load_project(&self, project_id: i64) -> SyncResult<Project> {
        self.db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(SyncError::Database)?
            .ok_or(SyncError::ProjectNotFound { id: project_id })
    }

    /// Active servers the repo is linked to, in link order.
    pub(crate) async fn linked_active_servers(&self, repo: &Repo) -> SyncResult<Vec<Server>> {
        let ids: Vec<i64> = repo.external.iter().map(|link| link.server_id).collect();
        let servers = self
            .db
            .call(move |db| {
                let mut servers = Vec::new();
                for id in ids {
                    if let Some(server) = db.get_server(id)? {
                        servers.push(server);
                    }
                }
                Ok(servers)
            })
            .await
            .map_err(SyncError::Database)?;
        Ok(servers.into_iter().filter(Server::is_active).collect())
    }
}
