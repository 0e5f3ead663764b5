//! Webhook receiver.
//!
//! | Route                                                 | Purpose                        |
//! |-------------------------------------------------------|--------------------------------|
//! | `POST /hook/system/{server_id}`                       | server-wide repo/user changes  |
//! | `POST /hook/project/{server_id}/{repo_id}/{project_id}` | activity on one repo pairing |
//! | `GET /health`                                         | liveness                       |
//!
//! Forges disable hooks after repeated delivery failures, so both hook
//! routes answer `200 OK` whatever happens while processing. Failures are
//! logged.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde_json::Value;

use super::SyncEngine;
use super::links;
use super::models::{Project, Repo, Server};
use super::payload::{self, SystemHookAction};
use super::scheduler::keys;
use crate::errors::{SyncError, SyncResult};

pub fn webhook_router() -> Router<Arc<SyncEngine>> {
    Router::new()
        .route("/health", get(health))
        .route("/hook/system/{server_id}", post(system_hook))
        .route("/hook/project/{server_id}/{repo_id}/{project_id}", post(project_hook))
}

async fn health() -> &'static str {
    "ok"
}

fn parse_body(body: &[u8]) -> Option<Value> {
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring hook with malformed JSON body");
            None
        }
    }
}

async fn system_hook(
    State(engine): State<Arc<SyncEngine>>,
    Path(server_id): Path<i64>,
    body: Bytes,
) -> StatusCode {
    let Some(payload) = parse_body(&body) else {
        return StatusCode::OK;
    };
    match payload::classify_system_hook(&payload) {
        SystemHookAction::ImportRepositories => {
            tracing::info!(server_id, "System hook: scheduling repository import");
            engine.spawn_repo_import(server_id);
        }
        SystemHookAction::ImportUsers => {
            tracing::info!(server_id, "System hook: scheduling user import");
            engine.spawn_user_import(server_id);
        }
        SystemHookAction::Ignore => {
            tracing::debug!(server_id, "System hook ignored");
        }
    }
    StatusCode::OK
}

async fn project_hook(
    State(engine): State<Arc<SyncEngine>>,
    Path((server_id, repo_id, project_id)): Path<(i64, i64, i64)>,
    body: Bytes,
) -> StatusCode {
    let Some(payload) = parse_body(&body) else {
        return StatusCode::OK;
    };
    let (server, repo, project) = match resolve_pairing(&engine, server_id, repo_id, project_id).await {
        Ok(pairing) => pairing,
        Err(e) => {
            tracing::warn!(server_id, repo_id, project_id, error = %e, "Project hook for unknown pairing");
            return StatusCode::OK;
        }
    };

    // Our own issue writes come back as hooks; let them land first.
    engine.exports.wait_for_all().await;

    let key = keys::repo_events(repo_id, project_id);
    let imported = engine
        .scheduler
        .schedule(&key, engine.import_hook_event(&server, &repo, &project, &payload))
        .await;
    match imported {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::debug!(server_id, repo_id, project_id, "Hook payload not handled directly; scanning");
            engine.spawn_event_import(server_id, repo_id, project_id);
        }
        Err(e) => {
            tracing::warn!(server_id, repo_id, project_id, error = %e, "Hook import failed; scanning");
            engine.spawn_event_import(server_id, repo_id, project_id);
        }
    }
    StatusCode::OK
}

/// Load the pairing named by a project hook URL and check it still holds.
async fn resolve_pairing(
    engine: &SyncEngine,
    server_id: i64,
    repo_id: i64,
    project_id: i64,
) -> SyncResult<(Server, Repo, Project)> {
    let server = engine.load_active_server(server_id).await?;
    let repo = engine.load_repo(repo_id).await?;
    if links::find_link(&repo.external, server_id).is_none() {
        return Err(SyncError::MissingLink { repo_id, server_id });
    }
    let project = engine.load_project(project_id).await?;
    if !project.repo_ids.contains(&repo_id) || !project.is_live() {
        return Err(SyncError::ProjectNotFound { id: project_id });
    }
    Ok((server, repo, project))
}
