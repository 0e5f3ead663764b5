use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

use super::SyncEngine;
use super::db::{DbHandle, SyncDb};
use super::forge_client::GitLabClient;
use super::webhook::webhook_router;
use crate::config::SyncConfig;

/// Build the HTTP router: webhook routes plus request tracing.
pub fn build_router(engine: Arc<SyncEngine>) -> Router {
    webhook_router()
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Startup catch-up. The process may have been down for a while, so pending
/// exports are recovered, then repositories and activity are imported, then
/// hooks are (re)installed. Each step logs its own failures and the next
/// step still runs.
pub async fn catch_up(engine: &SyncEngine) {
    tracing::info!("Starting catch-up");
    if let Err(e) = engine.recover_exports().await {
        tracing::warn!(error = %e, "Export recovery failed");
    }
    if let Err(e) = engine.import_all_repositories().await {
        tracing::warn!(error = %e, "Repository catch-up failed");
    }
    if let Err(e) = engine.import_all_events().await {
        tracing::warn!(error = %e, "Event catch-up failed");
    }
    if let Err(e) = engine.install_all_hooks().await {
        tracing::warn!(error = %e, "Hook installation failed");
    }
    tracing::info!("Catch-up complete");
}

/// Spawn the export retry sweep, the periodic user rescan and, unless
/// disabled, the poll for rows written by other connections. All stop when
/// `shutdown` flips.
pub fn spawn_timers(engine: Arc<SyncEngine>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let sweep_every = Duration::from_secs(engine.config.export.sweep_interval_secs.max(1));
    let rescan_every = Duration::from_secs(engine.config.import.user_rescan_interval_secs.max(1));
    let poll_ms = engine.config.change_feed.poll_interval_ms;
    let mut handles = Vec::new();

    if poll_ms > 0 {
        let engine = Arc::clone(&engine);
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(poll_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match engine.db.call(|db| db.poll_external_writes()).await {
                            Ok(0) => {}
                            Ok(changes) => tracing::debug!(changes, "Picked up external writes"),
                            Err(e) => tracing::warn!(error = %e, "External write poll failed"),
                        }
                    }
                }
            }
        }));
    }

    let sweep = {
        let engine = Arc::clone(&engine);
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let retried = engine.sweep_export_retries(tokio::time::Instant::now()).await;
                        if retried > 0 {
                            tracing::debug!(retried, "Export retry sweep");
                        }
                    }
                }
            }
        })
    };

    let rescan = {
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            // The catch-up has just run; the first rescan waits a full period.
            let start = tokio::time::Instant::now() + rescan_every;
            let mut ticker = tokio::time::interval_at(start, rescan_every);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.import_all_users().await {
                            tracing::warn!(error = %e, "User rescan failed");
                        }
                    }
                }
            }
        })
    };

    handles.push(sweep);
    handles.push(rescan);
    handles
}

/// Run the engine until Ctrl-C.
pub async fn start_server(config: SyncConfig, skip_catch_up: bool) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = SyncDb::new(&config.database.path).context("Failed to initialize sync database")?;
    let forge = GitLabClient::new().context("Failed to build forge client")?;
    let addr = config.bind_addr();
    let engine = Arc::new(SyncEngine::new(DbHandle::new(db), Arc::new(forge), config));

    if engine.config.change_feed.poll_interval_ms > 0 {
        engine
            .db
            .call(|db| db.track_external_writes())
            .await
            .context("Failed to start tracking external writes")?;
    } else {
        tracing::info!("External write polling is off; only in-process writes trigger sync");
    }

    if skip_catch_up {
        tracing::info!("Skipping startup catch-up");
    } else {
        catch_up(&engine).await;
    }

    let (stop, shutdown) = watch::channel(false);
    let reactor = tokio::spawn(Arc::clone(&engine).run_reactor(engine.db.subscribe(), shutdown.clone()));
    let timers = spawn_timers(Arc::clone(&engine), shutdown);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "forge-sync listening");

    axum::serve(listener, build_router(Arc::clone(&engine)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = stop.send(true);
    for handle in timers.into_iter().chain(std::iter::once(reactor)) {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    tracing::info!(pending_exports = engine.exports.in_flight(), "Shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::{ApiSettings, RemoteRepo, ServerSettings, ServerType};
    use crate::engine::testing::{ForgeCall, MockForge};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn engine_with(public_url: Option<&str>) -> (Arc<SyncEngine>, Arc<MockForge>) {
        let db = DbHandle::new(SyncDb::new_in_memory().unwrap());
        let forge = Arc::new(MockForge::new());
        let mut config = SyncConfig::default();
        config.address.public_url = public_url.map(str::to_string);
        (Arc::new(SyncEngine::new(db, forge.clone(), config)), forge)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let (engine, _) = engine_with(None);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = build_router(engine).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (engine, _) = engine_with(None);
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = build_router(engine).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_catch_up_imports_then_installs_hooks() {
        let (engine, forge) = engine_with(Some("https://sync.test"));
        let server = {
            let db = engine.db.lock_sync().unwrap();
            let settings = ServerSettings {
                api: ApiSettings { access_token: Some("t".into()) },
                ..Default::default()
            };
            db.insert_server(ServerType::Gitlab, "gl", "https://gl.test", &settings).unwrap()
        };
        forge.set_repositories(vec![RemoteRepo {
            id: 42,
            name: "api".into(),
            path_with_namespace: "group/api".into(),
            web_url: None,
            description: None,
            archived: false,
        }]);

        catch_up(&engine).await;

        let repos = engine.db.call(|db| db.list_repos()).await.unwrap();
        assert_eq!(repos.len(), 1);
        let calls = forge.calls();
        let import_at = calls
            .iter()
            .position(|c| matches!(c, ForgeCall::GetRepositories { .. }))
            .unwrap();
        let hook_at = calls
            .iter()
            .position(|c| matches!(c, ForgeCall::InstallHook { remote_repo_id: None, .. }))
            .unwrap();
        assert!(import_at < hook_at);
        assert!(forge.installed_hooks().contains(&(
            server.id,
            None,
            format!("https://sync.test/hook/system/{}", server.id)
        )));
    }

    #[tokio::test]
    async fn test_task_inserted_by_other_connection_is_exported() {
        use crate::engine::links::relation;
        use crate::engine::models::{
            ExternalLink, RepoDetails, StoryDetails, StoryType, TaskAction, TaskOptions, TaskState,
        };

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sync.db");
        let forge = Arc::new(MockForge::new());
        let mut config = SyncConfig::default();
        config.change_feed.poll_interval_ms = 10;
        config.change_feed.debounce_ms = 10;
        let engine = Arc::new(SyncEngine::new(
            DbHandle::new(SyncDb::new(&path).unwrap()),
            forge.clone(),
            config,
        ));
        let (project_id, story_id, repo_id) = {
            let db = engine.db.lock_sync().unwrap();
            let settings = ServerSettings {
                api: ApiSettings { access_token: Some("t".into()) },
                ..Default::default()
            };
            let server = db.insert_server(ServerType::Gitlab, "gl", "https://gl.test", &settings).unwrap();
            let link = ExternalLink::for_server(&server).with(relation::PROJECT, 42);
            let repo = db.insert_repo("api", &RepoDetails::default(), &[link]).unwrap();
            let project = db.insert_project("p", &[repo.id]).unwrap();
            let story = db
                .insert_story(project.id, StoryType::Issue, &[], &StoryDetails::default())
                .unwrap();
            db.track_external_writes().unwrap();
            (project.id, story.id, repo.id)
        };

        let (stop, shutdown) = watch::channel(false);
        let reactor = tokio::spawn(Arc::clone(&engine).run_reactor(engine.db.subscribe(), shutdown.clone()));
        let timers = spawn_timers(Arc::clone(&engine), shutdown);

        let other = SyncDb::new(&path).unwrap();
        let task = other
            .insert_task(
                Some(project_id),
                TaskAction::ExportIssue,
                None,
                &TaskOptions { story_id: Some(story_id), repo_id: Some(repo_id) },
            )
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while forge.issue_calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("export of the externally inserted task");

        stop.send(true).unwrap();
        reactor.await.unwrap();
        for handle in timers {
            handle.await.unwrap();
        }
        let task_id = task.id;
        let exported = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = engine.db.call(move |db| db.get_task(project_id, task_id)).await.unwrap().unwrap();
                if task.state() == TaskState::Succeeded {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(exported.completion, 100);
        assert_eq!(forge.issue_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_timers_stop_on_shutdown() {
        let (engine, _) = engine_with(None);
        let (stop, shutdown) = watch::channel(false);
        let handles = spawn_timers(engine, shutdown);
        stop.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }
}
