use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use super::links;
use super::models::*;

/// Capacity of the change-feed channel. A reactor that falls further behind
/// than this loses events and logs the gap.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// Current time at the precision the database stores, so a timestamp written
/// and read back compares equal to the in-memory value.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).with_context(|| format!("Timestamp out of range: {}", us))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize JSON column")
}

fn from_json<T: DeserializeOwned>(text: &str, what: &str) -> Result<T> {
    serde_json::from_str(text).with_context(|| format!("Failed to parse {} JSON", what))
}

// ── Change feed ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// One row mutation with the row as it was before and after.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub action: ChangeAction,
    pub id: i64,
    pub previous: Option<T>,
    pub current: Option<T>,
}

impl<T> Change<T> {
    fn insert(id: i64, current: T) -> Self {
        Self { action: ChangeAction::Insert, id, previous: None, current: Some(current) }
    }

    fn update(id: i64, previous: T, current: T) -> Self {
        Self {
            action: ChangeAction::Update,
            id,
            previous: Some(previous),
            current: Some(current),
        }
    }

    fn delete(id: i64, previous: T) -> Self {
        Self { action: ChangeAction::Delete, id, previous: Some(previous), current: None }
    }
}

#[derive(Debug, Clone)]
pub enum RowChange {
    Server(Change<Server>),
    Repo(Change<Repo>),
    User(Change<User>),
    Project(Change<Project>),
    Story(Change<Story>),
    Task(Change<Task>),
    System(Change<System>),
}

impl RowChange {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Server(_) => "server",
            Self::Repo(_) => "repo",
            Self::User(_) => "user",
            Self::Project(_) => "project",
            Self::Story(_) => "story",
            Self::Task(_) => "task",
            Self::System(_) => "system",
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────

/// Async-safe handle to the sync database.
///
/// Wraps `SyncDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool. Writes publish `RowChange`s to every subscriber.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SyncDb>>,
    changes: broadcast::Sender<RowChange>,
}

impl DbHandle {
    pub fn new(mut db: SyncDb) -> Self {
        let (changes, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        db.changes = Some(changes.clone());
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
            changes,
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SyncDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, SyncDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    /// Subscribe to row changes made after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }
}

// ── External writes ───────────────────────────────────────────────────

/// The rows the reactor acts on, as last seen through this connection.
/// Only issue stories and export tasks are kept.
#[derive(Default)]
struct Snapshot {
    data_version: i64,
    servers: BTreeMap<i64, Server>,
    projects: BTreeMap<i64, Project>,
    stories: BTreeMap<i64, Story>,
    tasks: BTreeMap<i64, Task>,
    system: BTreeMap<i64, System>,
}

fn is_tracked_story(story: &Story) -> bool {
    story.story_type == StoryType::Issue
}

fn is_tracked_task(task: &Task) -> bool {
    task.action == TaskAction::ExportIssue
}

fn keep<T: Clone>(rows: &mut BTreeMap<i64, T>, change: &Change<T>, tracked: fn(&T) -> bool) {
    match &change.current {
        Some(row) if tracked(row) => {
            rows.insert(change.id, row.clone());
        }
        _ => {
            rows.remove(&change.id);
        }
    }
}

/// Compare `current` against `seen` by `mtime`, push the differences and
/// make `current` the new `seen`.
fn diff_table<T: Clone>(
    seen: &mut BTreeMap<i64, T>,
    current: BTreeMap<i64, T>,
    mtime: fn(&T) -> DateTime<Utc>,
    wrap: fn(Change<T>) -> RowChange,
    out: &mut Vec<RowChange>,
) {
    let mut previous = std::mem::take(seen);
    for (id, row) in &current {
        match previous.remove(id) {
            None => out.push(wrap(Change::insert(*id, row.clone()))),
            Some(before) if mtime(&before) != mtime(row) => {
                out.push(wrap(Change::update(*id, before, row.clone())))
            }
            Some(_) => {}
        }
    }
    out.extend(previous.into_iter().map(|(id, before)| wrap(Change::delete(id, before))));
    *seen = current;
}

impl Snapshot {
    fn record(&mut self, change: &RowChange) {
        match change {
            RowChange::Server(c) => keep(&mut self.servers, c, |_| true),
            RowChange::Project(c) => keep(&mut self.projects, c, |_| true),
            RowChange::Story(c) => keep(&mut self.stories, c, is_tracked_story),
            RowChange::Task(c) => keep(&mut self.tasks, c, is_tracked_task),
            RowChange::System(c) => keep(&mut self.system, c, |_| true),
            RowChange::Repo(_) | RowChange::User(_) => {}
        }
    }

    fn advance(&mut self, current: Snapshot) -> Vec<RowChange> {
        let mut out = Vec::new();
        diff_table(&mut self.servers, current.servers, |r| r.mtime, RowChange::Server, &mut out);
        diff_table(&mut self.projects, current.projects, |r| r.mtime, RowChange::Project, &mut out);
        diff_table(&mut self.stories, current.stories, |r| r.mtime, RowChange::Story, &mut out);
        diff_table(&mut self.tasks, current.tasks, |r| r.mtime, RowChange::Task, &mut out);
        diff_table(&mut self.system, current.system, |r| r.mtime, RowChange::System, &mut out);
        self.data_version = current.data_version;
        out
    }
}

// ── Database ──────────────────────────────────────────────────────────

pub struct SyncDb {
    conn: Connection,
    changes: Option<broadcast::Sender<RowChange>>,
    watch: RefCell<Option<Snapshot>>,
}

/// A story produced by the importer, keyed by its remote identity.
#[derive(Debug, Clone)]
pub struct ImportedStory {
    pub project_id: i64,
    pub story_type: StoryType,
    pub user_ids: Vec<i64>,
    pub repo_id: Option<i64>,
    pub details: StoryDetails,
    pub link: ExternalLink,
    pub ctime: DateTime<Utc>,
}

const SERVER_COLUMNS: &str = "id, server_type, name, url, settings, deleted, disabled, mtime";
const REPO_COLUMNS: &str = "id, name, details, external, deleted, mtime";
const USER_COLUMNS: &str = "id, username, name, email, external, deleted, mtime";
const PROJECT_COLUMNS: &str = "id, name, repo_ids, import_markers, archived, deleted, mtime";
const STORY_COLUMNS: &str =
    "id, project_id, story_type, user_ids, repo_id, details, external, deleted, ctime, mtime, itime, etime";
const TASK_COLUMNS: &str =
    "id, project_id, action, user_id, options, completion, failed, details, ctime, mtime, etime";

impl SyncDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn, changes: None, watch: RefCell::new(None) };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn, changes: None, watch: RefCell::new(None) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS servers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    server_type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    settings TEXT NOT NULL DEFAULT '{}',
                    deleted INTEGER NOT NULL DEFAULT 0,
                    disabled INTEGER NOT NULL DEFAULT 0,
                    mtime INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS repos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    details TEXT NOT NULL DEFAULT '{}',
                    external TEXT NOT NULL DEFAULT '[]',
                    deleted INTEGER NOT NULL DEFAULT 0,
                    mtime INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    email TEXT,
                    external TEXT NOT NULL DEFAULT '[]',
                    deleted INTEGER NOT NULL DEFAULT 0,
                    mtime INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    repo_ids TEXT NOT NULL DEFAULT '[]',
                    import_markers TEXT NOT NULL DEFAULT '{}',
                    archived INTEGER NOT NULL DEFAULT 0,
                    deleted INTEGER NOT NULL DEFAULT 0,
                    mtime INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    story_type TEXT NOT NULL,
                    user_ids TEXT NOT NULL DEFAULT '[]',
                    repo_id INTEGER,
                    details TEXT NOT NULL DEFAULT '{}',
                    external TEXT NOT NULL DEFAULT '[]',
                    deleted INTEGER NOT NULL DEFAULT 0,
                    ctime INTEGER NOT NULL,
                    mtime INTEGER NOT NULL,
                    itime INTEGER,
                    etime INTEGER
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER REFERENCES projects(id) ON DELETE CASCADE,
                    action TEXT NOT NULL,
                    user_id INTEGER,
                    options TEXT NOT NULL DEFAULT '{}',
                    completion INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0,
                    details TEXT NOT NULL DEFAULT '{}',
                    ctime INTEGER NOT NULL,
                    mtime INTEGER NOT NULL,
                    etime INTEGER
                );

                CREATE TABLE IF NOT EXISTS system (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    details TEXT NOT NULL DEFAULT '{}',
                    mtime INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_stories_project ON stories(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_action_ctime ON tasks(action, ctime);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn emit(&self, change: RowChange) {
        if let Some(snapshot) = self.watch.borrow_mut().as_mut() {
            snapshot.record(&change);
        }
        self.publish(change);
    }

    fn publish(&self, change: RowChange) {
        if let Some(tx) = &self.changes {
            // No receivers is fine: nothing is reacting yet.
            let _ = tx.send(change);
        }
    }

    fn data_version(&self) -> Result<i64> {
        self.conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))
            .context("Failed to read data_version")
    }

    fn load_tracked(&self, data_version: i64) -> Result<Snapshot> {
        let stories_sql = format!("SELECT {} FROM stories WHERE story_type = ?1 ORDER BY id", STORY_COLUMNS);
        let tasks_sql = format!("SELECT {} FROM tasks WHERE action = ?1 ORDER BY id", TASK_COLUMNS);
        let mut snapshot = Snapshot { data_version, ..Default::default() };
        for server in self.list_servers()? {
            snapshot.servers.insert(server.id, server);
        }
        for project in self.list_projects()? {
            snapshot.projects.insert(project.id, project);
        }
        for row in self.collect(&stories_sql, params![StoryType::Issue.as_str()], StoryRow::read, "issue stories")? {
            let story = row.into_story()?;
            snapshot.stories.insert(story.id, story);
        }
        for row in self.collect(&tasks_sql, params![TaskAction::ExportIssue.as_str()], TaskRow::read, "export tasks")? {
            let task = row.into_task()?;
            snapshot.tasks.insert(task.id, task);
        }
        if let Some(system) = self.get_system()? {
            snapshot.system.insert(system.id, system);
        }
        Ok(snapshot)
    }

    /// Start noticing rows written by other connections to the same
    /// database file. The current contents become the baseline.
    pub fn track_external_writes(&self) -> Result<()> {
        let snapshot = self.load_tracked(self.data_version()?)?;
        *self.watch.borrow_mut() = Some(snapshot);
        Ok(())
    }

    /// Publish changes committed by other connections since the last call.
    /// Rows are compared by `mtime`, so writers must bump it. Returns the
    /// number of changes published; always 0 until tracking has started.
    pub fn poll_external_writes(&self) -> Result<usize> {
        let version = self.data_version()?;
        let changes = {
            let mut watch = self.watch.borrow_mut();
            let Some(seen) = watch.as_mut() else {
                return Ok(0);
            };
            if seen.data_version == version {
                return Ok(0);
            }
            seen.advance(self.load_tracked(version)?)
        };
        let count = changes.len();
        for change in changes {
            self.publish(change);
        }
        Ok(count)
    }

    fn collect<R>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        read: impl FnMut(&Row<'_>) -> rusqlite::Result<R>,
        what: &str,
    ) -> Result<Vec<R>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare {}", what))?;
        let rows = stmt
            .query_map(params, read)
            .with_context(|| format!("Failed to query {}", what))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.with_context(|| format!("Failed to read {} row", what))?);
        }
        Ok(out)
    }

    // ── Servers ───────────────────────────────────────────────────────

    pub fn insert_server(
        &self,
        server_type: ServerType,
        name: &str,
        url: &str,
        settings: &ServerSettings,
    ) -> Result<Server> {
        self.conn
            .execute(
                "INSERT INTO servers (server_type, name, url, settings, mtime) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![server_type.as_str(), name, url, to_json(settings)?, to_micros(now())],
            )
            .context("Failed to insert server")?;
        let id = self.conn.last_insert_rowid();
        let server = self.get_server(id)?.context("Server not found after insert")?;
        self.emit(RowChange::Server(Change::insert(id, server.clone())));
        Ok(server)
    }

    pub fn get_server(&self, id: i64) -> Result<Option<Server>> {
        let sql = format!("SELECT {} FROM servers WHERE id = ?1", SERVER_COLUMNS);
        let rows = self.collect(&sql, params![id], ServerRow::read, "server")?;
        rows.into_iter().next().map(ServerRow::into_server).transpose()
    }

    pub fn list_servers(&self) -> Result<Vec<Server>> {
        let sql = format!("SELECT {} FROM servers ORDER BY id", SERVER_COLUMNS);
        self.collect(&sql, [], ServerRow::read, "servers")?
            .into_iter()
            .map(ServerRow::into_server)
            .collect()
    }

    /// Persist name, url, settings and flags of `server`.
    pub fn update_server(&self, server: &Server) -> Result<Server> {
        let previous = self
            .get_server(server.id)?
            .with_context(|| format!("Server {} not found", server.id))?;
        self.conn
            .execute(
                "UPDATE servers SET name = ?1, url = ?2, settings = ?3, deleted = ?4, disabled = ?5, mtime = ?6 WHERE id = ?7",
                params![
                    server.name,
                    server.url,
                    to_json(&server.settings)?,
                    server.deleted,
                    server.disabled,
                    to_micros(now()),
                    server.id
                ],
            )
            .context("Failed to update server")?;
        let current = self.get_server(server.id)?.context("Server not found after update")?;
        self.emit(RowChange::Server(Change::update(server.id, previous, current.clone())));
        Ok(current)
    }

    // ── Repos ─────────────────────────────────────────────────────────

    pub fn insert_repo(
        &self,
        name: &str,
        details: &RepoDetails,
        external: &[ExternalLink],
    ) -> Result<Repo> {
        self.conn
            .execute(
                "INSERT INTO repos (name, details, external, mtime) VALUES (?1, ?2, ?3, ?4)",
                params![name, to_json(details)?, to_json(&external)?, to_micros(now())],
            )
            .context("Failed to insert repo")?;
        let id = self.conn.last_insert_rowid();
        let repo = self.get_repo(id)?.context("Repo not found after insert")?;
        self.emit(RowChange::Repo(Change::insert(id, repo.clone())));
        Ok(repo)
    }

    pub fn get_repo(&self, id: i64) -> Result<Option<Repo>> {
        let sql = format!("SELECT {} FROM repos WHERE id = ?1", REPO_COLUMNS);
        let rows = self.collect(&sql, params![id], RepoRow::read, "repo")?;
        rows.into_iter().next().map(RepoRow::into_repo).transpose()
    }

    pub fn list_repos(&self) -> Result<Vec<Repo>> {
        let sql = format!("SELECT {} FROM repos ORDER BY id", REPO_COLUMNS);
        self.collect(&sql, [], RepoRow::read, "repos")?
            .into_iter()
            .map(RepoRow::into_repo)
            .collect()
    }

    pub fn update_repo(&self, repo: &Repo) -> Result<Repo> {
        let previous = self
            .get_repo(repo.id)?
            .with_context(|| format!("Repo {} not found", repo.id))?;
        self.conn
            .execute(
                "UPDATE repos SET name = ?1, details = ?2, external = ?3, deleted = ?4, mtime = ?5 WHERE id = ?6",
                params![
                    repo.name,
                    to_json(&repo.details)?,
                    to_json(&repo.external)?,
                    repo.deleted,
                    to_micros(now()),
                    repo.id
                ],
            )
            .context("Failed to update repo")?;
        let current = self.get_repo(repo.id)?.context("Repo not found after update")?;
        self.emit(RowChange::Repo(Change::update(repo.id, previous, current.clone())));
        Ok(current)
    }

    pub fn find_repo_by_link(&self, criteria: &ExternalLink) -> Result<Option<Repo>> {
        Ok(self
            .list_repos()?
            .into_iter()
            .find(|repo| links::has_match(&repo.external, criteria)))
    }

    pub fn list_repos_linked_to(&self, server_id: i64) -> Result<Vec<Repo>> {
        Ok(self
            .list_repos()?
            .into_iter()
            .filter(|repo| links::find_link(&repo.external, server_id).is_some())
            .collect())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub fn insert_user(
        &self,
        username: &str,
        name: &str,
        email: Option<&str>,
        external: &[ExternalLink],
    ) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (username, name, email, external, mtime) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![username, name, email, to_json(&external)?, to_micros(now())],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        let user = self.get_user(id)?.context("User not found after insert")?;
        self.emit(RowChange::User(Change::insert(id, user.clone())));
        Ok(user)
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        let rows = self.collect(&sql, params![id], UserRow::read, "user")?;
        rows.into_iter().next().map(UserRow::into_user).transpose()
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let sql = format!("SELECT {} FROM users ORDER BY id", USER_COLUMNS);
        self.collect(&sql, [], UserRow::read, "users")?
            .into_iter()
            .map(UserRow::into_user)
            .collect()
    }

    pub fn update_user(&self, user: &User) -> Result<User> {
        let previous = self
            .get_user(user.id)?
            .with_context(|| format!("User {} not found", user.id))?;
        self.conn
            .execute(
                "UPDATE users SET username = ?1, name = ?2, email = ?3, external = ?4, deleted = ?5, mtime = ?6 WHERE id = ?7",
                params![
                    user.username,
                    user.name,
                    user.email,
                    to_json(&user.external)?,
                    user.deleted,
                    to_micros(now()),
                    user.id
                ],
            )
            .context("Failed to update user")?;
        let current = self.get_user(user.id)?.context("User not found after update")?;
        self.emit(RowChange::User(Change::update(user.id, previous, current.clone())));
        Ok(current)
    }

    pub fn find_user_by_link(&self, criteria: &ExternalLink) -> Result<Option<User>> {
        Ok(self
            .list_users()?
            .into_iter()
            .find(|user| !user.deleted && links::has_match(&user.external, criteria)))
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn insert_project(&self, name: &str, repo_ids: &[i64]) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, repo_ids, mtime) VALUES (?1, ?2, ?3)",
                params![name, to_json(&repo_ids)?, to_micros(now())],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        let project = self.get_project(id)?.context("Project not found after insert")?;
        self.emit(RowChange::Project(Change::insert(id, project.clone())));
        Ok(project)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
        let rows = self.collect(&sql, params![id], ProjectRow::read, "project")?;
        rows.into_iter().next().map(ProjectRow::into_project).transpose()
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let sql = format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS);
        self.collect(&sql, [], ProjectRow::read, "projects")?
            .into_iter()
            .map(ProjectRow::into_project)
            .collect()
    }

    pub fn list_projects_with_repo(&self, repo_id: i64) -> Result<Vec<Project>> {
        Ok(self
            .list_projects()?
            .into_iter()
            .filter(|project| project.repo_ids.contains(&repo_id))
            .collect())
    }

    /// Persist name, repo list and flags of `project`. Import markers are
    /// written separately through `set_import_marker`.
    pub fn update_project(&self, project: &Project) -> Result<Project> {
        let previous = self
            .get_project(project.id)?
            .with_context(|| format!("Project {} not found", project.id))?;
        self.conn
            .execute(
                "UPDATE projects SET name = ?1, repo_ids = ?2, archived = ?3, deleted = ?4, mtime = ?5 WHERE id = ?6",
                params![
                    project.name,
                    to_json(&project.repo_ids)?,
                    project.archived,
                    project.deleted,
                    to_micros(now()),
                    project.id
                ],
            )
            .context("Failed to update project")?;
        let current = self.get_project(project.id)?.context("Project not found after update")?;
        self.emit(RowChange::Project(Change::update(project.id, previous, current.clone())));
        Ok(current)
    }

    pub fn set_import_marker(
        &self,
        project_id: i64,
        repo_id: i64,
        marker: &ImportMarker,
    ) -> Result<Project> {
        let previous = self
            .get_project(project_id)?
            .with_context(|| format!("Project {} not found", project_id))?;
        let mut markers = previous.import_markers.clone();
        markers.insert(repo_id, marker.clone());
        self.conn
            .execute(
                "UPDATE projects SET import_markers = ?1 WHERE id = ?2",
                params![to_json(&markers)?, project_id],
            )
            .context("Failed to update import marker")?;
        let current = self.get_project(project_id)?.context("Project not found after marker update")?;
        self.emit(RowChange::Project(Change::update(project_id, previous, current.clone())));
        Ok(current)
    }

    // ── Stories ───────────────────────────────────────────────────────

    pub fn insert_story(
        &self,
        project_id: i64,
        story_type: StoryType,
        user_ids: &[i64],
        details: &StoryDetails,
    ) -> Result<Story> {
        let t = to_micros(now());
        self.conn
            .execute(
                "INSERT INTO stories (project_id, story_type, user_ids, details, ctime, mtime) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![project_id, story_type.as_str(), to_json(&user_ids)?, to_json(details)?, t],
            )
            .context("Failed to insert story")?;
        let id = self.conn.last_insert_rowid();
        let story = self.get_story(project_id, id)?.context("Story not found after insert")?;
        self.emit(RowChange::Story(Change::insert(id, story.clone())));
        Ok(story)
    }

    pub fn get_story(&self, project_id: i64, id: i64) -> Result<Option<Story>> {
        let sql = format!("SELECT {} FROM stories WHERE project_id = ?1 AND id = ?2", STORY_COLUMNS);
        let rows = self.collect(&sql, params![project_id, id], StoryRow::read, "story")?;
        rows.into_iter().next().map(StoryRow::into_story).transpose()
    }

    pub fn list_stories(&self, project_id: i64) -> Result<Vec<Story>> {
        let sql = format!("SELECT {} FROM stories WHERE project_id = ?1 ORDER BY id", STORY_COLUMNS);
        self.collect(&sql, params![project_id], StoryRow::read, "stories")?
            .into_iter()
            .map(StoryRow::into_story)
            .collect()
    }

    pub fn find_story_by_link(&self, project_id: i64, criteria: &ExternalLink) -> Result<Option<Story>> {
        Ok(self
            .list_stories(project_id)?
            .into_iter()
            .find(|story| links::has_match(&story.external, criteria)))
    }

    /// A user edit: new details, fresh `mtime`, `itime`/`etime` untouched.
    pub fn update_story_details(&self, project_id: i64, id: i64, details: &StoryDetails) -> Result<Story> {
        let previous = self
            .get_story(project_id, id)?
            .with_context(|| format!("Story {} not found", id))?;
        self.conn
            .execute(
                "UPDATE stories SET details = ?1, mtime = ?2 WHERE project_id = ?3 AND id = ?4",
                params![to_json(details)?, to_micros(now()), project_id, id],
            )
            .context("Failed to update story details")?;
        let current = self.get_story(project_id, id)?.context("Story not found after update")?;
        self.emit(RowChange::Story(Change::update(id, previous, current.clone())));
        Ok(current)
    }

    /// Insert or update the story whose link matches `imported.link`.
    /// `mtime` and `itime` receive the same instant.
    ///
    /// An existing story keeps its authors. A story this engine exported
    /// takes only forge-owned details (state, number, URL); any other story
    /// takes every detail the import carries and keeps the rest.
    pub fn upsert_imported_story(&self, imported: &ImportedStory) -> Result<Story> {
        let t = to_micros(now());
        let identity = imported.link.without(links::relation::ISSUE_NUMBER);
        let existing = self.find_story_by_link(imported.project_id, &identity)?;
        match existing {
            Some(previous) => {
                let mut external = previous.external.clone();
                links::attach(&mut external, imported.link.clone());
                let mut details = previous.details.clone();
                let (story_type, repo_id) = if previous.etime.is_some() {
                    details.merge_forge_owned(&imported.details);
                    (previous.story_type, previous.repo_id)
                } else {
                    details.merge_imported(&imported.details);
                    (imported.story_type, imported.repo_id.or(previous.repo_id))
                };
                let user_ids = if previous.user_ids.is_empty() {
                    &imported.user_ids
                } else {
                    &previous.user_ids
                };
                self.conn
                    .execute(
                        "UPDATE stories SET story_type = ?1, user_ids = ?2, repo_id = ?3, details = ?4, external = ?5, mtime = ?6, itime = ?6
                         WHERE project_id = ?7 AND id = ?8",
                        params![
                            story_type.as_str(),
                            to_json(user_ids)?,
                            repo_id,
                            to_json(&details)?,
                            to_json(&external)?,
                            t,
                            imported.project_id,
                            previous.id
                        ],
                    )
                    .context("Failed to update imported story")?;
                let current = self
                    .get_story(imported.project_id, previous.id)?
                    .context("Story not found after import update")?;
                self.emit(RowChange::Story(Change::update(previous.id, previous, current.clone())));
                Ok(current)
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO stories (project_id, story_type, user_ids, repo_id, details, external, ctime, mtime, itime)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                        params![
                            imported.project_id,
                            imported.story_type.as_str(),
                            to_json(&imported.user_ids)?,
                            imported.repo_id,
                            to_json(&imported.details)?,
                            to_json(&vec![imported.link.clone()])?,
                            to_micros(imported.ctime),
                            t
                        ],
                    )
                    .context("Failed to insert imported story")?;
                let id = self.conn.last_insert_rowid();
                let story = self
                    .get_story(imported.project_id, id)?
                    .context("Story not found after import insert")?;
                self.emit(RowChange::Story(Change::insert(id, story.clone())));
                Ok(story)
            }
        }
    }

    /// Record the remote issue on the story. `mtime` and `etime` receive the
    /// same instant.
    pub fn mark_story_exported(
        &self,
        project_id: i64,
        id: i64,
        link: ExternalLink,
        number: Option<i64>,
        time: DateTime<Utc>,
    ) -> Result<Story> {
        let previous = self
            .get_story(project_id, id)?
            .with_context(|| format!("Story {} not found", id))?;
        let mut external = previous.external.clone();
        links::attach(&mut external, link);
        let mut details = previous.details.clone();
        if number.is_some() {
            details.number = number;
        }
        self.conn
            .execute(
                "UPDATE stories SET external = ?1, details = ?2, mtime = ?3, etime = ?3 WHERE project_id = ?4 AND id = ?5",
                params![to_json(&external)?, to_json(&details)?, to_micros(time), project_id, id],
            )
            .context("Failed to mark story exported")?;
        let current = self.get_story(project_id, id)?.context("Story not found after export")?;
        self.emit(RowChange::Story(Change::update(id, previous, current.clone())));
        Ok(current)
    }

    pub fn delete_story(&self, project_id: i64, id: i64) -> Result<bool> {
        let Some(previous) = self.get_story(project_id, id)? else {
            return Ok(false);
        };
        self.conn
            .execute(
                "DELETE FROM stories WHERE project_id = ?1 AND id = ?2",
                params![project_id, id],
            )
            .context("Failed to delete story")?;
        self.emit(RowChange::Story(Change::delete(id, previous)));
        Ok(true)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn insert_task(
        &self,
        project_id: Option<i64>,
        action: TaskAction,
        user_id: Option<i64>,
        options: &TaskOptions,
    ) -> Result<Task> {
        let t = to_micros(now());
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, action, user_id, options, ctime, mtime) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![project_id, action.as_str(), user_id, to_json(options)?, t],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        let task = self.get_task_by_id(id)?.context("Task not found after insert")?;
        self.emit(RowChange::Task(Change::insert(id, task.clone())));
        Ok(task)
    }

    fn get_task_by_id(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        let rows = self.collect(&sql, params![id], TaskRow::read, "task")?;
        rows.into_iter().next().map(TaskRow::into_task).transpose()
    }

    pub fn get_task(&self, project_id: i64, id: i64) -> Result<Option<Task>> {
        Ok(self
            .get_task_by_id(id)?
            .filter(|task| task.project_id == Some(project_id)))
    }

    pub fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY id", TASK_COLUMNS);
        self.collect(&sql, params![project_id], TaskRow::read, "tasks")?
            .into_iter()
            .map(TaskRow::into_task)
            .collect()
    }

    /// The completed, non-failed export of `story_id`, if any.
    pub fn find_completed_export_task(&self, project_id: i64, story_id: i64) -> Result<Option<Task>> {
        Ok(self.list_tasks(project_id)?.into_iter().find(|task| {
            task.action == TaskAction::ExportIssue
                && task.completion == 100
                && !task.failed
                && task.options.story_id == Some(story_id)
        }))
    }

    /// The newest export of `story_id` that has not completed, failed or not.
    pub fn find_pending_export_task(&self, project_id: i64, story_id: i64) -> Result<Option<Task>> {
        Ok(self.list_tasks(project_id)?.into_iter().rev().find(|task| {
            task.action == TaskAction::ExportIssue
                && (task.completion < 100 || task.failed)
                && task.options.story_id == Some(story_id)
        }))
    }

    /// Export tasks in any project created at or after `since` that are
    /// incomplete or failed.
    pub fn list_pending_exports(&self, since: DateTime<Utc>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE action = ?1 AND project_id IS NOT NULL AND ctime >= ?2 AND (completion < 100 OR failed = 1)
             ORDER BY id",
            TASK_COLUMNS
        );
        self.collect(
            &sql,
            params![TaskAction::ExportIssue.as_str(), to_micros(since)],
            TaskRow::read,
            "pending exports",
        )?
        .into_iter()
        .map(TaskRow::into_task)
        .collect()
    }

    pub fn set_task_completion(&self, project_id: i64, id: i64, completion: i32) -> Result<Task> {
        self.update_task(project_id, id, |task| task.completion = completion)
    }

    pub fn update_task_options(&self, project_id: i64, id: i64, options: &TaskOptions) -> Result<Task> {
        let options = options.clone();
        self.update_task(project_id, id, move |task| task.options = options)
    }

    pub fn mark_task_exported(
        &self,
        project_id: i64,
        id: i64,
        issue: &RemoteIssueRef,
        time: DateTime<Utc>,
    ) -> Result<Task> {
        let issue = issue.clone();
        self.update_task(project_id, id, move |task| {
            task.completion = 100;
            task.failed = false;
            task.etime = Some(time);
            task.details = TaskDetails {
                error: None,
                issue: Some(issue),
            };
        })
    }

    pub fn mark_task_failed(&self, project_id: i64, id: i64, error: &str) -> Result<Task> {
        let error = error.to_string();
        self.update_task(project_id, id, move |task| {
            task.failed = true;
            task.details.error = Some(error);
        })
    }

    fn update_task(&self, project_id: i64, id: i64, edit: impl FnOnce(&mut Task)) -> Result<Task> {
        let previous = self
            .get_task(project_id, id)?
            .with_context(|| format!("Task {} not found in project {}", id, project_id))?;
        let mut task = previous.clone();
        edit(&mut task);
        self.conn
            .execute(
                "UPDATE tasks SET options = ?1, completion = ?2, failed = ?3, details = ?4, mtime = ?5, etime = ?6 WHERE id = ?7",
                params![
                    to_json(&task.options)?,
                    task.completion,
                    task.failed,
                    to_json(&task.details)?,
                    to_micros(now()),
                    task.etime.map(to_micros),
                    id
                ],
            )
            .context("Failed to update task")?;
        let current = self.get_task(project_id, id)?.context("Task not found after update")?;
        self.emit(RowChange::Task(Change::update(id, previous, current.clone())));
        Ok(current)
    }

    // ── System ────────────────────────────────────────────────────────

    pub fn get_system(&self) -> Result<Option<System>> {
        self.conn
            .query_row("SELECT id, details, mtime FROM system WHERE id = 1", [], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })
            .optional()
            .context("Failed to query system row")?
            .map(|(id, details, mtime)| {
                Ok(System {
                    id,
                    details: from_json(&details, "system details")?,
                    mtime: from_micros(mtime)?,
                })
            })
            .transpose()
    }

    pub fn set_system_details(&self, details: &SystemDetails) -> Result<System> {
        let previous = self.get_system()?;
        self.conn
            .execute(
                "INSERT INTO system (id, details, mtime) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET details = excluded.details, mtime = excluded.mtime",
                params![to_json(details)?, to_micros(now())],
            )
            .context("Failed to upsert system row")?;
        let current = self.get_system()?.context("System row not found after upsert")?;
        let change = match previous {
            Some(previous) => Change::update(1, previous, current.clone()),
            None => Change::insert(1, current.clone()),
        };
        self.emit(RowChange::System(change));
        Ok(current)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

struct ServerRow {
    id: i64,
    server_type: String,
    name: String,
    url: String,
    settings: String,
    deleted: bool,
    disabled: bool,
    mtime: i64,
}

impl ServerRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            server_type: row.get(1)?,
            name: row.get(2)?,
            url: row.get(3)?,
            settings: row.get(4)?,
            deleted: row.get(5)?,
            disabled: row.get(6)?,
            mtime: row.get(7)?,
        })
    }

    fn into_server(self) -> Result<Server> {
        let server_type = ServerType::from_str(&self.server_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse server type")?;
        Ok(Server {
            id: self.id,
            server_type,
            name: self.name,
            url: self.url,
            settings: from_json(&self.settings, "server settings")?,
            deleted: self.deleted,
            disabled: self.disabled,
            mtime: from_micros(self.mtime)?,
        })
    }
}

struct RepoRow {
    id: i64,
    name: String,
    details: String,
    external: String,
    deleted: bool,
    mtime: i64,
}

impl RepoRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            details: row.get(2)?,
            external: row.get(3)?,
            deleted: row.get(4)?,
            mtime: row.get(5)?,
        })
    }

    fn into_repo(self) -> Result<Repo> {
        Ok(Repo {
            id: self.id,
            name: self.name,
            details: from_json(&self.details, "repo details")?,
            external: from_json(&self.external, "repo links")?,
            deleted: self.deleted,
            mtime: from_micros(self.mtime)?,
        })
    }
}

struct UserRow {
    id: i64,
    username: String,
    name: String,
    email: Option<String>,
    external: String,
    deleted: bool,
    mtime: i64,
}

impl UserRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            external: row.get(4)?,
            deleted: row.get(5)?,
            mtime: row.get(6)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            username: self.username,
            name: self.name,
            email: self.email,
            external: from_json(&self.external, "user links")?,
            deleted: self.deleted,
            mtime: from_micros(self.mtime)?,
        })
    }
}

struct ProjectRow {
    id: i64,
    name: String,
    repo_ids: String,
    import_markers: String,
    archived: bool,
    deleted: bool,
    mtime: i64,
}

impl ProjectRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            repo_ids: row.get(2)?,
            import_markers: row.get(3)?,
            archived: row.get(4)?,
            deleted: row.get(5)?,
            mtime: row.get(6)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let import_markers: BTreeMap<i64, ImportMarker> =
            from_json(&self.import_markers, "project import markers")?;
        Ok(Project {
            id: self.id,
            name: self.name,
            repo_ids: from_json(&self.repo_ids, "project repo ids")?,
            import_markers,
            archived: self.archived,
            deleted: self.deleted,
            mtime: from_micros(self.mtime)?,
        })
    }
}

struct StoryRow {
    id: i64,
    project_id: i64,
    story_type: String,
    user_ids: String,
    repo_id: Option<i64>,
    details: String,
    external: String,
    deleted: bool,
    ctime: i64,
    mtime: i64,
    itime: Option<i64>,
    etime: Option<i64>,
}

impl StoryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            story_type: row.get(2)?,
            user_ids: row.get(3)?,
            repo_id: row.get(4)?,
            details: row.get(5)?,
            external: row.get(6)?,
            deleted: row.get(7)?,
            ctime: row.get(8)?,
            mtime: row.get(9)?,
            itime: row.get(10)?,
            etime: row.get(11)?,
        })
    }

    fn into_story(self) -> Result<Story> {
        let story_type = StoryType::from_str(&self.story_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse story type")?;
        Ok(Story {
            id: self.id,
            project_id: self.project_id,
            story_type,
            user_ids: from_json(&self.user_ids, "story authors")?,
            repo_id: self.repo_id,
            details: from_json(&self.details, "story details")?,
            external: from_json(&self.external, "story links")?,
            deleted: self.deleted,
            ctime: from_micros(self.ctime)?,
            mtime: from_micros(self.mtime)?,
            itime: self.itime.map(from_micros).transpose()?,
            etime: self.etime.map(from_micros).transpose()?,
        })
    }
}

struct TaskRow {
    id: i64,
    project_id: Option<i64>,
    action: String,
    user_id: Option<i64>,
    options: String,
    completion: i32,
    failed: bool,
    details: String,
    ctime: i64,
    mtime: i64,
    etime: Option<i64>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            action: row.get(2)?,
            user_id: row.get(3)?,
            options: row.get(4)?,
            completion: row.get(5)?,
            failed: row.get(6)?,
            details: row.get(7)?,
            ctime: row.get(8)?,
            mtime: row.get(9)?,
            etime: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let action = TaskAction::from_str(&self.action)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task action")?;
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            action,
            user_id: self.user_id,
            options: from_json(&self.options, "task options")?,
            completion: self.completion,
            failed: self.failed,
            details: from_json(&self.details, "task details")?,
            ctime: from_micros(self.ctime)?,
            mtime: from_micros(self.mtime)?,
            etime: self.etime.map(from_micros).transpose()?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
