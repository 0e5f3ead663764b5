use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Servers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Gitlab,
}

impl ServerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gitlab => "gitlab",
        }
    }
}

impl FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gitlab" => Ok(Self::Gitlab),
            _ => Err(format!("Invalid server type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthSettings {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiSettings {
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub server_type: ServerType,
    pub name: String,
    /// Base URL of the forge instance, e.g. `https://gitlab.example.com`.
    pub url: String,
    pub settings: ServerSettings,
    pub deleted: bool,
    pub disabled: bool,
    pub mtime: DateTime<Utc>,
}

impl Server {
    pub fn access_token(&self) -> Option<&str> {
        self.settings
            .api
            .access_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }

    /// Active servers are eligible for import and hook installation.
    pub fn is_active(&self) -> bool {
        !self.deleted && !self.disabled && self.access_token().is_some()
    }
}

// ── External links ────────────────────────────────────────────────────

/// Remote identifier: forges use numeric ids for most objects but strings
/// for commits and wiki slugs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteKey {
    Number(i64),
    Text(String),
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RemoteKey {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RemoteKey {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RemoteKey {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RemoteKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<RemoteKey>,
}

/// `{type, server_id, <relation>: {id | ids}}` reference from a local row to
/// the remote object(s) it mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLink {
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub server_id: i64,
    #[serde(flatten)]
    pub relations: BTreeMap<String, RemoteId>,
}

// ── Repos and users ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub name: String,
    pub details: RepoDetails,
    pub external: Vec<ExternalLink>,
    pub deleted: bool,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub email: Option<String>,
    pub external: Vec<ExternalLink>,
    pub deleted: bool,
    pub mtime: DateTime<Utc>,
}

// ── Projects ──────────────────────────────────────────────────────────

/// Last forge event imported for a repo/project pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportMarker {
    pub event_id: i64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub repo_ids: Vec<i64>,
    /// Keyed by local repo id.
    pub import_markers: BTreeMap<i64, ImportMarker>,
    pub archived: bool,
    pub deleted: bool,
    pub mtime: DateTime<Utc>,
}

impl Project {
    /// Archived or deleted projects keep their repos but receive no hooks.
    pub fn is_live(&self) -> bool {
        !self.archived && !self.deleted
    }
}

// ── Stories ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoryType {
    Post,
    Issue,
    Push,
    MergeRequest,
    Branch,
    Tag,
    Wiki,
}

impl StoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Issue => "issue",
            Self::Push => "push",
            Self::MergeRequest => "merge-request",
            Self::Branch => "branch",
            Self::Tag => "tag",
            Self::Wiki => "wiki",
        }
    }
}

impl FromStr for StoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "issue" => Ok(Self::Issue),
            "push" => Ok(Self::Push),
            "merge-request" => Ok(Self::MergeRequest),
            "branch" => Ok(Self::Branch),
            "tag" => Ok(Self::Tag),
            "wiki" => Ok(Self::Wiki),
            _ => Err(format!("Invalid story type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoryDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub confidential: bool,
}

impl StoryDetails {
    /// Overlay what the forge reported. Fields it left out keep their stored
    /// values; activity listings carry no description, labels or visibility.
    pub fn merge_imported(&mut self, imported: &StoryDetails) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.title, &imported.title);
        take(&mut self.text, &imported.text);
        take(&mut self.state, &imported.state);
        take(&mut self.action, &imported.action);
        take(&mut self.number, &imported.number);
        take(&mut self.url, &imported.url);
        take(&mut self.branch, &imported.branch);
        take(&mut self.commit, &imported.commit);
        take(&mut self.commit_count, &imported.commit_count);
        if !imported.labels.is_empty() {
            self.labels.clone_from(&imported.labels);
        }
        self.confidential |= imported.confidential;
    }

    /// Overlay only the fields the forge owns on an issue exported from here:
    /// its state, number and URL. Content stays as authored locally.
    pub fn merge_forge_owned(&mut self, imported: &StoryDetails) {
        if imported.state.is_some() {
            self.state.clone_from(&imported.state);
        }
        if imported.number.is_some() {
            self.number = imported.number;
        }
        if imported.url.is_some() {
            self.url.clone_from(&imported.url);
        }
    }
}

/// Who produced the most recent write to a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    User,
    Import,
    Export,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub project_id: i64,
    pub story_type: StoryType,
    /// Authors.
    pub user_ids: Vec<i64>,
    pub repo_id: Option<i64>,
    pub details: StoryDetails,
    pub external: Vec<ExternalLink>,
    pub deleted: bool,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    /// Time of the last write made by the importer.
    pub itime: Option<DateTime<Utc>>,
    /// Time of the last write made by the exporter.
    pub etime: Option<DateTime<Utc>>,
}

impl Story {
    /// Import and export writes stamp `itime`/`etime` with the same instant
    /// they store in `mtime`. Any other `mtime` is a user edit. The reactor
    /// must ignore non-user writes or import and export feed each other.
    pub fn write_origin(&self) -> WriteOrigin {
        if self.itime == Some(self.mtime) {
            WriteOrigin::Import
        } else if self.etime == Some(self.mtime) {
            WriteOrigin::Export
        } else {
            WriteOrigin::User
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskAction {
    ExportIssue,
    #[serde(other)]
    Other,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExportIssue => "export-issue",
            Self::Other => "other",
        }
    }
}

impl FromStr for TaskAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export-issue" => Ok(Self::ExportIssue),
            _ => Ok(Self::Other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIssueRef {
    pub id: i64,
    pub number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<RemoteIssueRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Exporting,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// `None` for tasks in the global scope; exports always belong to a project.
    pub project_id: Option<i64>,
    pub action: TaskAction,
    pub user_id: Option<i64>,
    pub options: TaskOptions,
    pub completion: i32,
    pub failed: bool,
    pub details: TaskDetails,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub etime: Option<DateTime<Utc>>,
}

impl Task {
    pub fn state(&self) -> TaskState {
        if self.failed {
            TaskState::Failed
        } else if self.completion >= 100 {
            TaskState::Succeeded
        } else if self.completion == 0 {
            TaskState::Created
        } else {
            TaskState::Exporting
        }
    }
}

// ── System ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemDetails {
    /// Externally visible base URL the forge calls back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub id: i64,
    pub details: SystemDetails,
    pub mtime: DateTime<Utc>,
}

// ── Forge-side shapes ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub id: i64,
    pub name: String,
    pub path_with_namespace: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: i64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUserRef {
    pub id: Option<i64>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuePayload {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub confidential: bool,
    /// Forge username to act as, when the exporting user has an account there.
    #[serde(skip)]
    pub sudo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    Created,
    Deleted,
}

impl RefAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
        }
    }
}

/// Normalized forge activity. Hook payloads and the activity listing both
/// decode into this shape so the two import paths agree on remote identity.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    Push {
        ref_name: String,
        head: String,
        commit_count: i64,
    },
    Branch {
        ref_name: String,
        head: String,
        action: RefAction,
    },
    Tag {
        ref_name: String,
        head: String,
        action: RefAction,
    },
    Issue {
        id: i64,
        number: i64,
        title: String,
        description: Option<String>,
        state: Option<String>,
        url: Option<String>,
    },
    MergeRequest {
        id: i64,
        number: i64,
        title: String,
        description: Option<String>,
        state: Option<String>,
        url: Option<String>,
    },
    Wiki {
        slug: String,
        title: String,
        url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityItem {
    /// Forge event id; hook payloads carry none.
    pub event_id: Option<i64>,
    pub kind: ActivityKind,
    pub author: Option<RemoteUserRef>,
    pub created_at: DateTime<Utc>,
}
