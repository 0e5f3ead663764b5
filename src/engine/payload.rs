//! Decoding of GitLab hook payloads and activity-feed events.
//!
//! Both sources normalize into `ActivityItem`, so a push seen through a hook
//! and the same push seen later by a catch-up scan map to one story.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::models::{ActivityItem, ActivityKind, RefAction, RemoteUserRef};

const NULL_SHA: &str = "0000000000000000000000000000000000000000";

/// What a system hook asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemHookAction {
    ImportRepositories,
    ImportUsers,
    Ignore,
}

pub fn classify_system_hook(payload: &Value) -> SystemHookAction {
    match payload.get("event_name").and_then(Value::as_str) {
        Some(
            "project_create" | "project_destroy" | "project_rename" | "project_transfer"
            | "project_update",
        ) => SystemHookAction::ImportRepositories,
        Some("user_add_to_team" | "user_remove_from_team" | "user_create" | "user_destroy") => {
            SystemHookAction::ImportUsers
        }
        _ => SystemHookAction::Ignore,
    }
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    // Hook payloads use "2024-01-05 10:11:12 UTC".
    NaiveDateTime::parse_from_str(raw.trim_end_matches(" UTC"), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

fn short_ref(full: &str) -> &str {
    full.strip_prefix("refs/heads/")
        .or_else(|| full.strip_prefix("refs/tags/"))
        .unwrap_or(full)
}

fn is_null_sha(sha: &str) -> bool {
    sha.is_empty() || sha == NULL_SHA
}

// ── Project hooks ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HookUser {
    id: Option<i64>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushHook {
    before: String,
    after: String,
    #[serde(rename = "ref")]
    git_ref: String,
    user_id: Option<i64>,
    user_username: Option<String>,
    total_commits_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TicketAttributes {
    id: i64,
    iid: i64,
    title: String,
    description: Option<String>,
    state: Option<String>,
    url: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TicketHook {
    user: Option<HookUser>,
    object_attributes: TicketAttributes,
}

#[derive(Debug, Deserialize)]
struct WikiAttributes {
    slug: String,
    title: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WikiHook {
    user: Option<HookUser>,
    object_attributes: WikiAttributes,
}

fn ref_activity(
    before: &str,
    after: &str,
    git_ref: &str,
    commit_count: i64,
    tag: bool,
) -> ActivityKind {
    let ref_name = short_ref(git_ref).to_string();
    let (action, head) = if is_null_sha(before) {
        (Some(RefAction::Created), after.to_string())
    } else if is_null_sha(after) {
        (Some(RefAction::Deleted), before.to_string())
    } else {
        (None, after.to_string())
    };
    match (tag, action) {
        (true, action) => ActivityKind::Tag {
            ref_name,
            head,
            action: action.unwrap_or(RefAction::Created),
        },
        (false, Some(action)) => ActivityKind::Branch { ref_name, head, action },
        (false, None) => ActivityKind::Push {
            ref_name,
            head,
            commit_count,
        },
    }
}

/// Decode a project hook body. `None` means the payload is not something the
/// fast path handles.
pub fn decode_project_hook(payload: &Value) -> Option<ActivityItem> {
    let kind = payload.get("object_kind").and_then(Value::as_str)?;
    match kind {
        "push" | "tag_push" => {
            let hook: PushHook = serde_json::from_value(payload.clone()).ok()?;
            let activity = ref_activity(
                &hook.before,
                &hook.after,
                &hook.git_ref,
                hook.total_commits_count.unwrap_or(0),
                kind == "tag_push",
            );
            Some(ActivityItem {
                event_id: None,
                kind: activity,
                author: Some(RemoteUserRef {
                    id: hook.user_id,
                    username: hook.user_username,
                }),
                created_at: Utc::now(),
            })
        }
        "issue" | "merge_request" => {
            let hook: TicketHook = serde_json::from_value(payload.clone()).ok()?;
            let attrs = hook.object_attributes;
            let created_at = parse_time(attrs.updated_at.as_deref())
                .or_else(|| parse_time(attrs.created_at.as_deref()))
                .unwrap_or_else(Utc::now);
            let activity = if kind == "issue" {
                ActivityKind::Issue {
                    id: attrs.id,
                    number: attrs.iid,
                    title: attrs.title,
                    description: attrs.description,
                    state: attrs.state,
                    url: attrs.url,
                }
            } else {
                ActivityKind::MergeRequest {
                    id: attrs.id,
                    number: attrs.iid,
                    title: attrs.title,
                    description: attrs.description,
                    state: attrs.state,
                    url: attrs.url,
                }
            };
            Some(ActivityItem {
                event_id: None,
                kind: activity,
                author: hook.user.map(|u| RemoteUserRef { id: u.id, username: u.username }),
                created_at,
            })
        }
        "wiki_page" => {
            let hook: WikiHook = serde_json::from_value(payload.clone()).ok()?;
            let attrs = hook.object_attributes;
            Some(ActivityItem {
                event_id: None,
                kind: ActivityKind::Wiki {
                    slug: attrs.slug,
                    title: attrs.title,
                    url: attrs.url,
                },
                author: hook.user.map(|u| RemoteUserRef { id: u.id, username: u.username }),
                created_at: Utc::now(),
            })
        }
        _ => None,
    }
}

// ── Activity feed (`GET /projects/:id/events`) ────────────────────────

#[derive(Debug, Deserialize)]
struct PushData {
    commit_count: Option<i64>,
    action: Option<String>,
    ref_type: Option<String>,
    commit_from: Option<String>,
    commit_to: Option<String>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WikiPageData {
    slug: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventAuthor {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: i64,
    action_name: Option<String>,
    target_id: Option<i64>,
    target_iid: Option<i64>,
    target_type: Option<String>,
    target_title: Option<String>,
    author_id: Option<i64>,
    author: Option<EventAuthor>,
    created_at: Option<String>,
    push_data: Option<PushData>,
    wiki_page: Option<WikiPageData>,
}

fn ticket_state(action_name: Option<&str>) -> Option<String> {
    match action_name? {
        "opened" => Some("opened".to_string()),
        "closed" => Some("closed".to_string()),
        "reopened" => Some("reopened".to_string()),
        "merged" | "accepted" => Some("merged".to_string()),
        _ => None,
    }
}

fn event_kind(event: RawEvent) -> Option<(ActivityKind, RawEventMeta)> {
    let meta = RawEventMeta {
        id: event.id,
        author: RemoteUserRef {
            id: event.author_id,
            username: event.author.and_then(|a| a.username),
        },
        created_at: parse_time(event.created_at.as_deref()),
    };

    if let Some(push) = event.push_data {
        let git_ref = push.git_ref?;
        let tag = push.ref_type.as_deref() == Some("tag");
        let from = push.commit_from.unwrap_or_default();
        let to = push.commit_to.unwrap_or_default();
        let kind = match push.action.as_deref() {
            Some("created") => ref_activity(NULL_SHA, &to, &git_ref, 0, tag),
            Some("removed") => ref_activity(&from, NULL_SHA, &git_ref, 0, tag),
            _ => ref_activity(&from, &to, &git_ref, push.commit_count.unwrap_or(0), tag),
        };
        return Some((kind, meta));
    }

    if let Some(wiki) = event.wiki_page {
        let title = wiki.title.or(event.target_title).unwrap_or_else(|| wiki.slug.clone());
        return Some((
            ActivityKind::Wiki {
                slug: wiki.slug,
                title,
                url: None,
            },
            meta,
        ));
    }

    let state = ticket_state(event.action_name.as_deref());
    let id = event.target_id?;
    let number = event.target_iid?;
    let title = event.target_title.unwrap_or_default();
    let kind = match event.target_type.as_deref()? {
        "Issue" => ActivityKind::Issue {
            id,
            number,
            title,
            description: None,
            state,
            url: None,
        },
        "MergeRequest" => ActivityKind::MergeRequest {
            id,
            number,
            title,
            description: None,
            state,
            url: None,
        },
        _ => return None,
    };
    Some((kind, meta))
}

struct RawEventMeta {
    id: i64,
    author: RemoteUserRef,
    created_at: Option<DateTime<Utc>>,
}

/// Normalize one activity-feed event. Events with no synchronized
/// counterpart (comments, membership changes, ...) yield `None`.
pub fn decode_event(raw: &Value) -> Option<ActivityItem> {
    let event: RawEvent = serde_json::from_value(raw.clone()).ok()?;
    let (kind, meta) = event_kind(event)?;
    Some(ActivityItem {
        event_id: Some(meta.id),
        kind,
        author: Some(meta.author),
        created_at: meta.created_at.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_system_hooks() {
        assert_eq!(
            classify_system_hook(&json!({"event_name": "project_rename"})),
            SystemHookAction::ImportRepositories
        );
        assert_eq!(
            classify_system_hook(&json!({"event_name": "user_add_to_team"})),
            SystemHookAction::ImportUsers
        );
        assert_eq!(
            classify_system_hook(&json!({"event_name": "key_create"})),
            SystemHookAction::Ignore
        );
        assert_eq!(classify_system_hook(&json!({})), SystemHookAction::Ignore);
    }

    #[test]
    fn test_decode_push_hook() {
        let item = decode_project_hook(&json!({
            "object_kind": "push",
            "before": "95790bf891e76fee5e1747ab589903a6a1f80f22",
            "after": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7",
            "ref": "refs/heads/master",
            "user_id": 4,
            "user_username": "jsmith",
            "total_commits_count": 4
        }))
        .unwrap();
        assert_eq!(item.event_id, None);
        assert_eq!(
            item.kind,
            ActivityKind::Push {
                ref_name: "master".into(),
                head: "da1560886d4f094c3e6c9ef40349f7d38b5d27d7".into(),
                commit_count: 4,
            }
        );
        assert_eq!(item.author.unwrap().username.as_deref(), Some("jsmith"));
    }

    #[test]
    fn test_decode_branch_create_and_delete() {
        let created = decode_project_hook(&json!({
            "object_kind": "push", "before": NULL_SHA, "after": "abc", "ref": "refs/heads/feature"
        }))
        .unwrap();
        assert_eq!(
            created.kind,
            ActivityKind::Branch { ref_name: "feature".into(), head: "abc".into(), action: RefAction::Created }
        );

        let deleted = decode_project_hook(&json!({
            "object_kind": "push", "before": "abc", "after": NULL_SHA, "ref": "refs/heads/feature"
        }))
        .unwrap();
        assert_eq!(
            deleted.kind,
            ActivityKind::Branch { ref_name: "feature".into(), head: "abc".into(), action: RefAction::Deleted }
        );
    }

    #[test]
    fn test_decode_tag_push() {
        let item = decode_project_hook(&json!({
            "object_kind": "tag_push", "before": NULL_SHA, "after": "82b3d5", "ref": "refs/tags/v1.0.0"
        }))
        .unwrap();
        assert_eq!(
            item.kind,
            ActivityKind::Tag { ref_name: "v1.0.0".into(), head: "82b3d5".into(), action: RefAction::Created }
        );
    }

    #[test]
    fn test_decode_issue_hook() {
        let item = decode_project_hook(&json!({
            "object_kind": "issue",
            "user": {"id": 1, "username": "root"},
            "object_attributes": {
                "id": 301, "iid": 23, "title": "New API: create/update/delete file",
                "description": "Create new API", "state": "opened",
                "url": "http://example.com/diaspora/issues/23",
                "created_at": "2013-12-03T17:15:43Z",
                "updated_at": "2013-12-03 17:15:43 UTC"
            }
        }))
        .unwrap();
        match item.kind {
            ActivityKind::Issue { id, number, state, .. } => {
                assert_eq!(id, 301);
                assert_eq!(number, 23);
                assert_eq!(state.as_deref(), Some("opened"));
            }
            other => panic!("Expected Issue, got {:?}", other),
        }
        assert_eq!(item.created_at.to_rfc3339(), "2013-12-03T17:15:43+00:00");
        assert_eq!(item.author.unwrap().id, Some(1));
    }

    #[test]
    fn test_decode_unhandled_hooks() {
        assert!(decode_project_hook(&json!({"object_kind": "note"})).is_none());
        assert!(decode_project_hook(&json!({"object_kind": "pipeline"})).is_none());
        assert!(decode_project_hook(&json!({"no_kind": true})).is_none());
        assert!(decode_project_hook(&json!({"object_kind": "issue"})).is_none(), "malformed");
    }

    #[test]
    fn test_decode_push_event_matches_hook_identity() {
        let event = decode_event(&json!({
            "id": 1001,
            "action_name": "pushed to",
            "author_id": 4,
            "author": {"username": "jsmith"},
            "created_at": "2024-03-01T10:00:00.000Z",
            "push_data": {
                "commit_count": 2, "action": "pushed", "ref_type": "branch",
                "commit_from": "aaa", "commit_to": "bbb", "ref": "master"
            }
        }))
        .unwrap();
        let hook = decode_project_hook(&json!({
            "object_kind": "push", "before": "aaa", "after": "bbb", "ref": "refs/heads/master",
            "total_commits_count": 2
        }))
        .unwrap();
        assert_eq!(event.event_id, Some(1001));
        assert_eq!(event.kind, hook.kind);
    }

    #[test]
    fn test_decode_issue_and_mr_events() {
        let issue = decode_event(&json!({
            "id": 5, "action_name": "closed", "target_id": 160, "target_iid": 7,
            "target_type": "Issue", "target_title": "Broken", "author_id": 2,
            "created_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();
        match issue.kind {
            ActivityKind::Issue { id, number, state, .. } => {
                assert_eq!((id, number), (160, 7));
                assert_eq!(state.as_deref(), Some("closed"));
            }
            other => panic!("Expected Issue, got {:?}", other),
        }

        let mr = decode_event(&json!({
            "id": 6, "action_name": "accepted", "target_id": 90, "target_iid": 3,
            "target_type": "MergeRequest", "target_title": "Feature"
        }))
        .unwrap();
        assert!(matches!(mr.kind, ActivityKind::MergeRequest { id: 90, number: 3, .. }));
    }

    #[test]
    fn test_decode_wiki_event() {
        let item = decode_event(&json!({
            "id": 9, "action_name": "updated", "target_type": "WikiPage::Meta",
            "target_title": "Home", "wiki_page": {"slug": "home", "title": "Home"}
        }))
        .unwrap();
        assert_eq!(
            item.kind,
            ActivityKind::Wiki { slug: "home".into(), title: "Home".into(), url: None }
        );
    }

    #[test]
    fn test_decode_event_skips_comments() {
        assert!(decode_event(&json!({
            "id": 10, "action_name": "commented on", "target_id": 1, "target_iid": 1,
            "target_type": "Note"
        }))
        .is_none());
        assert!(decode_event(&json!({"id": 11, "action_name": "joined"})).is_none());
    }
}
