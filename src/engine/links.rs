//! Link Registry: building, matching and editing the external links that tie
//! local rows to remote forge objects.
//!
//! An object carries at most one link per server. A link names the remote
//! objects it corresponds to through relations (`project`, `issue`,
//! `commit`, ...) holding a single `id` or a set of `ids`.

use super::models::{ExternalLink, RemoteId, RemoteKey, Server, ServerType};

/// Relation names used inside links.
pub mod relation {
    pub const PROJECT: &str = "project";
    pub const USER: &str = "user";
    pub const ISSUE: &str = "issue";
    /// Project-scoped issue number (`iid`), kept next to `issue` so updates
    /// address the same remote issue.
    pub const ISSUE_NUMBER: &str = "issue_number";
    pub const MERGE_REQUEST: &str = "merge_request";
    pub const COMMIT: &str = "commit";
    pub const WIKI: &str = "wiki";
}

impl ExternalLink {
    pub fn new(server_type: ServerType, server_id: i64) -> Self {
        Self {
            server_type,
            server_id,
            relations: Default::default(),
        }
    }

    pub fn for_server(server: &Server) -> Self {
        Self::new(server.server_type, server.id)
    }

    pub fn with(mut self, relation: &str, id: impl Into<RemoteKey>) -> Self {
        self.relations.insert(
            relation.to_string(),
            RemoteId {
                id: Some(id.into()),
                ids: Vec::new(),
            },
        );
        self
    }

    pub fn with_ids(mut self, relation: &str, ids: Vec<RemoteKey>) -> Self {
        self.relations
            .insert(relation.to_string(), RemoteId { id: None, ids });
        self
    }

    /// Copy of the link without `relation`. Lookups use this to drop
    /// bookkeeping relations that are not part of the remote identity.
    pub fn without(&self, relation: &str) -> Self {
        let mut link = self.clone();
        link.relations.remove(relation);
        link
    }

    pub fn remote_id(&self, relation: &str) -> Option<&RemoteKey> {
        self.relations.get(relation).and_then(|r| r.id.as_ref())
    }

    pub fn remote_number(&self, relation: &str) -> Option<i64> {
        match self.remote_id(relation) {
            Some(RemoteKey::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Exact match on `(type, server_id)` plus every relation declared by
    /// `criteria`. Relations the criteria leave out are not compared.
    pub fn matches(&self, criteria: &ExternalLink) -> bool {
        if self.server_type != criteria.server_type || self.server_id != criteria.server_id {
            return false;
        }
        criteria.relations.iter().all(|(name, wanted)| {
            let Some(have) = self.relations.get(name) else {
                return false;
            };
            if let Some(id) = &wanted.id
                && have.id.as_ref() != Some(id)
            {
                return false;
            }
            wanted.ids.iter().all(|id| have.ids.contains(id))
        })
    }
}

pub fn find_link(links: &[ExternalLink], server_id: i64) -> Option<&ExternalLink> {
    links.iter().find(|link| link.server_id == server_id)
}

pub fn find_matching<'a>(
    links: &'a [ExternalLink],
    criteria: &ExternalLink,
) -> Option<&'a ExternalLink> {
    links.iter().find(|link| link.matches(criteria))
}

pub fn has_match(links: &[ExternalLink], criteria: &ExternalLink) -> bool {
    find_matching(links, criteria).is_some()
}

/// Insert `link`, merging its relations into an existing link for the same
/// server. Returns `true` when `links` changed.
pub fn attach(links: &mut Vec<ExternalLink>, link: ExternalLink) -> bool {
    match links
        .iter_mut()
        .find(|l| l.server_type == link.server_type && l.server_id == link.server_id)
    {
        Some(existing) => {
            let mut changed = false;
            for (name, id) in link.relations {
                if existing.relations.get(&name) != Some(&id) {
                    existing.relations.insert(name, id);
                    changed = true;
                }
            }
            changed
        }
        None => {
            links.push(link);
            true
        }
    }
}

/// Remove the link to `server_id`. Returns `true` when one was removed.
pub fn detach(links: &mut Vec<ExternalLink>, server_id: i64) -> bool {
    let before = links.len();
    links.retain(|link| link.server_id != server_id);
    links.len() != before
}
