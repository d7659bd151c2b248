//! Invalidation planning.
//!
//! Maps a settled mutation to the set of key prefixes that must be treated
//! as stale. The planner is pure rule application; the caller expands each
//! prefix against resident entries and refetches the subscribed matches.
//!
//! The planner runs after success and after rollback alike. A rolled-back
//! mutation restores local values, but the true server state of affected
//! entries is unknown and must be refetched rather than trusted.

use crate::key::CacheKey;
use crate::kind::ResourceKind;

/// Operation class of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

/// Describes one settled mutation for invalidation planning.
#[derive(Debug, Clone)]
pub struct MutationDescriptor {
    pub kind: ResourceKind,
    pub op: MutationOp,
    /// Identifier of the mutated resource, when the server assigned one.
    pub id: Option<String>,
    /// Identifier of a parent resource logically containing this one, such
    /// as the forum post a reply belongs to.
    pub parent_id: Option<String>,
}

impl MutationDescriptor {
    pub fn create(kind: ResourceKind) -> Self {
        Self {
            kind,
            op: MutationOp::Create,
            id: None,
            parent_id: None,
        }
    }

    /// A create nested under a parent resource.
    pub fn create_child(kind: ResourceKind, parent_id: impl Into<String>) -> Self {
        Self {
            kind,
            op: MutationOp::Create,
            id: None,
            parent_id: Some(parent_id.into()),
        }
    }

    pub fn update(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            op: MutationOp::Update,
            id: Some(id.into()),
            parent_id: None,
        }
    }

    pub fn delete(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            op: MutationOp::Delete,
            id: Some(id.into()),
            parent_id: None,
        }
    }
}

/// Key prefixes stale after the described mutation.
pub fn plan(descriptor: &MutationDescriptor) -> Vec<CacheKey> {
    let mut prefixes = Vec::new();
    let kind = descriptor.kind;

    match descriptor.op {
        MutationOp::Create => {
            // List membership and ordering may have changed in ways an
            // optimistic patch cannot predict (server-side sort, offsets).
            push_unique(&mut prefixes, CacheKey::list(kind));
        }
        MutationOp::Update | MutationOp::Delete => {
            if let Some(id) = &descriptor.id {
                push_unique(&mut prefixes, CacheKey::detail(kind, id.clone()));
            }
            push_unique(&mut prefixes, CacheKey::list(kind));
        }
    }

    if let Some(parent_id) = &descriptor.parent_id {
        // The child shows up in counts rendered on the parent views.
        push_unique(&mut prefixes, CacheKey::detail(kind, parent_id.clone()));
        push_unique(&mut prefixes, CacheKey::list(kind));
    }

    match kind {
        ResourceKind::Project => {
            // Project totals and roster aggregates move with any project
            // mutation, collaborator counts included.
            push_unique(&mut prefixes, CacheKey::stats(ResourceKind::Project));
            push_unique(&mut prefixes, CacheKey::stats(ResourceKind::Member));
        }
        ResourceKind::Member => {
            push_unique(&mut prefixes, CacheKey::stats(ResourceKind::Member));
        }
        _ => {}
    }

    prefixes
}

fn push_unique(prefixes: &mut Vec<CacheKey>, key: CacheKey) {
    if !prefixes.contains(&key) {
        prefixes.push(key);
    }
}
