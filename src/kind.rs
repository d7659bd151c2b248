//! Resource kind definitions.
//!
//! The platform exposes five resource collections over its REST API. Every
//! cache key, policy table, and transport route is parameterized by kind.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A remote resource collection served by the platform API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Open bounties and their claim state.
    Bounty,
    /// Project proposals and collaborator rosters.
    Project,
    /// Forum posts and their reply threads.
    ForumPost,
    /// Member profiles.
    Member,
    /// Meeting notes.
    MeetingNote,
}

impl ResourceKind {
    /// All kinds, in a stable order. Used by pollers and policy lookups.
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Bounty,
        ResourceKind::Project,
        ResourceKind::ForumPost,
        ResourceKind::Member,
        ResourceKind::MeetingNote,
    ];

    /// API route segment for this collection.
    pub fn route(&self) -> &'static str {
        match self {
            Self::Bounty => "bounties",
            Self::Project => "projects",
            Self::ForumPost => "forum/posts",
            Self::Member => "members",
            Self::MeetingNote => "meeting-notes",
        }
    }

    /// Stable name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bounty => "bounty",
            Self::Project => "project",
            Self::ForumPost => "forum-post",
            Self::Member => "member",
            Self::MeetingNote => "meeting-note",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
