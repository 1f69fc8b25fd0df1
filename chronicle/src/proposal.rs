//! Proposal lifecycle types. A proposal is a named working copy of a
//! document on its own branch; at most one non-terminal proposal exists per
//! document, and a merged proposal's branch stays behind as history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ActorId, DocumentId, ProposalId};
use crate::repo;
use crate::Timestamp;

/// Proposal lifecycle state. `Merged` and `Rejected` are terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Draft,
    UnderReview,
    Merged,
    Rejected,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Rejected)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Draft => "DRAFT",
            Self::UnderReview => "UNDER_REVIEW",
            Self::Merged => "MERGED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{status}")
    }
}

impl FromStr for Status {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "UNDER_REVIEW" => Ok(Self::UnderReview),
            "MERGED" => Ok(Self::Merged),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(DomainError::validation(
                "status",
                format!("unknown proposal status {other:?}"),
            )),
        }
    }
}

/// A proposal branched off a document's mainline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: ProposalId,
    pub document: DocumentId,
    pub title: String,
    pub status: Status,
    pub branch: String,
    pub target_branch: String,
    pub created_by: ActorId,
    pub created_at: Timestamp,
}

impl Proposal {
    pub fn draft(
        document: DocumentId,
        title: String,
        created_by: ActorId,
        now: Timestamp,
    ) -> Self {
        let id = ProposalId::generate();
        let branch = branch_name(&id);
        Self {
            id,
            document,
            title,
            status: Status::Draft,
            branch,
            target_branch: repo::MAINLINE.to_owned(),
            created_by,
            created_at: now,
        }
    }

    /// A proposal is active while it has not reached a terminal state.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// The proposal's working branch. Keyed on the proposal, so sequential
/// proposals on one document never share a branch and each is created
/// fresh from mainline.
pub fn branch_name(proposal: &ProposalId) -> String {
    format!("proposal-{proposal}")
}

/// A human-labeled tag on a commit of the proposal branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedVersion {
    pub proposal: ProposalId,
    pub label: String,
    pub commit: String,
    pub tag: String,
    pub created_by: ActorId,
    pub created_at: Timestamp,
}

/// Slug of a named-version label: lowercased, runs of non-alphanumerics
/// collapsed to single dashes, at most 48 characters, never empty.
pub fn slug(label: &str) -> String {
    let mut slug = String::new();
    let mut dashed = true;

    for c in label.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dashed = false;
        } else if !dashed {
            slug.push('-');
            dashed = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(48);
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("version");
    }
    slug
}

/// Deterministic tag name: `nv-{slug}-{12-hex prefix of the commit}`.
pub fn tag_name(label: &str, commit: &str) -> String {
    let prefix: String = commit.chars().take(12).collect();
    format!("nv-{}-{prefix}", slug(label))
}
