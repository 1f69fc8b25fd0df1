//! The append-only decision log. Every transition into RESOLVED and every
//! merge appends exactly one entry keyed to the commit hash that witnessed
//! the decision. Entries are never updated or deleted; the store enforces
//! that below the engine.

use serde::{Deserialize, Serialize};

use crate::id::{ActorId, DocumentId, ProposalId};
use crate::thread::Outcome;
use crate::Timestamp;

/// Thread-column value used for merge decisions.
pub const MERGE: &str = "merge";

/// One decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Store-assigned sequence number.
    pub id: i64,
    pub document: DocumentId,
    pub proposal: ProposalId,
    /// The thread id, or [`MERGE`] for a merge decision.
    pub thread: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    pub decided_by: ActorId,
    /// Head of the proposal branch at resolution time, or the merge commit.
    pub commit: String,
    pub participants: Vec<String>,
    /// Rendered as an RFC3339 instant in list responses.
    #[serde(with = "crate::serde_ext::rfc3339")]
    pub decided_at: Timestamp,
}

/// An entry about to be appended; the store assigns the sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub document: DocumentId,
    pub proposal: ProposalId,
    pub thread: String,
    pub outcome: Outcome,
    pub rationale: Option<String>,
    pub decided_by: ActorId,
    pub commit: String,
    pub participants: Vec<String>,
    pub decided_at: Timestamp,
}

/// Listing filters.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Free-text match against rationale and author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn proposal(proposal: ProposalId) -> Self {
        Self {
            proposal: Some(proposal),
            ..Self::default()
        }
    }
}
