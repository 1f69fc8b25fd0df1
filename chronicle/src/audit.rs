//! Audit trail of governance actions. Like the decision log this is
//! append-only, but it records every state change, not just decisions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::id::{ActorId, DocumentId, ProposalId};
use crate::Timestamp;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    DocumentCreated,
    ProposalCreated,
    ProposalSubmitted,
    ProposalMerged,
    ThreadCreated,
    ThreadResolved,
    ThreadReopened,
    ThreadOrphaned,
    ThreadVisibilityChanged,
    AnnotationAdded,
    ApprovalGranted,
    ChangeReviewRecorded,
    NamedVersionCreated,
    FlushCommitted,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentCreated => "document_created",
            Self::ProposalCreated => "proposal_created",
            Self::ProposalSubmitted => "proposal_submitted",
            Self::ProposalMerged => "proposal_merged",
            Self::ThreadCreated => "thread_created",
            Self::ThreadResolved => "thread_resolved",
            Self::ThreadReopened => "thread_reopened",
            Self::ThreadOrphaned => "thread_orphaned",
            Self::ThreadVisibilityChanged => "thread_visibility_changed",
            Self::AnnotationAdded => "annotation_added",
            Self::ApprovalGranted => "approval_granted",
            Self::ChangeReviewRecorded => "change_review_recorded",
            Self::NamedVersionCreated => "named_version_created",
            Self::FlushCommitted => "flush_committed",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Kind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document_created" => Ok(Self::DocumentCreated),
            "proposal_created" => Ok(Self::ProposalCreated),
            "proposal_submitted" => Ok(Self::ProposalSubmitted),
            "proposal_merged" => Ok(Self::ProposalMerged),
            "thread_created" => Ok(Self::ThreadCreated),
            "thread_resolved" => Ok(Self::ThreadResolved),
            "thread_reopened" => Ok(Self::ThreadReopened),
            "thread_orphaned" => Ok(Self::ThreadOrphaned),
            "thread_visibility_changed" => Ok(Self::ThreadVisibilityChanged),
            "annotation_added" => Ok(Self::AnnotationAdded),
            "approval_granted" => Ok(Self::ApprovalGranted),
            "change_review_recorded" => Ok(Self::ChangeReviewRecorded),
            "named_version_created" => Ok(Self::NamedVersionCreated),
            "flush_committed" => Ok(Self::FlushCommitted),
            other => Err(DomainError::validation(
                "eventType",
                format!("unknown audit event type {other:?}"),
            )),
        }
    }
}

/// One governance action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Store-assigned sequence number.
    pub id: i64,
    pub event_type: Kind,
    pub actor: ActorId,
    pub document: DocumentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalId>,
    /// Thread or change the event refers to, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub payload: Value,
    pub created_at: Timestamp,
}

/// Builder used by the engine; the store assigns `id` on append.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: Kind,
    pub actor: ActorId,
    pub document: DocumentId,
    pub proposal: Option<ProposalId>,
    pub subject: Option<String>,
    pub payload: Value,
    pub created_at: Timestamp,
}

impl NewEvent {
    pub fn new(
        event_type: Kind,
        actor: &ActorId,
        document: &DocumentId,
        now: Timestamp,
    ) -> Self {
        Self {
            event_type,
            actor: actor.clone(),
            document: document.clone(),
            proposal: None,
            subject: None,
            payload: Value::Null,
            created_at: now,
        }
    }

    pub fn proposal(mut self, proposal: &ProposalId) -> Self {
        self.proposal = Some(proposal.clone());
        self
    }

    pub fn subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}
