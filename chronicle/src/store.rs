//! The relational store seam. One interface covers every persisted entity;
//! implementations may back it with any engine able to enforce the
//! append-only tables (decision log, audit events) below the application.

pub mod sqlite;

use std::collections::BTreeMap;
use std::num::TryFromIntError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approval::{Approval, Role as ApprovalRole};
use crate::audit;
use crate::decision;
use crate::error::DomainError;
use crate::gate::ChangeReview;
use crate::id::{ActorId, DocumentId, ProposalId, SpaceId, ThreadId};
use crate::proposal::{NamedVersion, Proposal, Status as ProposalStatus};
use crate::rbac::Role;
use crate::thread::{Annotation, Reaction, Thread, Vote, VoteTotals};
use crate::Timestamp;

/// A document row. Content lives in the document's repository; this is the
/// tree and status scaffolding around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    /// Human status label, e.g. "Draft", "In review", "Approved".
    pub status: String,
    pub space: SpaceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<DocumentId>,
    pub sort_order: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<ActorId>,
}

/// A space grouping documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
}

/// A participant row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: ActorId,
    pub name: String,
    pub role: Role,
    pub external: bool,
}

impl User {
    pub fn viewer(&self) -> crate::rbac::Viewer {
        crate::rbac::Viewer {
            actor: self.id.clone(),
            role: self.role,
            external: self.external,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// An internal store error.
    #[error("internal error: {0}")]
    Internal(#[from] ::sqlite::Error),
    #[error("invalid number: {0}")]
    Number(#[from] TryFromIntError),
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("space still contains documents")]
    SpaceNotEmpty,
    /// A persisted row that no longer parses.
    #[error("invalid row: {0}")]
    Invalid(String),
}

impl From<Error> for DomainError {
    fn from(err: Error) -> Self {
        match &err {
            Error::NotFound(what) => DomainError::not_found(what),
            Error::SpaceNotEmpty => DomainError::conflict(err),
            _ => DomainError::server(err),
        }
    }
}

/// Everything the engine persists outside the repositories.
pub trait Store {
    // Documents.
    fn insert_document(&self, doc: &Document) -> Result<(), Error>;
    fn document(&self, id: &DocumentId) -> Result<Document, Error>;
    /// Documents of a space, ordered by (sort order, title).
    fn documents_of(&self, space: &SpaceId) -> Result<Vec<Document>, Error>;
    fn set_document_status(
        &self,
        id: &DocumentId,
        label: &str,
        updated_by: &ActorId,
    ) -> Result<(), Error>;

    // Spaces.
    fn insert_space(&self, space: &Space) -> Result<(), Error>;
    fn space(&self, id: &SpaceId) -> Result<Space, Error>;
    /// Fails with [`Error::SpaceNotEmpty`] while documents remain.
    fn delete_space(&self, id: &SpaceId) -> Result<(), Error>;

    // Users.
    fn upsert_user(&self, user: &User) -> Result<(), Error>;
    fn user(&self, id: &ActorId) -> Result<User, Error>;

    // Proposals.
    fn insert_proposal(&self, proposal: &Proposal) -> Result<(), Error>;
    fn proposal(&self, id: &ProposalId) -> Result<Proposal, Error>;
    /// The document's single non-terminal proposal, if any.
    fn active_proposal(&self, document: &DocumentId) -> Result<Option<Proposal>, Error>;
    fn set_proposal_status(&self, id: &ProposalId, status: ProposalStatus) -> Result<(), Error>;

    // Threads.
    fn insert_thread(&self, thread: &Thread) -> Result<(), Error>;
    fn thread(&self, id: &ThreadId) -> Result<Thread, Error>;
    fn threads(&self, proposal: &ProposalId) -> Result<Vec<Thread>, Error>;
    /// Persist status, visibility and resolution fields.
    fn update_thread(&self, thread: &Thread) -> Result<(), Error>;

    // Annotations.
    fn insert_annotation(&self, annotation: &Annotation) -> Result<(), Error>;
    fn annotations(&self, thread: &ThreadId) -> Result<Vec<Annotation>, Error>;

    // Votes and reactions. Toggle-off semantics are the store's: both run
    // in a transaction over the current row.
    fn toggle_vote(
        &self,
        thread: &ThreadId,
        user: &ActorId,
        vote: Vote,
    ) -> Result<Option<Vote>, Error>;
    fn vote_totals(&self, thread: &ThreadId) -> Result<VoteTotals, Error>;
    fn toggle_reaction(
        &self,
        thread: &ThreadId,
        user: &ActorId,
        reaction: &Reaction,
    ) -> Result<bool, Error>;
    fn reactions(&self, thread: &ThreadId) -> Result<BTreeMap<String, usize>, Error>;

    // Approvals.
    fn upsert_approval(
        &self,
        proposal: &ProposalId,
        role: ApprovalRole,
        approved_by: &ActorId,
        approved_at: Timestamp,
    ) -> Result<(), Error>;
    fn approvals(&self, proposal: &ProposalId) -> Result<Vec<Approval>, Error>;

    // Change review states.
    fn upsert_change_review(&self, review: &ChangeReview) -> Result<(), Error>;
    fn change_reviews(&self, proposal: &ProposalId) -> Result<Vec<ChangeReview>, Error>;

    // Named versions.
    fn insert_named_version(&self, version: &NamedVersion) -> Result<(), Error>;
    fn named_versions(&self, proposal: &ProposalId) -> Result<Vec<NamedVersion>, Error>;

    // Decision log (append-only).
    fn append_decision(&self, entry: &decision::NewEntry) -> Result<i64, Error>;
    fn decisions(&self, filter: &decision::Filter) -> Result<Vec<decision::Entry>, Error>;

    // Audit events (append-only).
    fn append_audit(&self, event: &audit::NewEvent) -> Result<i64, Error>;
    /// A document's trail, newest first.
    fn audit_trail(&self, document: &DocumentId, limit: usize) -> Result<Vec<audit::Event>, Error>;

    /// Readiness probe.
    fn ping(&self) -> Result<(), Error>;
}
