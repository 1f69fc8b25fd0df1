//! The per-document repository seam. Each document owns exactly one
//! repository with a single mainline branch; proposal branches are created
//! from mainline and only ever referenced by a merge commit once merged.
//! The engine calls this adapter under a per-document lock; implementations
//! only need to be consistent within one process.

pub mod git;

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content::Content;
use crate::error::{Code, DomainError};
use crate::id::DocumentId;
use crate::Timestamp;

/// The one branch that is never rewound.
pub const MAINLINE: &str = "main";

/// Commit metadata surfaced to callers. Hash strings are opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub timestamp: Timestamp,
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("content codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("branch {0:?} not found")]
    BranchNotFound(String),
    #[error("commit {0:?} not found")]
    CommitNotFound(String),
    #[error("repository for document {0} not found")]
    RepositoryNotFound(DocumentId),
    #[error("tag {0:?} already points at a different commit")]
    TagConflict(String),
}

impl From<Error> for DomainError {
    fn from(err: Error) -> Self {
        match &err {
            Error::BranchNotFound(_)
            | Error::CommitNotFound(_)
            | Error::RepositoryNotFound(_) => DomainError::new(Code::NotFound, err),
            Error::TagConflict(_) => DomainError::conflict(err),
            _ => DomainError::server(err),
        }
    }
}

/// Root of all per-document repositories.
pub trait Storage {
    type Repository: Repository;

    /// Create the repository if absent, writing the baseline commit on
    /// mainline. Idempotent: an existing repository is returned untouched.
    fn ensure(
        &self,
        id: &DocumentId,
        initial: &Content,
        actor: &str,
    ) -> Result<Self::Repository, Error>;

    /// Open an existing repository.
    fn open(&self, id: &DocumentId) -> Result<Self::Repository, Error>;

    fn contains(&self, id: &DocumentId) -> Result<bool, Error>;
}

/// One document's commit graph.
pub trait Repository {
    /// Create `branch` at `from`'s head if absent. Never resets an
    /// existing branch.
    fn ensure_branch(&self, branch: &str, from: &str) -> Result<(), Error>;

    /// Write `content` as a new commit on `branch`. The structural-change
    /// check belongs to the caller; this always commits.
    fn commit(
        &self,
        branch: &str,
        content: &Content,
        author: &str,
        message: &str,
    ) -> Result<CommitInfo, Error>;

    fn head(&self, branch: &str) -> Result<(Content, CommitInfo), Error>;

    /// Commits on `branch`, newest first.
    fn history(&self, branch: &str, limit: usize) -> Result<Vec<CommitInfo>, Error>;

    fn content_at(&self, hash: &str) -> Result<Content, Error>;

    fn commit_at(&self, hash: &str) -> Result<CommitInfo, Error>;

    /// Idempotent for the same (hash, name); a name pointing elsewhere is a
    /// conflict.
    fn tag(&self, hash: &str, name: &str) -> Result<(), Error>;

    /// Fast-forward-equivalent merge: a commit on mainline carrying the
    /// branch head's tree, with both heads as parents. Mainline only ever
    /// advances.
    fn merge_into_main(
        &self,
        branch: &str,
        actor: &str,
        message: &str,
    ) -> Result<CommitInfo, Error>;
}
