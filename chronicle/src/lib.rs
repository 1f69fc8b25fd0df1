#![cfg_attr(not(test), warn(clippy::unwrap_used))]
//! Chronicle is a governed document engine. Each document owns an immutable
//! git-backed history; proposals branch off the mainline, deliberation
//! happens in node-anchored threads, approvals form a dependency graph, and
//! a merge gate decides when an accepted proposal may become the new
//! mainline. Every resolution and merge appends to an append-only decision
//! log.

pub mod approval;
pub mod audit;
pub mod content;
pub mod decision;
pub mod engine;
pub mod error;
pub mod flush;
pub mod gate;
pub mod id;
#[cfg(feature = "logger")]
pub mod logger;
pub mod options;
pub mod proposal;
pub mod rbac;
pub mod repo;
pub mod serde_ext;
pub mod sql;
pub mod store;
pub mod thread;

pub use engine::Chronicle;
pub use error::{Code, DomainError};

pub mod prelude {
    use super::*;

    pub use content::Content;
    pub use engine::{Chronicle, Workspace};
    pub use error::{Code, DomainError};
    pub use gate::Policy;
    pub use id::{ActorId, DocumentId, ProposalId, ThreadId};
    pub use rbac::{Role, Viewer};
    pub use repo::{Repository, Storage};
    pub use store::Store;
}

/// Timestamp used for all engine operations.
pub type Timestamp = localtime::LocalTime;

/// Render a timestamp as an RFC3339 instant in UTC.
pub fn rfc3339(time: Timestamp) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(time.as_millis() as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}
