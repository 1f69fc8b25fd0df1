//! Role/action matrix and the viewer boundary. Role checks guard every
//! write path; the external flag additionally restricts what a viewer may
//! see or reference, orthogonally to their role.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::ActorId;

/// Access role of a caller. Unknown role strings normalize to `Viewer`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Viewer,
    Commenter,
    Editor,
    Admin,
}

impl Role {
    /// Parse a stored role label. This never fails: anything unrecognized
    /// degrades to the least-privileged role.
    pub fn normalize(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "admin" => Self::Admin,
            "editor" => Self::Editor,
            "commenter" => Self::Commenter,
            _ => Self::Viewer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Viewer => "viewer",
            Self::Commenter => "commenter",
            Self::Editor => "editor",
            Self::Admin => "admin",
        };
        write!(f, "{name}")
    }
}

/// Governance actions gated by the role matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Comment,
    Write,
    Approve,
    Admin,
}

/// The role/action matrix.
pub fn can(role: Role, action: Action) -> bool {
    match action {
        Action::Read => true,
        Action::Comment => role >= Role::Commenter,
        Action::Write | Action::Approve => role >= Role::Editor,
        Action::Admin => role == Role::Admin,
    }
}

/// The caller of an engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub actor: ActorId,
    pub role: Role,
    /// External participants see only EXTERNAL artifacts, may create only
    /// EXTERNAL threads, and may never change visibility.
    pub external: bool,
}

impl Viewer {
    pub fn internal(actor: ActorId, role: Role) -> Self {
        Self {
            actor,
            role,
            external: false,
        }
    }

    pub fn external(actor: ActorId, role: Role) -> Self {
        Self {
            actor,
            role,
            external: true,
        }
    }

    /// Enforce the matrix at the entry of a write path.
    pub fn require(&self, action: Action) -> Result<(), DomainError> {
        if can(self.role, action) {
            Ok(())
        } else {
            Err(DomainError::forbidden(format!(
                "role '{}' may not perform '{action:?}'",
                self.role
            )))
        }
    }
}
