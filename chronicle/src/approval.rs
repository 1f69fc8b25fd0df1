//! Role approvals over a declared dependency graph. The graph is closed and
//! initialized in code: `legal` may only approve once both technical roles
//! have.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ActorId, ProposalId};
use crate::Timestamp;

/// A role in the approval chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Security,
    ArchitectureCommittee,
    Legal,
}

impl Role {
    /// Every role in the graph, in evaluation order.
    pub const ALL: [Role; 3] = [Role::Security, Role::ArchitectureCommittee, Role::Legal];

    /// Declared dependencies. A role may only approve once each dependency
    /// is approved.
    pub fn dependencies(&self) -> &'static [Role] {
        match self {
            Self::Security | Self::ArchitectureCommittee => &[],
            Self::Legal => &[Role::Security, Role::ArchitectureCommittee],
        }
    }

    /// Human label used in blocker messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Security => "Security",
            Self::ArchitectureCommittee => "Architecture committee",
            Self::Legal => "Legal",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Security => "security",
            Self::ArchitectureCommittee => "architectureCommittee",
            Self::Legal => "legal",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(Self::Security),
            "architectureCommittee" => Ok(Self::ArchitectureCommittee),
            "legal" => Ok(Self::Legal),
            other => Err(DomainError::validation(
                "role",
                format!("unknown approval role {other:?}"),
            )),
        }
    }
}

/// Approval status of one role on one proposal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    #[default]
    Pending,
    Approved,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
        }
    }
}

impl FromStr for Status {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            other => Err(DomainError::validation(
                "status",
                format!("unknown approval status {other:?}"),
            )),
        }
    }
}

/// One role's approval row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub proposal: ProposalId,
    pub role: Role,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<ActorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<Timestamp>,
}

/// Full snapshot of a proposal's approvals: one entry per role in the
/// graph, pending unless a row says otherwise.
pub fn snapshot(rows: &[Approval]) -> BTreeMap<Role, Status> {
    let mut map: BTreeMap<Role, Status> = Role::ALL.iter().map(|r| (*r, Status::Pending)).collect();
    for row in rows {
        map.insert(row.role, row.status);
    }
    map
}

/// Check a role's dependencies against the current snapshot. Returns the
/// missing dependency roles on failure.
pub fn check(role: Role, approvals: &BTreeMap<Role, Status>) -> Result<(), Vec<Role>> {
    let blockers: Vec<Role> = role
        .dependencies()
        .iter()
        .filter(|dep| approvals.get(dep) != Some(&Status::Approved))
        .copied()
        .collect();

    if blockers.is_empty() {
        Ok(())
    } else {
        Err(blockers)
    }
}
