//! The merge gate. Aggregates pending approvals, unresolved threads and
//! per-change review states against a policy and produces a deterministic
//! blocker list. Merge is allowed iff the list is empty.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{Role, Status as ApprovalStatus};
use crate::error::DomainError;
use crate::id::{ActorId, ChangeId, ProposalId, ThreadId};
use crate::thread::{Status as ThreadStatus, Thread};
use crate::Timestamp;

/// Gate policy. Both switches default to strict.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub allow_merge_with_deferred_changes: bool,
    #[serde(default)]
    pub ignore_format_only_changes_for_gate: bool,
}

/// Review state of one change within a proposal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Deferred,
    /// Tagged as formatting-only; the gate may skip it under policy.
    FormatOnly,
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Deferred => "deferred",
            Self::FormatOnly => "format_only",
        };
        write!(f, "{state}")
    }
}

impl FromStr for ReviewState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "deferred" => Ok(Self::Deferred),
            "format_only" => Ok(Self::FormatOnly),
            other => Err(DomainError::validation(
                "reviewState",
                format!("unknown review state {other:?}"),
            )),
        }
    }
}

/// Recorded review of one change between two refs of a proposal branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReview {
    pub proposal: ProposalId,
    pub change_id: ChangeId,
    pub from_ref: String,
    pub to_ref: String,
    pub state: ReviewState,
    /// Node the change applies to, when the editor anchored it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<ActorId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<Timestamp>,
}

/// Where the UI should take the caller to act on a blocker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    Approvals,
    Discussions,
    History,
}

/// Link tuple attached to every blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub tab: Tab,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<ChangeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Link {
    fn approvals(role: Role) -> Self {
        Self {
            tab: Tab::Approvals,
            role: Some(role),
            thread_id: None,
            change_id: None,
            node_id: None,
        }
    }

    fn discussion(thread: ThreadId, node_id: &str) -> Self {
        Self {
            tab: Tab::Discussions,
            role: None,
            thread_id: Some(thread),
            change_id: None,
            node_id: (!node_id.is_empty()).then(|| node_id.to_owned()),
        }
    }

    fn history(change: ChangeId, node_id: Option<String>) -> Self {
        Self {
            tab: Tab::History,
            role: None,
            thread_id: None,
            change_id: Some(change),
            node_id,
        }
    }
}

/// One reason a merge cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub label: String,
    #[serde(flatten)]
    pub link: Link,
}

/// The gate's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub pending_approvals: usize,
    pub open_threads: usize,
    pub change_blockers: usize,
    pub blockers: Vec<Blocker>,
    pub policy: Policy,
}

impl Evaluation {
    pub fn allowed(&self) -> bool {
        self.pending_approvals == 0 && self.open_threads == 0 && self.change_blockers == 0
    }

    /// The details payload attached to `MERGE_GATE_BLOCKED`.
    pub fn details(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Evaluate the gate. Blockers come out in a stable order: roles in graph
/// order, then threads by id, then changes by change id.
pub fn evaluate(
    approvals: &BTreeMap<Role, ApprovalStatus>,
    threads: &[Thread],
    changes: &[ChangeReview],
    policy: Policy,
) -> Evaluation {
    let mut blockers = Vec::new();

    let mut pending_approvals = 0;
    for role in Role::ALL {
        if approvals.get(&role) != Some(&ApprovalStatus::Approved) {
            pending_approvals += 1;
            blockers.push(Blocker {
                label: format!("{} approval is pending", role.label()),
                link: Link::approvals(role),
            });
        }
    }

    let mut unresolved: Vec<&Thread> = threads
        .iter()
        .filter(|t| t.status != ThreadStatus::Resolved)
        .collect();
    unresolved.sort_by(|a, b| a.id.cmp(&b.id));

    let open_threads = unresolved.len();
    for thread in unresolved {
        let state = match thread.status {
            ThreadStatus::Orphaned => "orphaned",
            _ => "unresolved",
        };
        blockers.push(Blocker {
            label: format!("Discussion \"{}\" is {state}", thread.anchor.label),
            link: Link::discussion(thread.id.clone(), &thread.anchor.node_id),
        });
    }

    let mut reviews: Vec<&ChangeReview> = changes.iter().collect();
    reviews.sort_by(|a, b| a.change_id.cmp(&b.change_id));

    let mut change_blockers = 0;
    for review in reviews {
        let skip = match review.state {
            ReviewState::Accepted => true,
            ReviewState::Deferred => policy.allow_merge_with_deferred_changes,
            ReviewState::FormatOnly => policy.ignore_format_only_changes_for_gate,
            ReviewState::Pending | ReviewState::Rejected => false,
        };
        if skip {
            continue;
        }
        change_blockers += 1;
        blockers.push(Blocker {
            label: format!("Change {} is {}", review.change_id, review.state),
            link: Link::history(review.change_id.clone(), review.node_id.clone()),
        });
    }

    Evaluation {
        pending_approvals,
        open_threads,
        change_blockers,
        blockers,
        policy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval;
    use crate::id::ProposalId;
    use crate::thread::{Anchor, Kind, Visibility};
    use pretty_assertions::assert_eq;

    fn open_thread(node_id: &str) -> Thread {
        Thread::open(
            ProposalId::generate(),
            Anchor {
                label: "§2".to_owned(),
                node_id: node_id.to_owned(),
                offsets: None,
            },
            "body".to_owned(),
            crate::id::ActorId::generate(),
            Kind::General,
            Visibility::Internal,
            Timestamp::from_millis(0),
        )
    }

    fn review(id: &str, state: ReviewState) -> ChangeReview {
        ChangeReview {
            proposal: ProposalId::generate(),
            change_id: id.parse().unwrap(),
            from_ref: "a".to_owned(),
            to_ref: "b".to_owned(),
            state,
            node_id: None,
            rejected_rationale: None,
            reviewer: None,
            reviewed_at: None,
        }
    }

    fn all_approved() -> BTreeMap<Role, ApprovalStatus> {
        Role::ALL
            .iter()
            .map(|r| (*r, ApprovalStatus::Approved))
            .collect()
    }

    #[test]
    fn test_empty_gate_allows() {
        let eval = evaluate(&all_approved(), &[], &[], Policy::default());
        assert!(eval.allowed());
        assert!(eval.blockers.is_empty());
    }

    #[test]
    fn test_pending_approvals_block() {
        let approvals = approval::snapshot(&[]);
        let eval = evaluate(&approvals, &[], &[], Policy::default());

        assert_eq!(eval.pending_approvals, 3);
        assert_eq!(eval.blockers[0].label, "Security approval is pending");
        assert_eq!(
            eval.blockers[1].label,
            "Architecture committee approval is pending"
        );
        assert_eq!(eval.blockers[2].label, "Legal approval is pending");
        assert!(!eval.allowed());
    }

    #[test]
    fn test_open_and_orphaned_threads_block() {
        let mut orphaned = open_thread("n-2");
        orphaned.status = ThreadStatus::Orphaned;
        let mut resolved = open_thread("n-3");
        resolved
            .resolve(
                crate::thread::Outcome::Accepted,
                None,
                &crate::id::ActorId::generate(),
                Timestamp::from_millis(0),
            )
            .unwrap();

        let threads = vec![open_thread("n-1"), orphaned, resolved];
        let eval = evaluate(&all_approved(), &threads, &[], Policy::default());

        assert_eq!(eval.open_threads, 2);
        assert_eq!(eval.change_blockers, 0);
    }

    #[test]
    fn test_policy_matrix_for_changes() {
        let changes = vec![
            review("c-1", ReviewState::Accepted),
            review("c-2", ReviewState::Deferred),
            review("c-3", ReviewState::FormatOnly),
            review("c-4", ReviewState::Rejected),
            review("c-5", ReviewState::Pending),
        ];

        let strict = evaluate(&all_approved(), &[], &changes, Policy::default());
        assert_eq!(strict.change_blockers, 4);

        let lenient = evaluate(
            &all_approved(),
            &[],
            &changes,
            Policy {
                allow_merge_with_deferred_changes: true,
                ignore_format_only_changes_for_gate: true,
            },
        );
        assert_eq!(lenient.change_blockers, 2);
        assert_eq!(lenient.blockers[0].label, "Change c-4 is rejected");
        assert_eq!(lenient.blockers[1].label, "Change c-5 is pending");
    }

    #[test]
    fn test_monotonicity() {
        // Resolving a thread or approving a role never adds a blocker.
        let mut approvals = approval::snapshot(&[]);
        let mut threads = vec![open_thread("n-1")];
        let before = evaluate(&approvals, &threads, &[], Policy::default());

        approvals.insert(Role::Security, ApprovalStatus::Approved);
        threads[0]
            .resolve(
                crate::thread::Outcome::Accepted,
                None,
                &crate::id::ActorId::generate(),
                Timestamp::from_millis(0),
            )
            .unwrap();
        let after = evaluate(&approvals, &threads, &[], Policy::default());

        assert!(after.blockers.len() < before.blockers.len());
        for blocker in &after.blockers {
            assert!(before.blockers.contains(blocker));
        }
    }

    #[test]
    fn test_details_payload_shape() {
        let eval = evaluate(&approval::snapshot(&[]), &[], &[], Policy::default());
        let details = eval.details();

        assert_eq!(details["pendingApprovals"], 3);
        assert_eq!(details["blockers"][0]["tab"], "approvals");
        assert_eq!(details["blockers"][0]["role"], "security");
    }
}
