//! Deliberation threads anchored to document nodes, their annotations,
//! votes and reactions. The engine drives the state machine; this module
//! owns the types, the transition guards and the pure parts of orphan
//! detection and participant roll-up.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::id::{ActorId, AnnotationId, ProposalId, ThreadId};
use crate::rbac::Viewer;
use crate::{rfc3339, Timestamp};

/// Anchor label used when a thread applies to the document as a whole.
pub const UNANCHORED: &str = "¶ Unanchored";

/// Thread classification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    #[default]
    General,
    Legal,
    Commercial,
    Technical,
    Security,
    Query,
    Editorial,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::General => "GENERAL",
            Self::Legal => "LEGAL",
            Self::Commercial => "COMMERCIAL",
            Self::Technical => "TECHNICAL",
            Self::Security => "SECURITY",
            Self::Query => "QUERY",
            Self::Editorial => "EDITORIAL",
        };
        write!(f, "{kind}")
    }
}

impl FromStr for Kind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GENERAL" => Ok(Self::General),
            "LEGAL" => Ok(Self::Legal),
            "COMMERCIAL" => Ok(Self::Commercial),
            "TECHNICAL" => Ok(Self::Technical),
            "SECURITY" => Ok(Self::Security),
            "QUERY" => Ok(Self::Query),
            "EDITORIAL" => Ok(Self::Editorial),
            other => Err(DomainError::validation(
                "type",
                format!("unknown thread type {other:?}"),
            )),
        }
    }
}

/// Who may see a thread or annotation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    #[default]
    Internal,
    External,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "INTERNAL"),
            Self::External => write!(f, "EXTERNAL"),
        }
    }
}

impl FromStr for Visibility {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTERNAL" => Ok(Self::Internal),
            "EXTERNAL" => Ok(Self::External),
            other => Err(DomainError::validation(
                "visibility",
                format!("unknown visibility {other:?}"),
            )),
        }
    }
}

/// Thread lifecycle state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Open,
    Resolved,
    Orphaned,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Orphaned => write!(f, "ORPHANED"),
        }
    }
}

impl FromStr for Status {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "RESOLVED" => Ok(Self::Resolved),
            "ORPHANED" => Ok(Self::Orphaned),
            other => Err(DomainError::validation(
                "status",
                format!("unknown thread status {other:?}"),
            )),
        }
    }
}

/// Outcome recorded when a thread is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Accepted,
    Rejected,
    Deferred,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Deferred => write!(f, "DEFERRED"),
        }
    }
}

impl FromStr for Outcome {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPTED" => Ok(Self::Accepted),
            "REJECTED" => Ok(Self::Rejected),
            "DEFERRED" => Ok(Self::Deferred),
            other => Err(DomainError::validation(
                "outcome",
                format!("unknown outcome {other:?}"),
            )),
        }
    }
}

/// Where in the document a thread applies. Anchors are informational on
/// create; when the anchor node disappears from the document the thread is
/// orphaned on the next save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub label: String,
    #[serde(default)]
    pub node_id: String,
    /// Opaque offsets within the anchor node, owned by the editor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<Value>,
}

impl Anchor {
    pub fn unanchored() -> Self {
        Self {
            label: UNANCHORED.to_owned(),
            node_id: String::new(),
            offsets: None,
        }
    }
}

/// A deliberation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: ThreadId,
    pub proposal: ProposalId,
    #[serde(flatten)]
    pub anchor: Anchor,
    pub body: String,
    pub author: ActorId,
    #[serde(rename = "type")]
    pub kind: Kind,
    pub visibility: Visibility,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_note: Option<String>,
    pub created_at: Timestamp,
}

impl Thread {
    pub fn open(
        proposal: ProposalId,
        anchor: Anchor,
        body: String,
        author: ActorId,
        kind: Kind,
        visibility: Visibility,
        now: Timestamp,
    ) -> Self {
        let anchor = if anchor.label.trim().is_empty() {
            Anchor {
                label: UNANCHORED.to_owned(),
                ..anchor
            }
        } else {
            anchor
        };
        Self {
            id: ThreadId::generate(),
            proposal,
            anchor,
            body,
            author,
            kind,
            visibility,
            status: Status::Open,
            resolved_outcome: None,
            resolved_note: None,
            created_at: now,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == Status::Resolved
    }

    /// Resolve from OPEN or ORPHANED. A rejected resolution requires a
    /// rationale; the resolved note records who and when.
    pub fn resolve(
        &mut self,
        outcome: Outcome,
        rationale: Option<&str>,
        actor: &ActorId,
        now: Timestamp,
    ) -> Result<(), DomainError> {
        if self.is_resolved() {
            return Err(DomainError::not_found(format!("open thread {}", self.id)));
        }
        if outcome == Outcome::Rejected && rationale.map_or(true, |r| r.trim().is_empty()) {
            return Err(DomainError::validation(
                "rationale",
                "a rejected resolution requires a rationale",
            ));
        }
        self.status = Status::Resolved;
        self.resolved_outcome = Some(outcome);
        self.resolved_note = Some(format!("Resolved by {actor} · {}", rfc3339(now)));
        Ok(())
    }

    /// Reopen a resolved thread. The decision log keeps the prior outcome;
    /// the thread itself becomes OPEN with no outcome attached.
    pub fn reopen(&mut self) -> Result<(), DomainError> {
        if !self.is_resolved() {
            return Err(DomainError::conflict(format!(
                "thread {} is not resolved",
                self.id
            )));
        }
        self.status = Status::Open;
        self.resolved_outcome = None;
        self.resolved_note = None;
        Ok(())
    }

    pub fn visible_to(&self, viewer: &Viewer) -> bool {
        !viewer.external || self.visibility == Visibility::External
    }
}

/// A reply within a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: AnnotationId,
    pub proposal: ProposalId,
    pub thread: ThreadId,
    pub author: ActorId,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    pub visibility: Visibility,
    pub created_at: Timestamp,
}

impl Annotation {
    pub fn visible_to(&self, viewer: &Viewer) -> bool {
        !viewer.external || self.visibility == Visibility::External
    }
}

/// A per-(thread, user) vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Up,
    Down,
}

impl Vote {
    pub fn value(&self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Up),
            -1 => Some(Self::Down),
            _ => None,
        }
    }
}

/// Aggregated votes on a thread.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTotals {
    pub up: usize,
    pub down: usize,
}

/// An emoji reaction, at most eight code points.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reaction(String);

impl Reaction {
    pub fn new(emoji: impl ToString) -> Result<Self, DomainError> {
        let emoji = emoji.to_string();
        let count = emoji.chars().count();

        if emoji.is_empty() || count > 8 {
            return Err(DomainError::validation(
                "emoji",
                "a reaction is between one and eight code points",
            ));
        }
        Ok(Self(emoji))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A thread together with its replies and aggregations, assembled for a
/// viewer. Aggregations already respect the viewer's visibility.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadView {
    #[serde(flatten)]
    pub thread: Thread,
    pub annotations: Vec<Annotation>,
    pub votes: VoteTotals,
    pub reactions: BTreeMap<String, usize>,
}

/// Threads that must transition to ORPHANED given the document's current
/// node-id set: OPEN, carrying a non-empty anchor node id that is no longer
/// present. Already-orphaned threads are left alone, which keeps the sweep
/// idempotent.
pub fn sweep(threads: &[Thread], node_ids: &BTreeSet<String>) -> Vec<ThreadId> {
    threads
        .iter()
        .filter(|t| {
            t.status == Status::Open
                && !t.anchor.node_id.is_empty()
                && !node_ids.contains(&t.anchor.node_id)
        })
        .map(|t| t.id.clone())
        .collect()
}

/// Participant roll-up: thread author ∪ annotation authors ∪ resolver,
/// sorted and de-duplicated.
pub fn participants(
    thread: &Thread,
    annotations: &[Annotation],
    resolver: &ActorId,
) -> Vec<String> {
    let mut set = BTreeSet::new();
    set.insert(thread.author.to_string());
    for annotation in annotations {
        set.insert(annotation.author.to_string());
    }
    set.insert(resolver.to_string());
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn thread(status: Status, node_id: &str) -> Thread {
        let mut t = Thread::open(
            ProposalId::generate(),
            Anchor {
                label: "§1".to_owned(),
                node_id: node_id.to_owned(),
                offsets: None,
            },
            "body".to_owned(),
            ActorId::generate(),
            Kind::General,
            Visibility::Internal,
            Timestamp::from_millis(1_700_000_000_000),
        );
        t.status = status;
        t
    }

    #[test]
    fn test_resolve_requires_rationale_for_rejection() {
        let mut t = thread(Status::Open, "n-1");
        let actor = ActorId::generate();

        let err = t
            .resolve(Outcome::Rejected, None, &actor, Timestamp::from_millis(0))
            .unwrap_err();
        assert_eq!(err.code, crate::Code::ValidationError);

        t.resolve(
            Outcome::Rejected,
            Some("duplicate of another thread"),
            &actor,
            Timestamp::from_millis(0),
        )
        .unwrap();
        assert_eq!(t.status, Status::Resolved);
        assert_eq!(t.resolved_outcome, Some(Outcome::Rejected));
    }

    #[test]
    fn test_resolve_twice_is_not_found() {
        let mut t = thread(Status::Open, "n-1");
        let actor = ActorId::generate();
        t.resolve(Outcome::Accepted, None, &actor, Timestamp::from_millis(0))
            .unwrap();

        let err = t
            .resolve(Outcome::Accepted, None, &actor, Timestamp::from_millis(0))
            .unwrap_err();
        assert_eq!(err.code, crate::Code::NotFound);
    }

    #[test]
    fn test_orphaned_thread_can_resolve() {
        let mut t = thread(Status::Orphaned, "n-1");
        t.resolve(
            Outcome::Deferred,
            None,
            &ActorId::generate(),
            Timestamp::from_millis(0),
        )
        .unwrap();
        assert!(t.is_resolved());
    }

    #[test]
    fn test_reopen_clears_resolution() {
        let mut t = thread(Status::Open, "n-1");
        t.resolve(
            Outcome::Accepted,
            None,
            &ActorId::generate(),
            Timestamp::from_millis(0),
        )
        .unwrap();

        t.reopen().unwrap();
        assert_eq!(t.status, Status::Open);
        assert_eq!(t.resolved_outcome, None);
        assert_eq!(t.resolved_note, None);

        // Reopening an open thread conflicts.
        assert!(t.reopen().is_err());
    }

    #[test]
    fn test_resolved_note_format() {
        let mut t = thread(Status::Open, "n-1");
        let actor = ActorId::from_str("carol").unwrap();
        t.resolve(
            Outcome::Accepted,
            None,
            &actor,
            Timestamp::from_millis(1_700_000_000_000),
        )
        .unwrap();

        let note = t.resolved_note.unwrap();
        assert!(note.starts_with("Resolved by carol · 2023-"), "{note}");
        assert!(note.ends_with('Z'), "{note}");
    }

    #[test]
    fn test_sweep() {
        let node_ids = BTreeSet::from(["n-1".to_owned()]);
        let kept = thread(Status::Open, "n-1");
        let gone = thread(Status::Open, "n-2");
        let unanchored = thread(Status::Open, "");
        let resolved = thread(Status::Resolved, "n-2");
        let already = thread(Status::Orphaned, "n-2");

        let threads = vec![
            kept.clone(),
            gone.clone(),
            unanchored,
            resolved,
            already,
        ];
        let orphans = sweep(&threads, &node_ids);

        assert_eq!(orphans, vec![gone.id]);
        // Idempotent: a second sweep over the updated states finds nothing.
        let mut threads = threads;
        for t in &mut threads {
            if orphans.contains(&t.id) {
                t.status = Status::Orphaned;
            }
        }
        assert!(sweep(&threads, &node_ids).is_empty());
    }

    #[test]
    fn test_participants_sorted_and_unique() {
        let mut t = thread(Status::Open, "n-1");
        t.author = ActorId::from_str("bob").unwrap();
        let annotation = Annotation {
            id: AnnotationId::generate(),
            proposal: t.proposal.clone(),
            thread: t.id.clone(),
            author: ActorId::from_str("alice").unwrap(),
            body: "reply".to_owned(),
            kind: Kind::General,
            visibility: Visibility::Internal,
            created_at: Timestamp::from_millis(0),
        };

        let resolver = ActorId::from_str("bob").unwrap();
        assert_eq!(
            participants(&t, &[annotation], &resolver),
            vec!["alice".to_owned(), "bob".to_owned()]
        );
    }

    #[test]
    fn test_reaction_bounds() {
        assert!(Reaction::new("🎉").is_ok());
        assert!(Reaction::new("").is_err());
        assert!(Reaction::new("🎉🎉🎉🎉🎉🎉🎉🎉🎉").is_err());
    }

    #[test]
    fn test_blank_anchor_label_defaults() {
        let t = Thread::open(
            ProposalId::generate(),
            Anchor::default(),
            "body".to_owned(),
            ActorId::generate(),
            Kind::Query,
            Visibility::External,
            Timestamp::from_millis(0),
        );
        assert_eq!(t.anchor.label, UNANCHORED);
    }
}
