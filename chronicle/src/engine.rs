//! The engine value. All governance operations enter here: RBAC first, then
//! the visibility boundary, then orchestration over the store and the
//! per-document repositories. Repository mutations and their decision-log
//! entries happen inside a per-document critical section, so a reader of
//! the log never sees an entry without the corresponding state change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::approval::{self, Approval};
use crate::audit;
use crate::content::{self, Content};
use crate::decision;
use crate::error::DomainError;
use crate::flush;
use crate::gate::{self, ChangeReview, Evaluation, Policy, ReviewState};
use crate::id::{ActorId, AnnotationId, DocumentId, ProposalId, SpaceId, ThreadId};
use crate::options::Options;
use crate::proposal::{self, NamedVersion, Proposal};
use crate::rbac::{Action, Viewer};
use crate::repo::{self, CommitInfo, Repository as _, MAINLINE};
use crate::store::{self, Document, Space, Store, User};
use crate::thread::{
    self, Anchor, Annotation, Kind, Outcome, Reaction, Thread, ThreadView, Visibility, Vote,
    VoteTotals,
};
use crate::Timestamp;

/// Document status labels surfaced in listings.
pub const STATUS_DRAFT: &str = "Draft";
pub const STATUS_IN_REVIEW: &str = "In review";
pub const STATUS_APPROVED: &str = "Approved";

/// Post-write search-index hook. Failures are logged and dropped; the
/// primary write always wins.
pub trait Index {
    fn index(
        &self,
        document: &DocumentId,
        content: &Content,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;
}

/// Default hook that indexes nothing.
pub struct NoIndex;

impl Index for NoIndex {
    fn index(
        &self,
        _document: &DocumentId,
        _content: &Content,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(())
    }
}

/// Keyed mutex table with lazy entry creation. Writers to the same
/// document serialize; documents progress independently.
#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn entry(&self, id: &DocumentId) -> Arc<Mutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(id.clone()).or_default().clone()
    }
}

/// Everything a viewer needs to work on a document: the document, its
/// active proposal, the branch head, and the deliberation state filtered
/// for the viewer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub document: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Proposal>,
    pub content: Content,
    pub head: CommitInfo,
    pub threads: Vec<ThreadView>,
    pub approvals: Vec<Approval>,
    pub named_versions: Vec<NamedVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<Evaluation>,
}

/// Result of a workspace save.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    /// `None` when the content was structurally unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitInfo>,
    pub workspace: Workspace,
}

/// Result of a successful merge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub merge_commit: CommitInfo,
    pub evaluation: Evaluation,
    pub workspace: Workspace,
}

/// Input for document creation.
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub id: Option<DocumentId>,
    pub title: String,
    pub subtitle: String,
    pub space: SpaceId,
    pub parent: Option<DocumentId>,
    pub sort_order: i64,
    /// Baseline content; derived from title/subtitle when absent.
    pub initial: Option<Content>,
}

/// Input for thread creation.
#[derive(Debug, Clone, Default)]
pub struct NewThread {
    pub anchor: Option<Anchor>,
    pub body: String,
    pub kind: Kind,
    pub visibility: Option<Visibility>,
}

/// The governance engine. Generic over the store and git seams so tests
/// can substitute in-memory implementations.
pub struct Chronicle<S, G: repo::Storage> {
    store: S,
    git: G,
    locks: LockTable,
    sessions: flush::Sessions,
    policy: Policy,
    lock_timeout: Duration,
    index: Box<dyn Index + Send + Sync>,
}

impl Chronicle<store::sqlite::Store, repo::git::Storage> {
    /// Open an engine against on-disk state.
    pub fn open(options: &Options) -> Result<Self, DomainError> {
        let store = store::sqlite::Store::open(&options.store)?;
        let git = repo::git::Storage::open(&options.repositories)?;

        Ok(Self::new(
            store,
            git,
            options.policy,
            options.lock_timeout(),
            options.session_ttl(),
        ))
    }

    /// An engine over an in-memory store and a temporary repository root.
    /// The returned directory must outlive the engine.
    pub fn memory() -> Result<(Self, tempfile::TempDir), DomainError> {
        let tmp = tempfile::tempdir().map_err(DomainError::server)?;
        let store = store::sqlite::Store::memory()?;
        let git = repo::git::Storage::open(tmp.path().join("repositories"))?;
        let engine = Self::new(
            store,
            git,
            Policy::default(),
            Duration::from_millis(500),
            flush::DEFAULT_TTL,
        );

        Ok((engine, tmp))
    }
}

impl<S: Store, G: repo::Storage> Chronicle<S, G> {
    pub fn new(
        store: S,
        git: G,
        policy: Policy,
        lock_timeout: Duration,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            git,
            locks: LockTable::default(),
            sessions: flush::Sessions::new(session_ttl),
            policy,
            lock_timeout,
            index: Box::new(NoIndex),
        }
    }

    /// Replace the search-index hook.
    pub fn with_index(mut self, index: Box<dyn Index + Send + Sync>) -> Self {
        self.index = index;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Readiness probe. Callers wrap this in their own deadline.
    pub fn ready(&self) -> Result<(), DomainError> {
        self.store.ping()?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Spaces and users
    ////////////////////////////////////////////////////////////////////////

    pub fn create_space(&self, viewer: &Viewer, space: &Space) -> Result<(), DomainError> {
        viewer.require(Action::Admin)?;
        self.store.insert_space(space)?;
        Ok(())
    }

    /// Deleting a space requires it to be empty.
    pub fn delete_space(&self, viewer: &Viewer, id: &SpaceId) -> Result<(), DomainError> {
        viewer.require(Action::Admin)?;
        self.store.delete_space(id)?;
        Ok(())
    }

    pub fn register_user(&self, viewer: &Viewer, user: &User) -> Result<(), DomainError> {
        viewer.require(Action::Admin)?;
        self.store.upsert_user(user)?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Documents
    ////////////////////////////////////////////////////////////////////////

    pub fn create_document(
        &self,
        viewer: &Viewer,
        new: NewDocument,
    ) -> Result<Document, DomainError> {
        viewer.require(Action::Write)?;
        if new.title.trim().is_empty() {
            return Err(DomainError::validation("title", "title cannot be blank"));
        }
        self.store.space(&new.space)?;

        let id = new.id.unwrap_or_else(DocumentId::generate);
        let initial = new.initial.unwrap_or_else(|| Content {
            title: new.title.clone(),
            subtitle: new.subtitle.clone(),
            ..Content::default()
        });
        let document = Document {
            id: id.clone(),
            title: new.title,
            subtitle: new.subtitle,
            status: STATUS_DRAFT.to_owned(),
            space: new.space,
            parent: new.parent,
            sort_order: new.sort_order,
            updated_by: Some(viewer.actor.clone()),
        };

        self.with_doc_lock(&id, || {
            self.git.ensure(&id, &initial, viewer.actor.as_str())?;
            self.store.insert_document(&document)?;
            self.store.append_audit(&audit::NewEvent::new(
                audit::Kind::DocumentCreated,
                &viewer.actor,
                &id,
                Timestamp::now(),
            ))?;
            Ok(())
        })?;
        log::info!(target: "engine", "Document {id} created by {}", viewer.actor);

        Ok(document)
    }

    pub fn document(&self, viewer: &Viewer, id: &DocumentId) -> Result<Document, DomainError> {
        viewer.require(Action::Read)?;
        Ok(self.store.document(id)?)
    }

    pub fn space_documents(
        &self,
        viewer: &Viewer,
        space: &SpaceId,
    ) -> Result<Vec<Document>, DomainError> {
        viewer.require(Action::Read)?;
        Ok(self.store.documents_of(space)?)
    }

    ////////////////////////////////////////////////////////////////////////
    // Workspace and proposal lifecycle
    ////////////////////////////////////////////////////////////////////////

    /// The viewer's workspace snapshot of a document.
    pub fn workspace(&self, viewer: &Viewer, id: &DocumentId) -> Result<Workspace, DomainError> {
        viewer.require(Action::Read)?;
        let document = self.store.document(id)?;
        let proposal = self.store.active_proposal(id)?;

        self.assemble_workspace(viewer, document, proposal)
    }

    /// Explicitly open a proposal on a document.
    pub fn create_proposal(
        &self,
        viewer: &Viewer,
        id: &DocumentId,
        title: &str,
    ) -> Result<Workspace, DomainError> {
        viewer.require(Action::Write)?;
        if title.trim().is_empty() {
            return Err(DomainError::validation("title", "title cannot be blank"));
        }
        let document = self.store.document(id)?;

        let proposal = self.with_doc_lock(id, || {
            if let Some(active) = self.store.active_proposal(id)? {
                return Err(DomainError::conflict(format!(
                    "document already has an active proposal {}",
                    active.id
                )));
            }
            self.open_proposal(&document, title.to_owned(), &viewer.actor)
        })?;

        self.assemble_workspace(viewer, document, Some(proposal))
    }

    /// Save the viewer's working copy onto the proposal branch, creating
    /// the proposal if none is active. Commits only on structural change.
    pub fn save_workspace(
        &self,
        viewer: &Viewer,
        id: &DocumentId,
        incoming: &Content,
    ) -> Result<SaveOutcome, DomainError> {
        viewer.require(Action::Write)?;
        let document = self.store.document(id)?;

        let (proposal, commit) = self.with_doc_lock(id, || {
            let proposal = match self.store.active_proposal(id)? {
                Some(active) => active,
                None => self.open_proposal(&document, document.title.clone(), &viewer.actor)?,
            };
            let commit =
                self.commit_on(&proposal, incoming, &viewer.actor, "Save workspace")?;
            Ok((proposal, commit))
        })?;

        let document = self.store.document(id)?;
        let workspace = self.assemble_workspace(viewer, document, Some(proposal))?;

        Ok(SaveOutcome { commit, workspace })
    }

    /// DRAFT → UNDER_REVIEW.
    pub fn submit_proposal(
        &self,
        viewer: &Viewer,
        id: &ProposalId,
    ) -> Result<Proposal, DomainError> {
        viewer.require(Action::Write)?;
        let mut proposal = self.store.proposal(id)?;

        self.with_doc_lock(&proposal.document.clone(), || {
            if proposal.status != proposal::Status::Draft {
                return Err(DomainError::conflict(format!(
                    "proposal {id} is not a draft"
                )));
            }
            proposal.status = proposal::Status::UnderReview;
            self.store.set_proposal_status(id, proposal.status)?;
            self.store.set_document_status(
                &proposal.document,
                STATUS_IN_REVIEW,
                &viewer.actor,
            )?;
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::ProposalSubmitted,
                    &viewer.actor,
                    &proposal.document,
                    Timestamp::now(),
                )
                .proposal(id),
            )?;
            Ok(())
        })?;

        Ok(proposal)
    }

    /// Grant a role approval, honoring the dependency graph.
    pub fn approve(
        &self,
        viewer: &Viewer,
        id: &ProposalId,
        role: &str,
    ) -> Result<Vec<Approval>, DomainError> {
        viewer.require(Action::Approve)?;
        if viewer.external {
            return Err(DomainError::forbidden(
                "external viewers may not grant approvals",
            ));
        }
        let role: approval::Role = role.parse()?;
        let proposal = self.store.proposal(id)?;
        if !proposal.is_active() {
            return Err(DomainError::conflict(format!(
                "proposal {id} is no longer active"
            )));
        }

        self.with_doc_lock(&proposal.document, || {
            let snapshot = approval::snapshot(&self.store.approvals(id)?);
            approval::check(role, &snapshot).map_err(|blockers| {
                log::info!(
                    target: "approval",
                    "Approval of {role} on {id} blocked by {blockers:?}"
                );
                DomainError::approval_order_blocked(
                    blockers.iter().map(|r| r.to_string()).collect(),
                )
            })?;
            self.store
                .upsert_approval(id, role, &viewer.actor, Timestamp::now())?;
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::ApprovalGranted,
                    &viewer.actor,
                    &proposal.document,
                    Timestamp::now(),
                )
                .proposal(id)
                .payload(json!({ "role": role })),
            )?;
            Ok(())
        })?;

        self.approval_rows(id)
    }

    /// Tag the current head of the proposal branch with a named version.
    pub fn save_named_version(
        &self,
        viewer: &Viewer,
        id: &ProposalId,
        label: &str,
    ) -> Result<NamedVersion, DomainError> {
        viewer.require(Action::Write)?;
        if label.trim().is_empty() {
            return Err(DomainError::validation("label", "label cannot be blank"));
        }
        let proposal = self.store.proposal(id)?;

        self.with_doc_lock(&proposal.document, || {
            let repo = self.git.open(&proposal.document)?;
            let (_, head) = repo.head(&proposal.branch)?;
            let tag = proposal::tag_name(label, &head.hash);
            repo.tag(&head.hash, &tag)?;

            let version = NamedVersion {
                proposal: id.clone(),
                label: label.trim().to_owned(),
                commit: head.hash,
                tag,
                created_by: viewer.actor.clone(),
                created_at: Timestamp::now(),
            };
            self.store.insert_named_version(&version)?;
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::NamedVersionCreated,
                    &viewer.actor,
                    &proposal.document,
                    Timestamp::now(),
                )
                .proposal(id)
                .subject(&version.tag),
            )?;
            Ok(version)
        })
    }

    /// Record one change's review state.
    pub fn record_change_review(
        &self,
        viewer: &Viewer,
        mut review: ChangeReview,
    ) -> Result<ChangeReview, DomainError> {
        viewer.require(Action::Approve)?;
        if viewer.external {
            return Err(DomainError::forbidden(
                "external viewers may not review changes",
            ));
        }
        if review.state == ReviewState::Rejected
            && review
                .rejected_rationale
                .as_deref()
                .map_or(true, |r| r.trim().is_empty())
        {
            return Err(DomainError::validation(
                "rejectedRationale",
                "a rejected change requires a rationale",
            ));
        }
        let proposal = self.store.proposal(&review.proposal)?;
        review.reviewer = Some(viewer.actor.clone());
        review.reviewed_at = Some(Timestamp::now());

        self.store.upsert_change_review(&review)?;
        self.store.append_audit(
            &audit::NewEvent::new(
                audit::Kind::ChangeReviewRecorded,
                &viewer.actor,
                &proposal.document,
                Timestamp::now(),
            )
            .proposal(&review.proposal)
            .subject(&review.change_id)
            .payload(json!({ "state": review.state })),
        )?;

        Ok(review)
    }

    /// Merge an accepted proposal into mainline. The gate is evaluated
    /// against the supplied change snapshot, or the recorded one.
    pub fn merge_proposal(
        &self,
        viewer: &Viewer,
        id: &ProposalId,
        policy: Option<Policy>,
        changes: Option<Vec<ChangeReview>>,
    ) -> Result<MergeOutcome, DomainError> {
        viewer.require(Action::Write)?;
        if viewer.external {
            return Err(DomainError::forbidden("external viewers may not merge"));
        }
        let mut proposal = self.store.proposal(id)?;
        let policy = policy.unwrap_or(self.policy);

        let (merge, evaluation) = self.with_doc_lock(&proposal.document.clone(), || {
            if proposal.status != proposal::Status::UnderReview {
                return Err(DomainError::conflict(format!(
                    "proposal {id} is not under review"
                )));
            }
            let approvals = approval::snapshot(&self.store.approvals(id)?);
            let threads = self.store.threads(id)?;
            let reviews = match &changes {
                Some(supplied) => supplied.clone(),
                None => self.store.change_reviews(id)?,
            };
            let evaluation = gate::evaluate(&approvals, &threads, &reviews, policy);
            if !evaluation.allowed() {
                log::info!(
                    target: "gate",
                    "Merge of {id} blocked: {} approvals pending, {} open threads, {} change blockers",
                    evaluation.pending_approvals,
                    evaluation.open_threads,
                    evaluation.change_blockers,
                );
                return Err(DomainError::merge_gate_blocked(evaluation.details()));
            }

            let repo = self.git.open(&proposal.document)?;
            let message = format!("Merge '{}' by {}", proposal.branch, viewer.actor);
            let merge = repo.merge_into_main(&proposal.branch, viewer.actor.as_str(), &message)?;

            proposal.status = proposal::Status::Merged;
            self.store.set_proposal_status(id, proposal.status)?;
            self.store
                .set_document_status(&proposal.document, STATUS_APPROVED, &viewer.actor)?;
            self.store.append_decision(&decision::NewEntry {
                document: proposal.document.clone(),
                proposal: id.clone(),
                thread: decision::MERGE.to_owned(),
                outcome: Outcome::Accepted,
                rationale: Some("Proposal merged after merge gate passed".to_owned()),
                decided_by: viewer.actor.clone(),
                commit: merge.hash.clone(),
                participants: vec![viewer.actor.to_string()],
                decided_at: Timestamp::now(),
            })?;
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::ProposalMerged,
                    &viewer.actor,
                    &proposal.document,
                    Timestamp::now(),
                )
                .proposal(id)
                .payload(json!({ "commit": merge.hash })),
            )?;

            let (content, _) = repo.head(MAINLINE)?;
            self.reindex(&proposal.document, &content);

            Ok((merge, evaluation))
        })?;

        let document = self.store.document(&proposal.document)?;
        let workspace = self.assemble_workspace(viewer, document, Some(proposal))?;

        Ok(MergeOutcome {
            merge_commit: merge,
            evaluation,
            workspace,
        })
    }

    ////////////////////////////////////////////////////////////////////////
    // Threads
    ////////////////////////////////////////////////////////////////////////

    pub fn create_thread(
        &self,
        viewer: &Viewer,
        proposal: &ProposalId,
        new: NewThread,
    ) -> Result<ThreadView, DomainError> {
        viewer.require(Action::Comment)?;
        if new.body.trim().is_empty() {
            return Err(DomainError::validation("text", "thread text cannot be blank"));
        }
        let visibility = self.write_visibility(viewer, new.visibility, Visibility::Internal)?;
        let proposal = self.store.proposal(proposal)?;
        if !proposal.is_active() {
            return Err(DomainError::conflict(format!(
                "proposal {} is no longer active",
                proposal.id
            )));
        }

        let thread = Thread::open(
            proposal.id.clone(),
            new.anchor.unwrap_or_else(Anchor::unanchored),
            new.body,
            viewer.actor.clone(),
            new.kind,
            visibility,
            Timestamp::now(),
        );
        self.store.insert_thread(&thread)?;
        self.store.append_audit(
            &audit::NewEvent::new(
                audit::Kind::ThreadCreated,
                &viewer.actor,
                &proposal.document,
                Timestamp::now(),
            )
            .proposal(&proposal.id)
            .subject(&thread.id)
            .payload(json!({ "nodeId": thread.anchor.node_id })),
        )?;

        self.thread_view(viewer, thread)
    }

    /// Reply to a thread.
    pub fn reply(
        &self,
        viewer: &Viewer,
        thread: &ThreadId,
        body: &str,
        kind: Option<Kind>,
        visibility: Option<Visibility>,
    ) -> Result<Annotation, DomainError> {
        viewer.require(Action::Comment)?;
        if body.trim().is_empty() {
            return Err(DomainError::validation("body", "reply cannot be blank"));
        }
        let thread = self.thread_for(viewer, thread)?;
        let visibility = self.write_visibility(viewer, visibility, thread.visibility)?;

        let annotation = Annotation {
            id: AnnotationId::generate(),
            proposal: thread.proposal.clone(),
            thread: thread.id.clone(),
            author: viewer.actor.clone(),
            body: body.to_owned(),
            kind: kind.unwrap_or(thread.kind),
            visibility,
            created_at: Timestamp::now(),
        };
        self.store.insert_annotation(&annotation)?;

        let proposal = self.store.proposal(&thread.proposal)?;
        self.store.append_audit(
            &audit::NewEvent::new(
                audit::Kind::AnnotationAdded,
                &viewer.actor,
                &proposal.document,
                Timestamp::now(),
            )
            .proposal(&thread.proposal)
            .subject(&thread.id),
        )?;

        Ok(annotation)
    }

    /// Resolve an open or orphaned thread, appending the decision record in
    /// the same critical section.
    pub fn resolve_thread(
        &self,
        viewer: &Viewer,
        id: &ThreadId,
        outcome: Outcome,
        rationale: Option<&str>,
    ) -> Result<Thread, DomainError> {
        viewer.require(Action::Write)?;
        let mut thread = self.thread_for(viewer, id)?;
        let proposal = self.store.proposal(&thread.proposal)?;

        self.with_doc_lock(&proposal.document, || {
            let now = Timestamp::now();
            thread.resolve(outcome, rationale, &viewer.actor, now)?;
            self.store.update_thread(&thread)?;

            let repo = self.git.open(&proposal.document)?;
            let (_, head) = repo.head(&proposal.branch)?;
            let annotations = self.store.annotations(&thread.id)?;
            let participants = thread::participants(&thread, &annotations, &viewer.actor);

            self.store.append_decision(&decision::NewEntry {
                document: proposal.document.clone(),
                proposal: proposal.id.clone(),
                thread: thread.id.to_string(),
                outcome,
                rationale: rationale.map(ToOwned::to_owned),
                decided_by: viewer.actor.clone(),
                commit: head.hash,
                participants,
                decided_at: now,
            })?;
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::ThreadResolved,
                    &viewer.actor,
                    &proposal.document,
                    now,
                )
                .proposal(&proposal.id)
                .subject(&thread.id)
                .payload(json!({ "outcome": outcome })),
            )?;
            Ok(())
        })?;
        log::info!(target: "thread", "Thread {id} resolved as {outcome} by {}", viewer.actor);

        Ok(thread)
    }

    /// Reopen a resolved thread. Internal viewers only.
    pub fn reopen_thread(&self, viewer: &Viewer, id: &ThreadId) -> Result<Thread, DomainError> {
        viewer.require(Action::Write)?;
        let mut thread = self.thread_for(viewer, id)?;
        if viewer.external {
            return Err(DomainError::forbidden(
                "external viewers may not reopen threads",
            ));
        }
        thread.reopen()?;
        self.store.update_thread(&thread)?;

        let proposal = self.store.proposal(&thread.proposal)?;
        self.store.append_audit(
            &audit::NewEvent::new(
                audit::Kind::ThreadReopened,
                &viewer.actor,
                &proposal.document,
                Timestamp::now(),
            )
            .proposal(&thread.proposal)
            .subject(&thread.id),
        )?;

        Ok(thread)
    }

    /// Change a thread's visibility. Internal viewers only.
    pub fn set_thread_visibility(
        &self,
        viewer: &Viewer,
        id: &ThreadId,
        visibility: Visibility,
    ) -> Result<Thread, DomainError> {
        viewer.require(Action::Write)?;
        if viewer.external {
            return Err(DomainError::forbidden(
                "external viewers may not change visibility",
            ));
        }
        let mut thread = self.thread_for(viewer, id)?;
        let previous = thread.visibility;
        if previous != visibility {
            thread.visibility = visibility;
            self.store.update_thread(&thread)?;

            let proposal = self.store.proposal(&thread.proposal)?;
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::ThreadVisibilityChanged,
                    &viewer.actor,
                    &proposal.document,
                    Timestamp::now(),
                )
                .proposal(&thread.proposal)
                .subject(&thread.id)
                .payload(json!({ "from": previous, "to": visibility })),
            )?;
        }
        Ok(thread)
    }

    /// Cast or toggle a vote.
    pub fn vote(
        &self,
        viewer: &Viewer,
        id: &ThreadId,
        vote: Vote,
    ) -> Result<VoteTotals, DomainError> {
        viewer.require(Action::Comment)?;
        let thread = self.thread_for(viewer, id)?;
        self.store.toggle_vote(&thread.id, &viewer.actor, vote)?;

        Ok(self.store.vote_totals(&thread.id)?)
    }

    /// Toggle an emoji reaction.
    pub fn react(
        &self,
        viewer: &Viewer,
        id: &ThreadId,
        emoji: &str,
    ) -> Result<std::collections::BTreeMap<String, usize>, DomainError> {
        viewer.require(Action::Comment)?;
        let reaction = Reaction::new(emoji)?;
        let thread = self.thread_for(viewer, id)?;
        self.store.toggle_reaction(&thread.id, &viewer.actor, &reaction)?;

        Ok(self.store.reactions(&thread.id)?)
    }

    /// The proposal's threads, filtered for the viewer.
    pub fn threads(
        &self,
        viewer: &Viewer,
        proposal: &ProposalId,
    ) -> Result<Vec<ThreadView>, DomainError> {
        viewer.require(Action::Read)?;
        self.thread_views(viewer, proposal)
    }

    ////////////////////////////////////////////////////////////////////////
    // History, decisions, audit
    ////////////////////////////////////////////////////////////////////////

    pub fn history(
        &self,
        viewer: &Viewer,
        id: &DocumentId,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitInfo>, DomainError> {
        viewer.require(Action::Read)?;
        let repo = self.git.open(id)?;
        Ok(repo.history(branch.unwrap_or(MAINLINE), limit)?)
    }

    pub fn content_at(
        &self,
        viewer: &Viewer,
        id: &DocumentId,
        hash: &str,
    ) -> Result<Content, DomainError> {
        viewer.require(Action::Read)?;
        let repo = self.git.open(id)?;
        Ok(repo.content_at(hash)?)
    }

    /// Decision-log listing. Internal viewers only: entries reference
    /// internal threads.
    pub fn decisions(
        &self,
        viewer: &Viewer,
        filter: &decision::Filter,
    ) -> Result<Vec<decision::Entry>, DomainError> {
        viewer.require(Action::Read)?;
        if viewer.external {
            return Err(DomainError::forbidden(
                "the decision log is internal",
            ));
        }
        Ok(self.store.decisions(filter)?)
    }

    /// A document's audit trail, newest first. Internal viewers only.
    pub fn audit_trail(
        &self,
        viewer: &Viewer,
        id: &DocumentId,
        limit: usize,
    ) -> Result<Vec<audit::Event>, DomainError> {
        viewer.require(Action::Read)?;
        if viewer.external {
            return Err(DomainError::forbidden("the audit trail is internal"));
        }
        Ok(self.store.audit_trail(id, limit)?)
    }

    ////////////////////////////////////////////////////////////////////////
    // Flush intake
    ////////////////////////////////////////////////////////////////////////

    /// Fold a sync session's final snapshot into the proposal branch.
    /// Idempotent per session id within the TTL window.
    pub fn flush(&self, req: &flush::Request) -> Result<flush::Response, DomainError> {
        if req.session_id.trim().is_empty() {
            return Err(DomainError::validation("sessionId", "sessionId is required"));
        }
        let now = Timestamp::now();
        if let Some(cached) = self.sessions.get(&req.session_id, now) {
            log::debug!(target: "flush", "Replaying cached response for session {}", req.session_id);
            return Ok(cached);
        }
        let document = self.store.document(&req.document_id)?;
        let actor = req
            .actor
            .clone()
            .unwrap_or_else(|| "sync-gateway".parse().expect("static id is valid"));

        let response = match &req.snapshot {
            None => flush::Response {
                ok: true,
                session_id: req.session_id.clone(),
                document_id: req.document_id.clone(),
                proposal_id: req.proposal_id.clone(),
                flush_commit: None,
                update_count: req.update_count,
            },
            Some(snapshot) => self.with_doc_lock(&req.document_id, || {
                let proposal = match &req.proposal_id {
                    Some(id) => {
                        let proposal = self.store.proposal(id)?;
                        if proposal.document != req.document_id {
                            return Err(DomainError::not_found("proposal"));
                        }
                        if !proposal.is_active() {
                            return Err(DomainError::conflict(format!(
                                "proposal {id} is no longer active"
                            )));
                        }
                        proposal
                    }
                    None => match self.store.active_proposal(&req.document_id)? {
                        Some(active) => active,
                        None => self.open_proposal(&document, document.title.clone(), &actor)?,
                    },
                };
                let message = format!("Sync session flush ({} updates)", req.update_count);
                let commit = self.commit_on(&proposal, snapshot, &actor, &message)?;

                if let Some(commit) = &commit {
                    self.store.append_audit(
                        &audit::NewEvent::new(
                            audit::Kind::FlushCommitted,
                            &actor,
                            &req.document_id,
                            Timestamp::now(),
                        )
                        .proposal(&proposal.id)
                        .subject(&req.session_id)
                        .payload(json!({
                            "commit": commit.hash,
                            "updateCount": req.update_count,
                        })),
                    )?;
                }

                Ok(flush::Response {
                    ok: true,
                    session_id: req.session_id.clone(),
                    document_id: req.document_id.clone(),
                    proposal_id: Some(proposal.id),
                    flush_commit: commit.map(|c| c.hash),
                    update_count: req.update_count,
                })
            })?,
        };
        self.sessions.put(response.clone(), now);

        Ok(response)
    }

    ////////////////////////////////////////////////////////////////////////
    // Internals
    ////////////////////////////////////////////////////////////////////////

    /// Run `f` holding the document's lock. A lock held past the timeout
    /// yields a retryable conflict.
    fn with_doc_lock<T>(
        &self,
        id: &DocumentId,
        f: impl FnOnce() -> Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        let entry = self.locks.entry(id);
        let deadline = Instant::now() + self.lock_timeout;
        let _guard = loop {
            match entry.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        log::warn!(target: "engine", "Lock on document {id} timed out");
                        return Err(DomainError::conflict(
                            "document is locked by another writer, retry",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        };
        f()
    }

    /// Create a DRAFT proposal with its branch. Caller holds the lock.
    fn open_proposal(
        &self,
        document: &Document,
        title: String,
        actor: &ActorId,
    ) -> Result<Proposal, DomainError> {
        let proposal = Proposal::draft(document.id.clone(), title, actor.clone(), Timestamp::now());
        let repo = self.git.open(&document.id)?;
        repo.ensure_branch(&proposal.branch, MAINLINE)?;
        self.store.insert_proposal(&proposal)?;
        self.store.append_audit(
            &audit::NewEvent::new(
                audit::Kind::ProposalCreated,
                actor,
                &document.id,
                Timestamp::now(),
            )
            .proposal(&proposal.id),
        )?;
        log::info!(target: "engine", "Proposal {} opened on document {}", proposal.id, document.id);

        Ok(proposal)
    }

    /// Commit the merged content if it differs from head, then run the
    /// post-commit bookkeeping (status label, reindex, orphan sweep).
    /// Caller holds the lock.
    fn commit_on(
        &self,
        proposal: &Proposal,
        incoming: &Content,
        actor: &ActorId,
        message: &str,
    ) -> Result<Option<CommitInfo>, DomainError> {
        let repo = self.git.open(&proposal.document)?;
        let (head, _) = repo.head(&proposal.branch)?;
        let next = Content::next(incoming, &head);

        if !next.differs(&head) {
            log::debug!(target: "engine", "No structural change on {}", proposal.id);
            return Ok(None);
        }
        let commit = repo.commit(&proposal.branch, &next, actor.as_str(), message)?;
        self.store
            .set_document_status(&proposal.document, STATUS_IN_REVIEW, actor)?;
        self.reindex(&proposal.document, &next);

        if let Some(doc) = &next.doc {
            self.orphan_sweep(proposal, doc, actor)?;
        }
        Ok(Some(commit))
    }

    /// Transition threads whose anchor node disappeared to ORPHANED.
    fn orphan_sweep(
        &self,
        proposal: &Proposal,
        doc: &serde_json::Value,
        actor: &ActorId,
    ) -> Result<(), DomainError> {
        let node_ids = content::node_ids(doc);
        let threads = self.store.threads(&proposal.id)?;

        for id in thread::sweep(&threads, &node_ids) {
            let mut thread = self.store.thread(&id)?;
            let node = thread.anchor.node_id.clone();
            thread.status = thread::Status::Orphaned;
            self.store.update_thread(&thread)?;
            log::info!(target: "thread", "Thread {id} orphaned: anchor {node:?} disappeared");
            self.store.append_audit(
                &audit::NewEvent::new(
                    audit::Kind::ThreadOrphaned,
                    actor,
                    &proposal.document,
                    Timestamp::now(),
                )
                .proposal(&proposal.id)
                .subject(&id)
                .payload(json!({ "nodeId": node })),
            )?;
        }
        Ok(())
    }

    /// A thread, if the viewer may see it. References to internal threads
    /// resolve as not-found for external viewers, hiding their existence.
    fn thread_for(&self, viewer: &Viewer, id: &ThreadId) -> Result<Thread, DomainError> {
        let thread = self.store.thread(id)?;
        if !thread.visible_to(viewer) {
            return Err(DomainError::not_found("thread"));
        }
        Ok(thread)
    }

    /// The visibility a write ends up with. External viewers may only
    /// write EXTERNAL; asking for INTERNAL is forbidden outright.
    fn write_visibility(
        &self,
        viewer: &Viewer,
        requested: Option<Visibility>,
        default: Visibility,
    ) -> Result<Visibility, DomainError> {
        if viewer.external {
            return match requested {
                Some(Visibility::Internal) => Err(DomainError::forbidden(
                    "external viewers may only create external items",
                )),
                _ => Ok(Visibility::External),
            };
        }
        Ok(requested.unwrap_or(default))
    }

    fn thread_view(&self, viewer: &Viewer, thread: Thread) -> Result<ThreadView, DomainError> {
        let annotations = self
            .store
            .annotations(&thread.id)?
            .into_iter()
            .filter(|a| a.visible_to(viewer))
            .collect();
        let votes = self.store.vote_totals(&thread.id)?;
        let reactions = self.store.reactions(&thread.id)?;

        Ok(ThreadView {
            thread,
            annotations,
            votes,
            reactions,
        })
    }

    fn thread_views(
        &self,
        viewer: &Viewer,
        proposal: &ProposalId,
    ) -> Result<Vec<ThreadView>, DomainError> {
        let mut views = Vec::new();
        for thread in self.store.threads(proposal)? {
            if !thread.visible_to(viewer) {
                continue;
            }
            views.push(self.thread_view(viewer, thread)?);
        }
        Ok(views)
    }

    /// One row per role in the graph, pending unless granted.
    fn approval_rows(&self, proposal: &ProposalId) -> Result<Vec<Approval>, DomainError> {
        let rows = self.store.approvals(proposal)?;
        let mut full = Vec::with_capacity(approval::Role::ALL.len());

        for role in approval::Role::ALL {
            match rows.iter().find(|a| a.role == role) {
                Some(row) => full.push(row.clone()),
                None => full.push(Approval {
                    proposal: proposal.clone(),
                    role,
                    status: approval::Status::Pending,
                    approved_by: None,
                    approved_at: None,
                }),
            }
        }
        Ok(full)
    }

    fn assemble_workspace(
        &self,
        viewer: &Viewer,
        document: Document,
        proposal: Option<Proposal>,
    ) -> Result<Workspace, DomainError> {
        let repo = self.git.open(&document.id)?;
        let branch = proposal
            .as_ref()
            .filter(|p| p.is_active() || p.status == proposal::Status::Merged)
            .map(|p| {
                if p.is_active() {
                    p.branch.as_str()
                } else {
                    MAINLINE
                }
            })
            .unwrap_or(MAINLINE);
        let (content, head) = repo.head(branch)?;

        let (threads, approvals, named_versions, gate) = match &proposal {
            Some(p) => {
                let threads = self.thread_views(viewer, &p.id)?;
                let approvals = self.approval_rows(&p.id)?;
                let named_versions = self.store.named_versions(&p.id)?;
                let reviews = self.store.change_reviews(&p.id)?;
                // The gate shown to a viewer is computed over the threads
                // they can see; merging itself always re-evaluates over the
                // full set.
                let visible: Vec<Thread> = threads.iter().map(|v| v.thread.clone()).collect();
                let evaluation = gate::evaluate(
                    &approval::snapshot(&self.store.approvals(&p.id)?),
                    &visible,
                    &reviews,
                    self.policy,
                );
                (threads, approvals, named_versions, Some(evaluation))
            }
            None => (Vec::new(), Vec::new(), Vec::new(), None),
        };

        Ok(Workspace {
            document,
            proposal,
            content,
            head,
            threads,
            approvals,
            named_versions,
            gate,
        })
    }

    fn reindex(&self, document: &DocumentId, content: &Content) {
        if let Err(e) = self.index.index(document, content) {
            log::warn!(target: "index", "Failed to index document {document}: {e}");
        }
    }
}
