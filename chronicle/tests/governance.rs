//! End-to-end governance scenarios, driven through the public engine API.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use chronicle::decision;
use chronicle::engine::{Chronicle, MergeOutcome, NewDocument, NewThread};
use chronicle::flush;
use chronicle::gate::{ChangeReview, Policy, ReviewState};
use chronicle::id::{DocumentId, SpaceId, ThreadId};
use chronicle::rbac::{Role, Viewer};
use chronicle::store::{Space, Store as _};
use chronicle::thread::{Anchor, Kind, Outcome, Status, Visibility, Vote};
use chronicle::Code;

type Engine = Chronicle<chronicle::store::sqlite::Store, chronicle::repo::git::Storage>;

struct Env {
    engine: Engine,
    space: SpaceId,
    _tmp: tempfile::TempDir,
}

fn setup() -> Env {
    let (engine, tmp) = Chronicle::memory().unwrap();
    let space = SpaceId::generate();
    engine
        .store()
        .insert_space(&Space {
            id: space.clone(),
            name: "Governance".to_owned(),
        })
        .unwrap();

    Env {
        engine,
        space,
        _tmp: tmp,
    }
}

fn editor(name: &str) -> Viewer {
    Viewer::internal(name.parse().unwrap(), Role::Editor)
}

fn heading(level: u64, node_id: &str, text: &str) -> Value {
    json!({
        "type": "heading",
        "attrs": { "level": level, "nodeId": node_id },
        "content": [{ "type": "text", "text": text }]
    })
}

fn paragraph(node_id: &str, text: &str) -> Value {
    json!({
        "type": "paragraph",
        "attrs": { "nodeId": node_id },
        "content": [{ "type": "text", "text": text }]
    })
}

fn content_with(nodes: Vec<Value>) -> chronicle::content::Content {
    chronicle::content::Content {
        doc: Some(json!({ "type": "doc", "content": nodes })),
        ..Default::default()
    }
}

fn anchored(label: &str, node_id: &str) -> Anchor {
    Anchor {
        label: label.to_owned(),
        node_id: node_id.to_owned(),
        offsets: None,
    }
}

/// Create a document and put a first revision on its proposal branch.
fn draft_document(env: &Env, viewer: &Viewer) -> (DocumentId, chronicle::proposal::Proposal) {
    let document = env
        .engine
        .create_document(
            viewer,
            NewDocument {
                title: "ADR".to_owned(),
                space: env.space.clone(),
                ..Default::default()
            },
        )
        .unwrap();

    let saved = env
        .engine
        .save_workspace(
            viewer,
            &document.id,
            &content_with(vec![
                heading(1, "n-title", "ADR"),
                paragraph("n-1", "We will do the thing."),
                paragraph("n-2", "Unless we don't."),
            ]),
        )
        .unwrap();

    assert!(saved.commit.is_some());
    let proposal = saved.workspace.proposal.unwrap();
    assert_eq!(proposal.status, chronicle::proposal::Status::Draft);
    assert_eq!(proposal.branch, format!("proposal-{}", proposal.id));

    (document.id, proposal)
}

fn approve_all(env: &Env, viewer: &Viewer, proposal: &chronicle::id::ProposalId) {
    for role in ["security", "architectureCommittee", "legal"] {
        env.engine.approve(viewer, proposal, role).unwrap();
    }
}

#[test]
fn test_happy_merge() {
    let env = setup();
    let alice = editor("alice");
    let (document, proposal) = draft_document(&env, &alice);

    let submitted = env.engine.submit_proposal(&alice, &proposal.id).unwrap();
    assert_eq!(submitted.status, chronicle::proposal::Status::UnderReview);

    // One resolved discussion along the way.
    let thread = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                anchor: Some(anchored("§1", "n-1")),
                body: "Is the thing safe?".to_owned(),
                kind: Kind::Security,
                visibility: None,
            },
        )
        .unwrap();
    env.engine
        .resolve_thread(&alice, &thread.thread.id, Outcome::Accepted, None)
        .unwrap();

    approve_all(&env, &alice, &proposal.id);

    let MergeOutcome {
        merge_commit,
        evaluation,
        workspace,
    } = env
        .engine
        .merge_proposal(&alice, &proposal.id, None, None)
        .unwrap();

    assert!(evaluation.allowed());
    assert_eq!(
        workspace.proposal.as_ref().unwrap().status,
        chronicle::proposal::Status::Merged
    );

    // Mainline head is the merge commit.
    let history = env.engine.history(&alice, &document, None, 8).unwrap();
    assert_eq!(history[0].hash, merge_commit.hash);

    // One merge entry and one per resolved thread.
    let decisions = env
        .engine
        .decisions(&alice, &decision::Filter::proposal(proposal.id.clone()))
        .unwrap();
    assert_eq!(decisions.len(), 2);

    let merge_entry = decisions
        .iter()
        .find(|e| e.thread == decision::MERGE)
        .unwrap();
    assert_eq!(merge_entry.commit, merge_commit.hash);
    assert_eq!(merge_entry.outcome, Outcome::Accepted);
    assert_eq!(merge_entry.participants, vec!["alice".to_owned()]);

    let thread_entry = decisions
        .iter()
        .find(|e| e.thread == thread.thread.id.to_string())
        .unwrap();
    assert_eq!(thread_entry.outcome, Outcome::Accepted);
    assert!(thread_entry.participants.contains(&"alice".to_owned()));

    // The document label tracked the lifecycle.
    let document = env.engine.document(&alice, &document).unwrap();
    assert_eq!(document.status, "Approved");
}

#[test]
fn test_second_proposal_branches_from_merged_mainline() {
    let env = setup();
    let alice = editor("alice");
    let (document, first) = draft_document(&env, &alice);

    env.engine.submit_proposal(&alice, &first.id).unwrap();
    approve_all(&env, &alice, &first.id);
    let merged = env
        .engine
        .merge_proposal(&alice, &first.id, None, None)
        .unwrap();

    // The next save opens a fresh proposal on its own branch, created
    // from the new mainline rather than the first proposal's stale head.
    let saved = env
        .engine
        .save_workspace(
            &alice,
            &document,
            &content_with(vec![
                heading(1, "n-title", "ADR"),
                paragraph("n-1", "We will do the thing."),
                paragraph("n-2", "Unless we don't."),
                paragraph("n-4", "A follow-up amendment."),
            ]),
        )
        .unwrap();
    let second = saved.workspace.proposal.clone().unwrap();

    assert_ne!(second.id, first.id);
    assert_ne!(second.branch, first.branch);

    let history = env
        .engine
        .history(&alice, &document, Some(&second.branch), 8)
        .unwrap();
    assert_eq!(history[0].hash, saved.commit.unwrap().hash);
    assert_eq!(history[1].hash, merged.merge_commit.hash);
}

#[test]
fn test_approval_dependency_blocks() {
    let env = setup();
    let alice = editor("alice");
    let (_, proposal) = draft_document(&env, &alice);

    let err = env
        .engine
        .approve(&alice, &proposal.id, "legal")
        .unwrap_err();

    assert_eq!(err.code, Code::ApprovalOrderBlocked);
    assert_eq!(err.status, 409);
    assert_eq!(
        err.details.unwrap()["blockers"],
        json!(["security", "architectureCommittee"])
    );

    // No approval row was written.
    let workspace = env
        .engine
        .workspace(&alice, &proposal.document)
        .unwrap();
    assert!(workspace
        .approvals
        .iter()
        .all(|a| a.status == chronicle::approval::Status::Pending));

    // Unknown roles are rejected outright.
    let err = env
        .engine
        .approve(&alice, &proposal.id, "finance")
        .unwrap_err();
    assert_eq!(err.code, Code::ValidationError);
}

#[test]
fn test_orphaned_thread_blocks_merge_until_resolved() {
    let env = setup();
    let alice = editor("alice");
    let (document, proposal) = draft_document(&env, &alice);
    env.engine.submit_proposal(&alice, &proposal.id).unwrap();

    let thread = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                anchor: Some(anchored("§1", "n-1")),
                body: "About this clause".to_owned(),
                kind: Kind::General,
                visibility: None,
            },
        )
        .unwrap();

    // Save a revision that drops node n-1.
    let saved = env
        .engine
        .save_workspace(
            &alice,
            &document,
            &content_with(vec![
                heading(1, "n-title", "ADR"),
                paragraph("n-2", "Unless we don't."),
            ]),
        )
        .unwrap();
    assert!(saved.commit.is_some());

    let orphaned = &saved
        .workspace
        .threads
        .iter()
        .find(|v| v.thread.id == thread.thread.id)
        .unwrap()
        .thread;
    assert_eq!(orphaned.status, Status::Orphaned);

    let trail = env.engine.audit_trail(&alice, &document, 32).unwrap();
    let event = trail
        .iter()
        .find(|e| e.event_type == chronicle::audit::Kind::ThreadOrphaned)
        .unwrap();
    assert_eq!(event.subject.as_deref(), Some(thread.thread.id.as_str()));
    assert_eq!(event.payload["nodeId"], "n-1");

    // The sweep is idempotent: saving again changes nothing.
    let again = env
        .engine
        .save_workspace(
            &alice,
            &document,
            &content_with(vec![
                heading(1, "n-title", "ADR"),
                paragraph("n-2", "Unless we don't."),
            ]),
        )
        .unwrap();
    assert!(again.commit.is_none());

    approve_all(&env, &alice, &proposal.id);
    let err = env
        .engine
        .merge_proposal(&alice, &proposal.id, None, None)
        .unwrap_err();
    assert_eq!(err.code, Code::MergeGateBlocked);
    assert_eq!(err.details.as_ref().unwrap()["openThreads"], 1);

    env.engine
        .resolve_thread(
            &alice,
            &thread.thread.id,
            Outcome::Deferred,
            Some("superseded by the new clause"),
        )
        .unwrap();
    env.engine
        .merge_proposal(&alice, &proposal.id, None, None)
        .unwrap();
}

#[test]
fn test_external_isolation() {
    let env = setup();
    let alice = editor("alice");
    let eve = Viewer::external("eve".parse().unwrap(), Role::Commenter);
    let (document, proposal) = draft_document(&env, &alice);

    let internal = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                anchor: Some(anchored("§1", "n-1")),
                body: "Internal deliberation".to_owned(),
                kind: Kind::Legal,
                visibility: Some(Visibility::Internal),
            },
        )
        .unwrap();
    let external = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                anchor: Some(anchored("§2", "n-2")),
                body: "For the counterparty".to_owned(),
                kind: Kind::Query,
                visibility: Some(Visibility::External),
            },
        )
        .unwrap();

    // Only the external thread is visible, at any depth of the workspace.
    let workspace = env.engine.workspace(&eve, &document).unwrap();
    assert_eq!(workspace.threads.len(), 1);
    assert_eq!(workspace.threads[0].thread.id, external.thread.id);
    let serialized = serde_json::to_string(&workspace).unwrap();
    assert!(!serialized.contains(internal.thread.id.as_str()));

    // Referencing the internal thread resolves as not-found, not forbidden.
    let err = env
        .engine
        .reply(&eve, &internal.thread.id, "hello?", None, None)
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    // Asking for an internal thread is forbidden outright.
    let err = env
        .engine
        .create_thread(
            &eve,
            &proposal.id,
            NewThread {
                body: "Sneaky".to_owned(),
                visibility: Some(Visibility::Internal),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code, Code::Forbidden);

    // External writes land as EXTERNAL, and replies on the external thread
    // work.
    let reply = env
        .engine
        .reply(&eve, &external.thread.id, "Answering", None, None)
        .unwrap();
    assert_eq!(reply.visibility, Visibility::External);

    // Visibility is immutable to external viewers.
    let err = env
        .engine
        .set_thread_visibility(
            &Viewer::external("eve".parse().unwrap(), Role::Editor),
            &external.thread.id,
            Visibility::Internal,
        )
        .unwrap_err();
    assert_eq!(err.code, Code::Forbidden);
}

#[test]
fn test_flush_idempotence() {
    let env = setup();
    let alice = editor("alice");
    let (document, proposal) = draft_document(&env, &alice);

    let request = flush::Request {
        session_id: "s-1".to_owned(),
        document_id: document.clone(),
        proposal_id: Some(proposal.id.clone()),
        actor: Some("alice".parse().unwrap()),
        update_count: 4,
        snapshot: Some(content_with(vec![
            heading(1, "n-title", "ADR"),
            paragraph("n-1", "We will do the thing."),
            paragraph("n-2", "Unless we don't."),
            paragraph("n-3", "Amended during the session."),
        ])),
    };

    let first = env.engine.flush(&request).unwrap();
    let commit = first.flush_commit.clone().unwrap();

    let before = env
        .engine
        .history(&alice, &document, Some(&proposal.branch), 32)
        .unwrap();
    assert_eq!(before[0].hash, commit);
    assert_eq!(before[0].message, "Sync session flush (4 updates)");

    // Identical session id replays the cached response; no new commit.
    let second = env.engine.flush(&request).unwrap();
    assert_eq!(second, first);
    let after = env
        .engine
        .history(&alice, &document, Some(&proposal.branch), 32)
        .unwrap();
    assert_eq!(before.len(), after.len());

    // A blank session id is a validation error.
    let mut blank = request;
    blank.session_id = "  ".to_owned();
    assert_eq!(
        env.engine.flush(&blank).unwrap_err().code,
        Code::ValidationError
    );

    // No snapshot acknowledges without committing.
    let ack = env
        .engine
        .flush(&flush::Request {
            session_id: "s-2".to_owned(),
            document_id: document.clone(),
            proposal_id: None,
            actor: None,
            update_count: 0,
            snapshot: None,
        })
        .unwrap();
    assert_eq!(ack.flush_commit, None);
}

#[test]
fn test_merge_gate_policy_for_deferred_changes() {
    let env = setup();
    let alice = editor("alice");
    let (_, proposal) = draft_document(&env, &alice);
    env.engine.submit_proposal(&alice, &proposal.id).unwrap();

    env.engine
        .record_change_review(
            &alice,
            ChangeReview {
                proposal: proposal.id.clone(),
                change_id: "c-1".parse().unwrap(),
                from_ref: "a".to_owned(),
                to_ref: "b".to_owned(),
                state: ReviewState::Deferred,
                node_id: Some("n-1".to_owned()),
                rejected_rationale: None,
                reviewer: None,
                reviewed_at: None,
            },
        )
        .unwrap();
    env.engine
        .approve(&alice, &proposal.id, "security")
        .unwrap();
    env.engine
        .approve(&alice, &proposal.id, "architectureCommittee")
        .unwrap();

    // One pending approval plus one deferred change under the strict policy.
    let err = env
        .engine
        .merge_proposal(&alice, &proposal.id, None, None)
        .unwrap_err();
    assert_eq!(err.code, Code::MergeGateBlocked);
    let details = err.details.unwrap();
    assert_eq!(details["blockers"].as_array().unwrap().len(), 2);

    // The lenient policy still leaves the pending approval.
    let lenient = Policy {
        allow_merge_with_deferred_changes: true,
        ignore_format_only_changes_for_gate: false,
    };
    let err = env
        .engine
        .merge_proposal(&alice, &proposal.id, Some(lenient), None)
        .unwrap_err();
    assert_eq!(
        err.details.unwrap()["blockers"].as_array().unwrap().len(),
        1
    );

    env.engine.approve(&alice, &proposal.id, "legal").unwrap();
    let outcome = env
        .engine
        .merge_proposal(&alice, &proposal.id, Some(lenient), None)
        .unwrap();
    assert!(outcome.evaluation.allowed());
}

#[test]
fn test_vote_toggle_law() {
    let env = setup();
    let alice = editor("alice");
    let bob = Viewer::internal("bob".parse().unwrap(), Role::Commenter);
    let (_, proposal) = draft_document(&env, &alice);

    let thread = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                body: "Vote on this".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();

    let totals = env.engine.vote(&bob, &thread.thread.id, Vote::Up).unwrap();
    assert_eq!((totals.up, totals.down), (1, 0));

    // Voting the same direction again removes the vote.
    let totals = env.engine.vote(&bob, &thread.thread.id, Vote::Up).unwrap();
    assert_eq!((totals.up, totals.down), (0, 0));
}

#[test]
fn test_reopen_appends_second_decision_on_next_resolution() {
    let env = setup();
    let alice = editor("alice");
    let (_, proposal) = draft_document(&env, &alice);

    let thread = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                body: "Back and forth".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();
    let id = thread.thread.id;

    env.engine
        .resolve_thread(&alice, &id, Outcome::Accepted, None)
        .unwrap();
    env.engine.reopen_thread(&alice, &id).unwrap();
    env.engine
        .resolve_thread(&alice, &id, Outcome::Rejected, Some("second thoughts"))
        .unwrap();

    let decisions = env
        .engine
        .decisions(&alice, &decision::Filter::proposal(proposal.id))
        .unwrap();
    let entries: Vec<_> = decisions
        .iter()
        .filter(|e| e.thread == id.to_string())
        .collect();
    assert_eq!(entries.len(), 2);
}

#[test]
fn test_resolution_edges() {
    let env = setup();
    let alice = editor("alice");
    let (_, proposal) = draft_document(&env, &alice);

    // Unknown thread.
    let missing: ThreadId = ThreadId::generate();
    let err = env
        .engine
        .resolve_thread(&alice, &missing, Outcome::Accepted, None)
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    // An anchor that isn't in the document is accepted on create.
    let thread = env
        .engine
        .create_thread(
            &alice,
            &proposal.id,
            NewThread {
                anchor: Some(anchored("¶ Ghost", "n-ghost")),
                body: "Anchored to nothing".to_owned(),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(thread.thread.status, Status::Open);

    // Rejection without a rationale fails; the thread stays open.
    let err = env
        .engine
        .resolve_thread(&alice, &thread.thread.id, Outcome::Rejected, None)
        .unwrap_err();
    assert_eq!(err.code, Code::ValidationError);

    // Resolving twice reports not-found.
    env.engine
        .resolve_thread(&alice, &thread.thread.id, Outcome::Accepted, None)
        .unwrap();
    let err = env
        .engine
        .resolve_thread(&alice, &thread.thread.id, Outcome::Accepted, None)
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[test]
fn test_named_version_slug_boundaries() {
    let env = setup();
    let alice = editor("alice");
    let (_, proposal) = draft_document(&env, &alice);

    let version = env
        .engine
        .save_named_version(&alice, &proposal.id, "Board draft #2")
        .unwrap();
    assert!(version.tag.starts_with("nv-board-draft-2-"));
    assert_eq!(version.commit.len(), 40);
    assert!(version.tag.ends_with(&version.commit[..12]));

    // A label of non-alphanumerics slugs to "version".
    let version = env
        .engine
        .save_named_version(&alice, &proposal.id, "¶¶¶")
        .unwrap();
    assert!(version.tag.starts_with("nv-version-"));

    // Blank labels are rejected.
    let err = env
        .engine
        .save_named_version(&alice, &proposal.id, "   ")
        .unwrap_err();
    assert_eq!(err.code, Code::ValidationError);
}

#[test]
fn test_rbac_gates_writes() {
    let env = setup();
    let alice = editor("alice");
    let viewer = Viewer::internal("dave".parse().unwrap(), Role::Viewer);
    let (document, proposal) = draft_document(&env, &alice);

    let err = env
        .engine
        .save_workspace(&viewer, &document, &content_with(vec![]))
        .unwrap_err();
    assert_eq!(err.code, Code::Forbidden);

    let err = env
        .engine
        .approve(&viewer, &proposal.id, "security")
        .unwrap_err();
    assert_eq!(err.code, Code::Forbidden);

    // Reads are open to every role.
    env.engine.workspace(&viewer, &document).unwrap();
}
