//! SQLite implementation of the store seam. The schema is applied on open;
//! append-only tables are protected by triggers so that not even a buggy
//! caller can rewrite history.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time;

use sqlite as sql;

use crate::approval::{self, Approval};
use crate::audit;
use crate::decision;
use crate::gate::ChangeReview;
use crate::id::{ActorId, DocumentId, ProposalId, SpaceId, ThreadId};
use crate::proposal::{NamedVersion, Proposal, Status as ProposalStatus};
use crate::rbac::Role;
use crate::sql::transaction;
use crate::store::{Document, Error, Space, User};
use crate::thread::{Annotation, Reaction, Thread, Vote, VoteTotals};
use crate::Timestamp;

/// How long to wait for the database lock to be released before failing.
const DB_TIMEOUT: time::Duration = time::Duration::from_secs(6);

#[derive(Clone)]
pub struct Store {
    db: Arc<sql::ConnectionThreadSafe>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store(..)")
    }
}

impl Store {
    const SCHEMA: &'static str = include_str!("schema.sql");

    /// Open a store at the given path. Creates the database and schema if
    /// they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut db = sql::Connection::open_thread_safe(path)?;
        db.set_busy_timeout(DB_TIMEOUT.as_millis() as usize)?;
        db.execute(Self::SCHEMA)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new in-memory store.
    pub fn memory() -> Result<Self, Error> {
        let db = sql::Connection::open_thread_safe(":memory:")?;
        db.execute(Self::SCHEMA)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn last_insert_id(&self) -> Result<i64, Error> {
        let stmt = self.db.prepare("SELECT last_insert_rowid()")?;
        let row = stmt
            .into_iter()
            .next()
            .expect("last_insert_rowid always returns a single row")?;

        Ok(row.read::<i64, _>(0))
    }
}

impl super::Store for Store {
    fn insert_document(&self, doc: &Document) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `documents`
             (`id`, `title`, `subtitle`, `status`, `space`, `parent`, `sort-order`, `updated-by`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.bind((1, &doc.id))?;
        stmt.bind((2, doc.title.as_str()))?;
        stmt.bind((3, doc.subtitle.as_str()))?;
        stmt.bind((4, doc.status.as_str()))?;
        stmt.bind((5, &doc.space))?;
        stmt.bind((6, doc.parent.as_ref().map(|p| p.as_str())))?;
        stmt.bind((7, doc.sort_order))?;
        stmt.bind((8, doc.updated_by.as_ref().map(|a| a.as_str())))?;
        stmt.next()?;

        Ok(())
    }

    fn document(&self, id: &DocumentId) -> Result<Document, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `title`, `subtitle`, `status`, `space`, `parent`, `sort-order`, `updated-by`
             FROM `documents` WHERE `id` = ?1",
        )?;
        stmt.bind((1, id))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return parse::document(row);
        }
        Err(Error::NotFound("document"))
    }

    fn documents_of(&self, space: &SpaceId) -> Result<Vec<Document>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `title`, `subtitle`, `status`, `space`, `parent`, `sort-order`, `updated-by`
             FROM `documents` WHERE `space` = ?1
             ORDER BY `sort-order`, `title`",
        )?;
        stmt.bind((1, space))?;

        stmt.into_iter().map(|row| parse::document(row?)).collect()
    }

    fn set_document_status(
        &self,
        id: &DocumentId,
        label: &str,
        updated_by: &ActorId,
    ) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "UPDATE `documents` SET `status` = ?2, `updated-by` = ?3 WHERE `id` = ?1",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, label))?;
        stmt.bind((3, updated_by))?;
        stmt.next()?;

        if self.db.change_count() == 0 {
            return Err(Error::NotFound("document"));
        }
        Ok(())
    }

    fn insert_space(&self, space: &Space) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("INSERT INTO `spaces` (`id`, `name`) VALUES (?1, ?2)")?;
        stmt.bind((1, &space.id))?;
        stmt.bind((2, space.name.as_str()))?;
        stmt.next()?;

        Ok(())
    }

    fn space(&self, id: &SpaceId) -> Result<Space, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT `id`, `name` FROM `spaces` WHERE `id` = ?1")?;
        stmt.bind((1, id))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return Ok(Space {
                id: row.try_read::<SpaceId, _>("id")?,
                name: row.try_read::<&str, _>("name")?.to_owned(),
            });
        }
        Err(Error::NotFound("space"))
    }

    fn delete_space(&self, id: &SpaceId) -> Result<(), Error> {
        transaction(&self.db, |db| {
            let mut stmt =
                db.prepare("SELECT COUNT(*) FROM `documents` WHERE `space` = ?1")?;
            stmt.bind((1, id))?;
            let count: i64 = stmt
                .into_iter()
                .next()
                .expect("COUNT always returns a single row")?
                .read(0);

            if count > 0 {
                return Err(Error::SpaceNotEmpty);
            }
            let mut stmt = db.prepare("DELETE FROM `spaces` WHERE `id` = ?1")?;
            stmt.bind((1, id))?;
            stmt.next()?;

            Ok(())
        })
    }

    fn upsert_user(&self, user: &User) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `users` (`id`, `name`, `role`, `external`) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO UPDATE SET `name` = ?2, `role` = ?3, `external` = ?4",
        )?;
        stmt.bind((1, &user.id))?;
        stmt.bind((2, user.name.as_str()))?;
        stmt.bind((3, user.role.to_string().as_str()))?;
        stmt.bind((4, user.external as i64))?;
        stmt.next()?;

        Ok(())
    }

    fn user(&self, id: &ActorId) -> Result<User, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `name`, `role`, `external` FROM `users` WHERE `id` = ?1",
        )?;
        stmt.bind((1, id))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return Ok(User {
                id: row.try_read::<ActorId, _>("id")?,
                name: row.try_read::<&str, _>("name")?.to_owned(),
                // Unknown role strings degrade to the viewer role.
                role: Role::normalize(row.try_read::<&str, _>("role")?),
                external: row.try_read::<i64, _>("external")? != 0,
            });
        }
        Err(Error::NotFound("user"))
    }

    fn insert_proposal(&self, proposal: &Proposal) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `proposals`
             (`id`, `document`, `title`, `status`, `branch`, `target-branch`, `created-by`, `created-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.bind((1, &proposal.id))?;
        stmt.bind((2, &proposal.document))?;
        stmt.bind((3, proposal.title.as_str()))?;
        stmt.bind((4, &proposal.status))?;
        stmt.bind((5, proposal.branch.as_str()))?;
        stmt.bind((6, proposal.target_branch.as_str()))?;
        stmt.bind((7, &proposal.created_by))?;
        stmt.bind((8, millis(proposal.created_at)?))?;
        stmt.next()?;

        Ok(())
    }

    fn proposal(&self, id: &ProposalId) -> Result<Proposal, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `document`, `title`, `status`, `branch`, `target-branch`, `created-by`, `created-at`
             FROM `proposals` WHERE `id` = ?1",
        )?;
        stmt.bind((1, id))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return parse::proposal(row);
        }
        Err(Error::NotFound("proposal"))
    }

    fn active_proposal(&self, document: &DocumentId) -> Result<Option<Proposal>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `document`, `title`, `status`, `branch`, `target-branch`, `created-by`, `created-at`
             FROM `proposals`
             WHERE `document` = ?1 AND `status` IN ('DRAFT', 'UNDER_REVIEW')
             ORDER BY `created-at` DESC LIMIT 1",
        )?;
        stmt.bind((1, document))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return parse::proposal(row).map(Some);
        }
        Ok(None)
    }

    fn set_proposal_status(&self, id: &ProposalId, status: ProposalStatus) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE `proposals` SET `status` = ?2 WHERE `id` = ?1")?;
        stmt.bind((1, id))?;
        stmt.bind((2, &status))?;
        stmt.next()?;

        if self.db.change_count() == 0 {
            return Err(Error::NotFound("proposal"));
        }
        Ok(())
    }

    fn insert_thread(&self, thread: &Thread) -> Result<(), Error> {
        let offsets = thread
            .anchor
            .offsets
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let mut stmt = self.db.prepare(
            "INSERT INTO `threads`
             (`id`, `proposal`, `anchor-label`, `anchor-node`, `anchor-offsets`, `body`, `author`,
              `type`, `visibility`, `status`, `resolved-outcome`, `resolved-note`, `created-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        stmt.bind((1, &thread.id))?;
        stmt.bind((2, &thread.proposal))?;
        stmt.bind((3, thread.anchor.label.as_str()))?;
        stmt.bind((4, thread.anchor.node_id.as_str()))?;
        stmt.bind((5, offsets.as_deref()))?;
        stmt.bind((6, thread.body.as_str()))?;
        stmt.bind((7, &thread.author))?;
        stmt.bind((8, &thread.kind))?;
        stmt.bind((9, &thread.visibility))?;
        stmt.bind((10, &thread.status))?;
        stmt.bind((11, thread.resolved_outcome.map(|o| o.to_string()).as_deref()))?;
        stmt.bind((12, thread.resolved_note.as_deref()))?;
        stmt.bind((13, millis(thread.created_at)?))?;
        stmt.next()?;

        Ok(())
    }

    fn thread(&self, id: &ThreadId) -> Result<Thread, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `proposal`, `anchor-label`, `anchor-node`, `anchor-offsets`, `body`,
                    `author`, `type`, `visibility`, `status`, `resolved-outcome`, `resolved-note`,
                    `created-at`
             FROM `threads` WHERE `id` = ?1",
        )?;
        stmt.bind((1, id))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return parse::thread(row);
        }
        Err(Error::NotFound("thread"))
    }

    fn threads(&self, proposal: &ProposalId) -> Result<Vec<Thread>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `proposal`, `anchor-label`, `anchor-node`, `anchor-offsets`, `body`,
                    `author`, `type`, `visibility`, `status`, `resolved-outcome`, `resolved-note`,
                    `created-at`
             FROM `threads` WHERE `proposal` = ?1
             ORDER BY `created-at`, `id`",
        )?;
        stmt.bind((1, proposal))?;

        stmt.into_iter().map(|row| parse::thread(row?)).collect()
    }

    fn update_thread(&self, thread: &Thread) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "UPDATE `threads`
             SET `visibility` = ?2, `status` = ?3, `resolved-outcome` = ?4, `resolved-note` = ?5
             WHERE `id` = ?1",
        )?;
        stmt.bind((1, &thread.id))?;
        stmt.bind((2, &thread.visibility))?;
        stmt.bind((3, &thread.status))?;
        stmt.bind((4, thread.resolved_outcome.map(|o| o.to_string()).as_deref()))?;
        stmt.bind((5, thread.resolved_note.as_deref()))?;
        stmt.next()?;

        if self.db.change_count() == 0 {
            return Err(Error::NotFound("thread"));
        }
        Ok(())
    }

    fn insert_annotation(&self, annotation: &Annotation) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `annotations`
             (`id`, `proposal`, `thread`, `author`, `body`, `type`, `visibility`, `created-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.bind((1, &annotation.id))?;
        stmt.bind((2, &annotation.proposal))?;
        stmt.bind((3, &annotation.thread))?;
        stmt.bind((4, &annotation.author))?;
        stmt.bind((5, annotation.body.as_str()))?;
        stmt.bind((6, &annotation.kind))?;
        stmt.bind((7, &annotation.visibility))?;
        stmt.bind((8, millis(annotation.created_at)?))?;
        stmt.next()?;

        Ok(())
    }

    fn annotations(&self, thread: &ThreadId) -> Result<Vec<Annotation>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `id`, `proposal`, `thread`, `author`, `body`, `type`, `visibility`, `created-at`
             FROM `annotations` WHERE `thread` = ?1
             ORDER BY `created-at`, `id`",
        )?;
        stmt.bind((1, thread))?;

        stmt.into_iter()
            .map(|row| parse::annotation(row?))
            .collect()
    }

    fn toggle_vote(
        &self,
        thread: &ThreadId,
        user: &ActorId,
        vote: Vote,
    ) -> Result<Option<Vote>, Error> {
        transaction(&self.db, |db| {
            let mut stmt = db.prepare(
                "SELECT `vote` FROM `thread-votes` WHERE `thread` = ?1 AND `user` = ?2",
            )?;
            stmt.bind((1, thread))?;
            stmt.bind((2, user))?;

            let current = match stmt.into_iter().next() {
                Some(row) => Vote::from_value(row?.try_read::<i64, _>("vote")?),
                None => None,
            };

            if current == Some(vote) {
                // Same direction toggles the vote off.
                let mut stmt = db.prepare(
                    "DELETE FROM `thread-votes` WHERE `thread` = ?1 AND `user` = ?2",
                )?;
                stmt.bind((1, thread))?;
                stmt.bind((2, user))?;
                stmt.next()?;

                Ok(None)
            } else {
                let mut stmt = db.prepare(
                    "INSERT INTO `thread-votes` (`thread`, `user`, `vote`) VALUES (?1, ?2, ?3)
                     ON CONFLICT DO UPDATE SET `vote` = ?3",
                )?;
                stmt.bind((1, thread))?;
                stmt.bind((2, user))?;
                stmt.bind((3, vote.value()))?;
                stmt.next()?;

                Ok(Some(vote))
            }
        })
    }

    fn vote_totals(&self, thread: &ThreadId) -> Result<VoteTotals, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT `vote` FROM `thread-votes` WHERE `thread` = ?1")?;
        stmt.bind((1, thread))?;

        let mut totals = VoteTotals::default();
        for row in stmt.into_iter() {
            match Vote::from_value(row?.try_read::<i64, _>("vote")?) {
                Some(Vote::Up) => totals.up += 1,
                Some(Vote::Down) => totals.down += 1,
                None => {}
            }
        }
        Ok(totals)
    }

    fn toggle_reaction(
        &self,
        thread: &ThreadId,
        user: &ActorId,
        reaction: &Reaction,
    ) -> Result<bool, Error> {
        transaction(&self.db, |db| {
            let mut stmt = db.prepare(
                "DELETE FROM `thread-reactions`
                 WHERE `thread` = ?1 AND `user` = ?2 AND `emoji` = ?3",
            )?;
            stmt.bind((1, thread))?;
            stmt.bind((2, user))?;
            stmt.bind((3, reaction.as_str()))?;
            stmt.next()?;

            if db.change_count() > 0 {
                return Ok(false);
            }
            let mut stmt = db.prepare(
                "INSERT INTO `thread-reactions` (`thread`, `user`, `emoji`) VALUES (?1, ?2, ?3)",
            )?;
            stmt.bind((1, thread))?;
            stmt.bind((2, user))?;
            stmt.bind((3, reaction.as_str()))?;
            stmt.next()?;

            Ok(true)
        })
    }

    fn reactions(&self, thread: &ThreadId) -> Result<BTreeMap<String, usize>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `emoji`, COUNT(*) AS `count` FROM `thread-reactions`
             WHERE `thread` = ?1 GROUP BY `emoji` ORDER BY `emoji`",
        )?;
        stmt.bind((1, thread))?;

        let mut reactions = BTreeMap::new();
        for row in stmt.into_iter() {
            let row = row?;
            let emoji = row.try_read::<&str, _>("emoji")?.to_owned();
            let count = row.try_read::<i64, _>("count")?;
            reactions.insert(emoji, usize::try_from(count)?);
        }
        Ok(reactions)
    }

    fn upsert_approval(
        &self,
        proposal: &ProposalId,
        role: approval::Role,
        approved_by: &ActorId,
        approved_at: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `approvals` (`proposal`, `role`, `status`, `approved-by`, `approved-at`)
             VALUES (?1, ?2, 'approved', ?3, ?4)
             ON CONFLICT DO UPDATE SET `status` = 'approved', `approved-by` = ?3, `approved-at` = ?4",
        )?;
        stmt.bind((1, proposal))?;
        stmt.bind((2, &role))?;
        stmt.bind((3, approved_by))?;
        stmt.bind((4, millis(approved_at)?))?;
        stmt.next()?;

        Ok(())
    }

    fn approvals(&self, proposal: &ProposalId) -> Result<Vec<Approval>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `proposal`, `role`, `status`, `approved-by`, `approved-at`
             FROM `approvals` WHERE `proposal` = ?1",
        )?;
        stmt.bind((1, proposal))?;

        stmt.into_iter().map(|row| parse::approval(row?)).collect()
    }

    fn upsert_change_review(&self, review: &ChangeReview) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `change-reviews`
             (`proposal`, `change`, `from-ref`, `to-ref`, `state`, `node`, `rejected-rationale`,
              `reviewer`, `reviewed-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT DO UPDATE
             SET `state` = ?5, `node` = ?6, `rejected-rationale` = ?7, `reviewer` = ?8,
                 `reviewed-at` = ?9",
        )?;
        stmt.bind((1, &review.proposal))?;
        stmt.bind((2, &review.change_id))?;
        stmt.bind((3, review.from_ref.as_str()))?;
        stmt.bind((4, review.to_ref.as_str()))?;
        stmt.bind((5, &review.state))?;
        stmt.bind((6, review.node_id.as_deref()))?;
        stmt.bind((7, review.rejected_rationale.as_deref()))?;
        stmt.bind((8, review.reviewer.as_ref().map(|r| r.as_str())))?;
        stmt.bind((9, review.reviewed_at.map(millis).transpose()?))?;
        stmt.next()?;

        Ok(())
    }

    fn change_reviews(&self, proposal: &ProposalId) -> Result<Vec<ChangeReview>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `proposal`, `change`, `from-ref`, `to-ref`, `state`, `node`,
                    `rejected-rationale`, `reviewer`, `reviewed-at`
             FROM `change-reviews` WHERE `proposal` = ?1
             ORDER BY `change`",
        )?;
        stmt.bind((1, proposal))?;

        stmt.into_iter()
            .map(|row| parse::change_review(row?))
            .collect()
    }

    fn insert_named_version(&self, version: &NamedVersion) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO `named-versions`
             (`proposal`, `label`, `commit`, `tag`, `created-by`, `created-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT DO NOTHING",
        )?;
        stmt.bind((1, &version.proposal))?;
        stmt.bind((2, version.label.as_str()))?;
        stmt.bind((3, version.commit.as_str()))?;
        stmt.bind((4, version.tag.as_str()))?;
        stmt.bind((5, &version.created_by))?;
        stmt.bind((6, millis(version.created_at)?))?;
        stmt.next()?;

        Ok(())
    }

    fn named_versions(&self, proposal: &ProposalId) -> Result<Vec<NamedVersion>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT `proposal`, `label`, `commit`, `tag`, `created-by`, `created-at`
             FROM `named-versions` WHERE `proposal` = ?1
             ORDER BY `created-at`, `tag`",
        )?;
        stmt.bind((1, proposal))?;

        stmt.into_iter()
            .map(|row| parse::named_version(row?))
            .collect()
    }

    fn append_decision(&self, entry: &decision::NewEntry) -> Result<i64, Error> {
        let participants = serde_json::to_string(&entry.participants)?;
        let mut stmt = self.db.prepare(
            "INSERT INTO `decision-log`
             (`document`, `proposal`, `thread`, `outcome`, `rationale`, `decided-by`, `commit`,
              `participants`, `decided-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.bind((1, &entry.document))?;
        stmt.bind((2, &entry.proposal))?;
        stmt.bind((3, entry.thread.as_str()))?;
        stmt.bind((4, &entry.outcome))?;
        stmt.bind((5, entry.rationale.as_deref()))?;
        stmt.bind((6, &entry.decided_by))?;
        stmt.bind((7, entry.commit.as_str()))?;
        stmt.bind((8, participants.as_str()))?;
        stmt.bind((9, millis(entry.decided_at)?))?;
        stmt.next()?;

        self.last_insert_id()
    }

    fn decisions(&self, filter: &decision::Filter) -> Result<Vec<decision::Entry>, Error> {
        let mut conditions = Vec::new();
        if filter.proposal.is_some() {
            conditions.push("`proposal` = :proposal");
        }
        if filter.outcome.is_some() {
            conditions.push("`outcome` = :outcome");
        }
        if filter.query.is_some() {
            conditions.push("(`rationale` LIKE :query OR `decided-by` LIKE :query)");
        }
        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(64);

        let mut stmt = self.db.prepare(format!(
            "SELECT `id`, `document`, `proposal`, `thread`, `outcome`, `rationale`, `decided-by`,
                    `commit`, `participants`, `decided-at`
             FROM `decision-log` {clause}
             ORDER BY `id` DESC LIMIT {limit}",
        ))?;
        if let Some(proposal) = &filter.proposal {
            stmt.bind((":proposal", proposal))?;
        }
        if let Some(outcome) = &filter.outcome {
            stmt.bind((":outcome", outcome))?;
        }
        if let Some(query) = &filter.query {
            stmt.bind((":query", format!("%{query}%").as_str()))?;
        }

        stmt.into_iter().map(|row| parse::decision(row?)).collect()
    }

    fn append_audit(&self, event: &audit::NewEvent) -> Result<i64, Error> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut stmt = self.db.prepare(
            "INSERT INTO `audit-events`
             (`event-type`, `actor`, `document`, `proposal`, `subject`, `payload`, `created-at`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.bind((1, &event.event_type))?;
        stmt.bind((2, &event.actor))?;
        stmt.bind((3, &event.document))?;
        stmt.bind((4, event.proposal.as_ref().map(|p| p.as_str())))?;
        stmt.bind((5, event.subject.as_deref()))?;
        stmt.bind((6, payload.as_str()))?;
        stmt.bind((7, millis(event.created_at)?))?;
        stmt.next()?;

        self.last_insert_id()
    }

    fn audit_trail(&self, document: &DocumentId, limit: usize) -> Result<Vec<audit::Event>, Error> {
        let mut stmt = self.db.prepare(format!(
            "SELECT `id`, `event-type`, `actor`, `document`, `proposal`, `subject`, `payload`,
                    `created-at`
             FROM `audit-events` WHERE `document` = ?1
             ORDER BY `id` DESC LIMIT {limit}",
        ))?;
        stmt.bind((1, document))?;

        stmt.into_iter().map(|row| parse::audit(row?)).collect()
    }

    fn ping(&self) -> Result<(), Error> {
        self.db.execute("SELECT 1")?;
        Ok(())
    }
}

fn millis(time: Timestamp) -> Result<i64, Error> {
    Ok(i64::try_from(time.as_millis())?)
}

fn time(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis.max(0) as u128)
}

mod parse {
    use std::str::FromStr;

    use super::*;
    use crate::gate::ReviewState;
    use crate::id::{AnnotationId, ChangeId};
    use crate::thread::{Anchor, Kind, Outcome, Status, Visibility};

    fn optional<T: FromStr>(value: Option<&str>, what: &str) -> Result<Option<T>, Error> {
        value
            .map(|s| T::from_str(s).map_err(|_| Error::Invalid(format!("{what}: {s:?}"))))
            .transpose()
    }

    pub fn document(row: sql::Row) -> Result<Document, Error> {
        Ok(Document {
            id: row.try_read::<DocumentId, _>("id")?,
            title: row.try_read::<&str, _>("title")?.to_owned(),
            subtitle: row.try_read::<&str, _>("subtitle")?.to_owned(),
            status: row.try_read::<&str, _>("status")?.to_owned(),
            space: row.try_read::<SpaceId, _>("space")?,
            parent: optional(row.try_read::<Option<&str>, _>("parent")?, "parent")?,
            sort_order: row.try_read::<i64, _>("sort-order")?,
            updated_by: optional(row.try_read::<Option<&str>, _>("updated-by")?, "updated-by")?,
        })
    }

    pub fn proposal(row: sql::Row) -> Result<Proposal, Error> {
        Ok(Proposal {
            id: row.try_read::<ProposalId, _>("id")?,
            document: row.try_read::<DocumentId, _>("document")?,
            title: row.try_read::<&str, _>("title")?.to_owned(),
            status: row.try_read::<ProposalStatus, _>("status")?,
            branch: row.try_read::<&str, _>("branch")?.to_owned(),
            target_branch: row.try_read::<&str, _>("target-branch")?.to_owned(),
            created_by: row.try_read::<ActorId, _>("created-by")?,
            created_at: time(row.try_read::<i64, _>("created-at")?),
        })
    }

    pub fn thread(row: sql::Row) -> Result<Thread, Error> {
        let offsets = row
            .try_read::<Option<&str>, _>("anchor-offsets")?
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Thread {
            id: row.try_read::<ThreadId, _>("id")?,
            proposal: row.try_read::<ProposalId, _>("proposal")?,
            anchor: Anchor {
                label: row.try_read::<&str, _>("anchor-label")?.to_owned(),
                node_id: row.try_read::<&str, _>("anchor-node")?.to_owned(),
                offsets,
            },
            body: row.try_read::<&str, _>("body")?.to_owned(),
            author: row.try_read::<ActorId, _>("author")?,
            kind: row.try_read::<Kind, _>("type")?,
            visibility: row.try_read::<Visibility, _>("visibility")?,
            status: row.try_read::<Status, _>("status")?,
            resolved_outcome: optional(
                row.try_read::<Option<&str>, _>("resolved-outcome")?,
                "resolved-outcome",
            )?,
            resolved_note: row
                .try_read::<Option<&str>, _>("resolved-note")?
                .map(ToOwned::to_owned),
            created_at: time(row.try_read::<i64, _>("created-at")?),
        })
    }

    pub fn annotation(row: sql::Row) -> Result<Annotation, Error> {
        Ok(Annotation {
            id: row.try_read::<AnnotationId, _>("id")?,
            proposal: row.try_read::<ProposalId, _>("proposal")?,
            thread: row.try_read::<ThreadId, _>("thread")?,
            author: row.try_read::<ActorId, _>("author")?,
            body: row.try_read::<&str, _>("body")?.to_owned(),
            kind: row.try_read::<Kind, _>("type")?,
            visibility: row.try_read::<Visibility, _>("visibility")?,
            created_at: time(row.try_read::<i64, _>("created-at")?),
        })
    }

    pub fn approval(row: sql::Row) -> Result<Approval, Error> {
        Ok(Approval {
            proposal: row.try_read::<ProposalId, _>("proposal")?,
            role: row.try_read::<approval::Role, _>("role")?,
            status: row.try_read::<approval::Status, _>("status")?,
            approved_by: optional(
                row.try_read::<Option<&str>, _>("approved-by")?,
                "approved-by",
            )?,
            approved_at: row
                .try_read::<Option<i64>, _>("approved-at")?
                .map(time),
        })
    }

    pub fn change_review(row: sql::Row) -> Result<ChangeReview, Error> {
        Ok(ChangeReview {
            proposal: row.try_read::<ProposalId, _>("proposal")?,
            change_id: row.try_read::<ChangeId, _>("change")?,
            from_ref: row.try_read::<&str, _>("from-ref")?.to_owned(),
            to_ref: row.try_read::<&str, _>("to-ref")?.to_owned(),
            state: row.try_read::<ReviewState, _>("state")?,
            node_id: row
                .try_read::<Option<&str>, _>("node")?
                .map(ToOwned::to_owned),
            rejected_rationale: row
                .try_read::<Option<&str>, _>("rejected-rationale")?
                .map(ToOwned::to_owned),
            reviewer: optional(row.try_read::<Option<&str>, _>("reviewer")?, "reviewer")?,
            reviewed_at: row
                .try_read::<Option<i64>, _>("reviewed-at")?
                .map(time),
        })
    }

    pub fn named_version(row: sql::Row) -> Result<NamedVersion, Error> {
        Ok(NamedVersion {
            proposal: row.try_read::<ProposalId, _>("proposal")?,
            label: row.try_read::<&str, _>("label")?.to_owned(),
            commit: row.try_read::<&str, _>("commit")?.to_owned(),
            tag: row.try_read::<&str, _>("tag")?.to_owned(),
            created_by: row.try_read::<ActorId, _>("created-by")?,
            created_at: time(row.try_read::<i64, _>("created-at")?),
        })
    }

    pub fn decision(row: sql::Row) -> Result<decision::Entry, Error> {
        let participants = serde_json::from_str(row.try_read::<&str, _>("participants")?)?;

        Ok(decision::Entry {
            id: row.try_read::<i64, _>("id")?,
            document: row.try_read::<DocumentId, _>("document")?,
            proposal: row.try_read::<ProposalId, _>("proposal")?,
            thread: row.try_read::<&str, _>("thread")?.to_owned(),
            outcome: row.try_read::<Outcome, _>("outcome")?,
            rationale: row
                .try_read::<Option<&str>, _>("rationale")?
                .map(ToOwned::to_owned),
            decided_by: row.try_read::<ActorId, _>("decided-by")?,
            commit: row.try_read::<&str, _>("commit")?.to_owned(),
            participants,
            decided_at: time(row.try_read::<i64, _>("decided-at")?),
        })
    }

    pub fn audit(row: sql::Row) -> Result<audit::Event, Error> {
        let payload = serde_json::from_str(row.try_read::<&str, _>("payload")?)?;

        Ok(audit::Event {
            id: row.try_read::<i64, _>("id")?,
            event_type: row.try_read::<audit::Kind, _>("event-type")?,
            actor: row.try_read::<ActorId, _>("actor")?,
            document: row.try_read::<DocumentId, _>("document")?,
            proposal: optional(row.try_read::<Option<&str>, _>("proposal")?, "proposal")?,
            subject: row
                .try_read::<Option<&str>, _>("subject")?
                .map(ToOwned::to_owned),
            payload,
            created_at: time(row.try_read::<i64, _>("created-at")?),
        })
    }
}
