//! Git implementation of the repository seam using the `git2` crate. One
//! bare repository per document; the content payload lives as a single JSON
//! blob at the root of every commit's tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::content::Content;
use crate::id::DocumentId;
use crate::repo::{CommitInfo, Error, MAINLINE};
use crate::Timestamp;

/// File the content payload is stored under in every tree.
const CONTENT_FILE: &str = "content.json";
/// Committer email recorded on every signature.
const COMMIT_EMAIL: &str = "chronicle@localhost";

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open a storage root, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();

        match fs::create_dir_all(&root) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(Error::Io(err)),
            Ok(()) => {}
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    fn path_of(&self, id: &DocumentId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl super::Storage for Storage {
    type Repository = Repository;

    fn ensure(
        &self,
        id: &DocumentId,
        initial: &Content,
        actor: &str,
    ) -> Result<Self::Repository, Error> {
        if self.contains(id)? {
            return self.open(id);
        }
        let backend = git2::Repository::init_opts(
            self.path_of(id),
            git2::RepositoryInitOptions::new()
                .bare(true)
                .no_reinit(true)
                .external_template(false),
        )?;
        let repo = Repository {
            id: id.clone(),
            backend,
        };
        let tree = repo.write_content(initial)?;
        {
            let tree = repo.backend.find_tree(tree)?;
            let sig = signature(actor)?;
            repo.backend.commit(
                Some(&refname(MAINLINE)),
                &sig,
                &sig,
                "Initialize document",
                &tree,
                &[],
            )?;
        }
        log::debug!(target: "repo", "Created repository for document {id}");

        Ok(repo)
    }

    fn open(&self, id: &DocumentId) -> Result<Self::Repository, Error> {
        let backend = git2::Repository::open_ext(
            self.path_of(id),
            git2::RepositoryOpenFlags::empty()
                | git2::RepositoryOpenFlags::BARE
                | git2::RepositoryOpenFlags::NO_DOTGIT
                | git2::RepositoryOpenFlags::NO_SEARCH,
            &[] as &[&std::ffi::OsStr],
        )
        .map_err(|e| {
            if e.code() == git2::ErrorCode::NotFound {
                Error::RepositoryNotFound(id.clone())
            } else {
                Error::Git(e)
            }
        })?;

        Ok(Repository {
            id: id.clone(),
            backend,
        })
    }

    fn contains(&self, id: &DocumentId) -> Result<bool, Error> {
        Ok(self.path_of(id).exists())
    }
}

/// Git repository of one document.
pub struct Repository {
    pub id: DocumentId,
    backend: git2::Repository,
}

impl Repository {
    fn branch_commit(&self, branch: &str) -> Result<git2::Commit, Error> {
        let oid = self
            .backend
            .refname_to_id(&refname(branch))
            .map_err(|_| Error::BranchNotFound(branch.to_owned()))?;
        Ok(self.backend.find_commit(oid)?)
    }

    fn find_commit(&self, hash: &str) -> Result<git2::Commit, Error> {
        let oid =
            git2::Oid::from_str(hash).map_err(|_| Error::CommitNotFound(hash.to_owned()))?;
        self.backend
            .find_commit(oid)
            .map_err(|_| Error::CommitNotFound(hash.to_owned()))
    }

    fn write_content(&self, content: &Content) -> Result<git2::Oid, Error> {
        let data = serde_json::to_vec_pretty(content)?;
        let blob = self.backend.blob(&data)?;
        let mut builder = self.backend.treebuilder(None)?;
        builder.insert(CONTENT_FILE, blob, 0o100_644)?;

        Ok(builder.write()?)
    }

    fn read_content(&self, commit: &git2::Commit) -> Result<Content, Error> {
        let tree = commit.tree()?;
        let entry = tree
            .get_name(CONTENT_FILE)
            .ok_or_else(|| Error::CommitNotFound(commit.id().to_string()))?;
        let blob = self.backend.find_blob(entry.id())?;

        Ok(serde_json::from_slice(blob.content())?)
    }

    fn info(&self, commit: &git2::Commit) -> Result<CommitInfo, Error> {
        let tree = commit.tree()?;
        let parent_tree = commit.parents().next().map(|p| p.tree()).transpose()?;
        let diff = self
            .backend
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
        let stats = diff.stats()?;
        let seconds = commit.time().seconds().max(0) as u128;

        Ok(CommitInfo {
            hash: commit.id().to_string(),
            author: commit.author().name().unwrap_or_default().to_owned(),
            message: commit.message().unwrap_or_default().to_owned(),
            timestamp: Timestamp::from_millis(seconds * 1000),
            additions: stats.insertions(),
            deletions: stats.deletions(),
        })
    }
}

impl super::Repository for Repository {
    fn ensure_branch(&self, branch: &str, from: &str) -> Result<(), Error> {
        if self.backend.refname_to_id(&refname(branch)).is_ok() {
            return Ok(());
        }
        let from = self.branch_commit(from)?;
        self.backend.branch(branch, &from, false)?;
        log::debug!(target: "repo", "Created branch {branch:?} in {}", self.id);

        Ok(())
    }

    fn commit(
        &self,
        branch: &str,
        content: &Content,
        author: &str,
        message: &str,
    ) -> Result<CommitInfo, Error> {
        let parent = self.branch_commit(branch)?;
        let tree = self.backend.find_tree(self.write_content(content)?)?;
        let sig = signature(author)?;
        let oid = self.backend.commit(
            Some(&refname(branch)),
            &sig,
            &sig,
            message,
            &tree,
            &[&parent],
        )?;
        log::debug!(target: "repo", "Committed {oid} on {branch:?} in {}", self.id);

        self.info(&self.backend.find_commit(oid)?)
    }

    fn head(&self, branch: &str) -> Result<(Content, CommitInfo), Error> {
        let commit = self.branch_commit(branch)?;
        let content = self.read_content(&commit)?;
        let info = self.info(&commit)?;

        Ok((content, info))
    }

    fn history(&self, branch: &str, limit: usize) -> Result<Vec<CommitInfo>, Error> {
        let head = self.branch_commit(branch)?;
        let mut walk = self.backend.revwalk()?;
        walk.push(head.id())?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in walk.take(limit) {
            let commit = self.backend.find_commit(oid?)?;
            commits.push(self.info(&commit)?);
        }
        Ok(commits)
    }

    fn content_at(&self, hash: &str) -> Result<Content, Error> {
        let commit = self.find_commit(hash)?;
        self.read_content(&commit)
    }

    fn commit_at(&self, hash: &str) -> Result<CommitInfo, Error> {
        let commit = self.find_commit(hash)?;
        self.info(&commit)
    }

    fn tag(&self, hash: &str, name: &str) -> Result<(), Error> {
        let commit = self.find_commit(hash)?;
        let tag_ref = format!("refs/tags/{name}");

        match self.backend.refname_to_id(&tag_ref) {
            Ok(existing) if existing == commit.id() => Ok(()),
            Ok(_) => Err(Error::TagConflict(name.to_owned())),
            Err(_) => {
                self.backend
                    .reference(&tag_ref, commit.id(), false, "named version")?;
                Ok(())
            }
        }
    }

    fn merge_into_main(
        &self,
        branch: &str,
        actor: &str,
        message: &str,
    ) -> Result<CommitInfo, Error> {
        let main = self.branch_commit(MAINLINE)?;
        let source = self.branch_commit(branch)?;
        let tree = source.tree()?;
        let sig = signature(actor)?;
        let oid = self.backend.commit(
            Some(&refname(MAINLINE)),
            &sig,
            &sig,
            message,
            &tree,
            &[&main, &source],
        )?;
        log::info!(target: "repo", "Merged {branch:?} into {MAINLINE:?} in {} at {oid}", self.id);

        self.info(&self.backend.find_commit(oid)?)
    }
}

fn refname(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

fn signature(actor: &str) -> Result<git2::Signature<'static>, Error> {
    let name = if actor.trim().is_empty() {
        "chronicle"
    } else {
        actor
    };
    Ok(git2::Signature::now(name, COMMIT_EMAIL)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{Repository as _, Storage as _};
    use pretty_assertions::assert_eq;

    fn content(title: &str) -> Content {
        Content {
            title: title.to_owned(),
            ..Content::default()
        }
    }

    fn setup() -> (tempfile::TempDir, Storage, DocumentId) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path().join("repos")).unwrap();
        let id = DocumentId::generate();

        (tmp, storage, id)
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (_tmp, storage, id) = setup();

        let repo = storage.ensure(&id, &content("Baseline"), "alice").unwrap();
        let (_, first) = repo.head(MAINLINE).unwrap();

        let repo = storage.ensure(&id, &content("Other"), "bob").unwrap();
        let (head, second) = repo.head(MAINLINE).unwrap();

        assert_eq!(first.hash, second.hash);
        assert_eq!(head.title, "Baseline");
    }

    #[test]
    fn test_commit_and_history() {
        let (_tmp, storage, id) = setup();
        let repo = storage.ensure(&id, &content("v0"), "alice").unwrap();

        let c1 = repo.commit(MAINLINE, &content("v1"), "alice", "First").unwrap();
        let c2 = repo.commit(MAINLINE, &content("v2"), "bob", "Second").unwrap();

        let history = repo.history(MAINLINE, 16).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].hash, c2.hash);
        assert_eq!(history[1].hash, c1.hash);
        assert_eq!(history[0].author, "bob");

        let at = repo.content_at(&c1.hash).unwrap();
        assert_eq!(at.title, "v1");
    }

    #[test]
    fn test_ensure_branch_never_resets() {
        let (_tmp, storage, id) = setup();
        let repo = storage.ensure(&id, &content("v0"), "alice").unwrap();

        repo.ensure_branch("proposal-x", MAINLINE).unwrap();
        let c1 = repo
            .commit("proposal-x", &content("v1"), "alice", "Work")
            .unwrap();

        // Re-ensuring keeps the branch where it is.
        repo.ensure_branch("proposal-x", MAINLINE).unwrap();
        let (_, head) = repo.head("proposal-x").unwrap();
        assert_eq!(head.hash, c1.hash);
    }

    #[test]
    fn test_tag_idempotence_and_conflict() {
        let (_tmp, storage, id) = setup();
        let repo = storage.ensure(&id, &content("v0"), "alice").unwrap();
        let c1 = repo.commit(MAINLINE, &content("v1"), "alice", "First").unwrap();
        let c2 = repo.commit(MAINLINE, &content("v2"), "alice", "Second").unwrap();

        repo.tag(&c1.hash, "nv-draft-abc").unwrap();
        repo.tag(&c1.hash, "nv-draft-abc").unwrap();

        let err = repo.tag(&c2.hash, "nv-draft-abc").unwrap_err();
        assert!(matches!(err, Error::TagConflict(_)));
    }

    #[test]
    fn test_merge_advances_mainline_without_rewinding() {
        let (_tmp, storage, id) = setup();
        let repo = storage.ensure(&id, &content("v0"), "alice").unwrap();
        let (_, base) = repo.head(MAINLINE).unwrap();

        repo.ensure_branch("proposal-x", MAINLINE).unwrap();
        let tip = repo
            .commit("proposal-x", &content("v1"), "alice", "Work")
            .unwrap();

        let merge = repo
            .merge_into_main("proposal-x", "carol", "Merge proposal-x")
            .unwrap();
        let (head, info) = repo.head(MAINLINE).unwrap();

        assert_eq!(info.hash, merge.hash);
        assert_eq!(head.title, "v1");

        // The merge commit descends from the old mainline head.
        let history = repo.history(MAINLINE, 16).unwrap();
        let hashes: Vec<&str> = history.iter().map(|c| c.hash.as_str()).collect();
        assert!(hashes.contains(&base.hash.as_str()));
        assert!(hashes.contains(&tip.hash.as_str()));
        assert_eq!(hashes[0], merge.hash.as_str());
    }

    #[test]
    fn test_missing_branch_is_not_found() {
        let (_tmp, storage, id) = setup();
        let repo = storage.ensure(&id, &content("v0"), "alice").unwrap();

        let err = repo.head("nope").unwrap_err();
        assert!(matches!(err, Error::BranchNotFound(_)));
    }
}
