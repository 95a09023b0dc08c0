use anyhow::{Context, Result};
use chrono::DateTime;
use git2::build::CheckoutBuilder;
use git2::{Direction, Oid, Repository};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{verify_hash, FetchContext, Fetched, InputFetcher};
use crate::error::BuildError;
use crate::hash::{format_digest, hash_tree, store_hash};
use crate::lockfile::LockedNode;
use crate::util::fs::{commit_staging, prepare_staging};

const FETCH_REFSPECS: &[&str] = &[
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];
const DEFAULT_HEAD: &str = "refs/remotes/origin/HEAD";

/// Git repository input, fetched into a bare cache repository and checked
/// out per commit.
pub(crate) struct GitFetcher {
    url: String,
    reference: Option<String>,
    rev: Option<String>,
}

impl GitFetcher {
    pub(crate) fn new(url: &str, reference: Option<String>, rev: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            reference,
            rev,
        }
    }

    fn failed(&self, name: &str, reason: impl ToString) -> BuildError {
        BuildError::FetchFailed {
            name: name.to_string(),
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    fn cache_path(&self, context: &FetchContext) -> PathBuf {
        context
            .git_dir
            .join(format!("{}.git", &store_hash(["git", self.url.as_str()])[..16]))
    }

    fn open_cache(&self, context: &FetchContext) -> Result<Repository> {
        let path = self.cache_path(context);
        if path.exists() {
            Repository::open_bare(&path)
                .with_context(|| format!("Failed to open git cache {:?}", path))
        } else {
            fs::create_dir_all(&context.git_dir).with_context(|| {
                format!("Failed to create git cache directory {:?}", context.git_dir)
            })?;
            Repository::init_bare(&path)
                .with_context(|| format!("Failed to initialize git cache {:?}", path))
        }
    }

    /// Fetch all branches and tags, recording the remote default branch as
    /// `refs/remotes/origin/HEAD`.
    fn update_cache(&self, name: &str, repo: &Repository) -> Result<()> {
        info!(input = name, url = %self.url, "fetching git repository");
        let mut remote = repo
            .remote_anonymous(&self.url)
            .map_err(|err| self.failed(name, err))?;

        remote
            .connect(Direction::Fetch)
            .map_err(|err| self.failed(name, err))?;
        let default_branch = remote
            .default_branch()
            .ok()
            .and_then(|buf| buf.as_str().map(str::to_string));
        remote.disconnect().map_err(|err| self.failed(name, err))?;

        remote
            .fetch(FETCH_REFSPECS, None, None)
            .map_err(|err| self.failed(name, err))?;

        let advertised = default_branch
            .as_deref()
            .and_then(|value| value.strip_prefix("refs/heads/"))
            .map(str::to_string);
        let candidates = advertised
            .into_iter()
            .chain(["main".to_string(), "master".to_string()]);

        for branch in candidates {
            if let Ok(oid) = repo.refname_to_id(&format!("refs/remotes/origin/{branch}")) {
                repo.reference(DEFAULT_HEAD, oid, true, "devshell: remote default branch")
                    .context("Failed to record remote default branch")?;
                break;
            }
        }

        Ok(())
    }

    fn resolve_reference(&self, name: &str, repo: &Repository) -> Result<Oid> {
        let candidates = match &self.reference {
            Some(reference) => vec![
                format!("refs/remotes/origin/{reference}"),
                format!("refs/tags/{reference}"),
            ],
            None => vec![DEFAULT_HEAD.to_string()],
        };

        for candidate in &candidates {
            if let Ok(reference) = repo.find_reference(candidate) {
                let commit = reference
                    .peel_to_commit()
                    .with_context(|| format!("Reference {candidate} does not point to a commit"))?;
                return Ok(commit.id());
            }
        }

        Err(self
            .failed(
                name,
                format!(
                    "reference '{}' not found",
                    self.reference.as_deref().unwrap_or("HEAD")
                ),
            )
            .into())
    }

    fn resolve_commit(
        &self,
        name: &str,
        locked: Option<&LockedNode>,
        repo: &Repository,
        context: &FetchContext,
    ) -> Result<Oid> {
        let pinned = self
            .rev
            .clone()
            .or_else(|| locked.and_then(|node| node.rev.clone()));

        match pinned {
            Some(rev) => {
                let oid = Oid::from_str(&rev).map_err(|err| self.failed(name, err))?;
                if repo.find_commit(oid).is_err() {
                    if context.offline {
                        return Err(BuildError::NotCached {
                            name: name.to_string(),
                        }
                        .into());
                    }
                    self.update_cache(name, repo)?;
                }
                repo.find_commit(oid)
                    .map(|commit| commit.id())
                    .map_err(|_| self.failed(name, format!("revision {rev} not found")).into())
            }
            None => {
                if context.offline {
                    return self.resolve_reference(name, repo).map_err(|_| {
                        BuildError::NotCached {
                            name: name.to_string(),
                        }
                        .into()
                    });
                }
                self.update_cache(name, repo)?;
                self.resolve_reference(name, repo)
            }
        }
    }

    fn checkout(&self, repo: &Repository, oid: Oid, dest: &Path) -> Result<()> {
        let staging = prepare_staging(dest)?;
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Commit {oid} missing from git cache"))?;

        let mut builder = CheckoutBuilder::new();
        builder
            .target_dir(&staging)
            .force()
            .recreate_missing(true)
            .update_index(false);
        repo.checkout_tree(commit.as_object(), Some(&mut builder))
            .with_context(|| format!("Failed to check out {oid} into {:?}", staging))?;

        commit_staging(&staging, dest)
    }
}

impl InputFetcher for GitFetcher {
    fn fetch(
        &self,
        name: &str,
        locked: Option<&LockedNode>,
        _base_dir: &Path,
        context: &FetchContext,
    ) -> Result<Fetched> {
        let repo = self.open_cache(context)?;
        let oid = self.resolve_commit(name, locked, &repo, context)?;
        let rev = oid.to_string();

        let dest = context.sources_dir.join(format!("git-{rev}"));
        if dest.exists() {
            debug!(input = name, rev = %rev, "reusing checked out source tree");
        } else {
            fs::create_dir_all(&context.sources_dir).with_context(|| {
                format!("Failed to create sources directory {:?}", context.sources_dir)
            })?;
            self.checkout(&repo, oid, &dest)?;
        }

        let hash = format_digest(&hash_tree(&dest)?);
        // Only enforce the locked hash when the lock pinned this very commit.
        if locked.and_then(|node| node.rev.as_deref()) == Some(rev.as_str()) {
            verify_hash(name, locked, &hash)?;
        }

        let commit = repo.find_commit(oid)?;
        let last_modified = DateTime::from_timestamp(commit.time().seconds(), 0)
            .map(|time| time.to_rfc3339());

        Ok(Fetched {
            origin: dest.clone(),
            root: dest,
            rev: Some(rev),
            hash,
            last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn commit_file(repo: &Repository, path: &str, contents: &str) -> Oid {
        let workdir = repo.workdir().unwrap();
        let file = workdir.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, contents).unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(path)).unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parents: Vec<_> = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<_> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "update", &tree, &parent_refs)
            .unwrap()
    }

    fn context(temp: &TempDir, offline: bool) -> FetchContext {
        FetchContext {
            sources_dir: temp.path().join("cache/sources"),
            git_dir: temp.path().join("cache/git"),
            downloads_dir: temp.path().join("cache/downloads"),
            offline,
        }
    }

    fn locked(url: &str, fetched: &Fetched) -> LockedNode {
        LockedNode {
            url: url.to_string(),
            kind: "git".to_string(),
            rev: fetched.rev.clone(),
            hash: fetched.hash.clone(),
            last_modified: fetched.last_modified.clone(),
            dependencies: Default::default(),
        }
    }

    #[test]
    fn fetches_default_branch_and_honors_lock() {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin");
        let repo = Repository::init(&origin).unwrap();
        let first = commit_file(&repo, "packages/README", "v1");

        let url = format!("file://{}", origin.display());
        let fetcher = GitFetcher::new(&url, None, None);
        let fetched = fetcher
            .fetch("index", None, temp.path(), &context(&temp, false))
            .unwrap();

        assert_eq!(fetched.rev.as_deref(), Some(first.to_string().as_str()));
        assert!(fetched.last_modified.is_some());
        assert_eq!(
            fs::read_to_string(fetched.root.join("packages/README")).unwrap(),
            "v1"
        );

        // A new upstream commit does not move a locked input.
        commit_file(&repo, "packages/README", "v2");
        let lock = locked(&url, &fetched);
        let again = fetcher
            .fetch("index", Some(&lock), temp.path(), &context(&temp, false))
            .unwrap();
        assert_eq!(again, fetched);

        // Without the lock the branch tip is tracked.
        let updated = fetcher
            .fetch("index", None, temp.path(), &context(&temp, false))
            .unwrap();
        assert_ne!(updated.rev, fetched.rev);
        assert_eq!(
            fs::read_to_string(updated.root.join("packages/README")).unwrap(),
            "v2"
        );
    }

    #[test]
    fn explicit_reference_is_resolved() {
        let temp = TempDir::new().unwrap();
        let origin = temp.path().join("origin");
        let repo = Repository::init(&origin).unwrap();
        let base = commit_file(&repo, "file", "base");
        let base_commit = repo.find_commit(base).unwrap();
        repo.branch("unstable", &base_commit, false).unwrap();
        commit_file(&repo, "file", "tip");

        let url = format!("file://{}", origin.display());
        let fetcher = GitFetcher::new(&url, Some("unstable".to_string()), None);
        let fetched = fetcher
            .fetch("index", None, temp.path(), &context(&temp, false))
            .unwrap();

        assert_eq!(fetched.rev, Some(base.to_string()));
    }

    #[test]
    fn offline_without_cache_fails() {
        let temp = TempDir::new().unwrap();
        let fetcher = GitFetcher::new("https://example.invalid/repo.git", None, None);
        let err = fetcher
            .fetch("remote", None, temp.path(), &context(&temp, true))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::NotCached { .. })
        ));
    }

    #[test]
    fn unreachable_remote_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("does-not-exist");
        let fetcher = GitFetcher::new(&format!("file://{}", missing.display()), None, None);
        let err = fetcher
            .fetch("remote", None, temp.path(), &context(&temp, false))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::FetchFailed { .. })
        ));
    }
}
