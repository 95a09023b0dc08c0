use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{source_dir_name, verify_hash, FetchContext, Fetched, InputFetcher};
use crate::error::BuildError;
use crate::hash::{format_digest, hash_tree};
use crate::lockfile::LockedNode;
use crate::util::fs::{commit_staging, copy_tree, prepare_staging};

/// Local directory input. The tree is copied into the source cache so later
/// edits to the original cannot change a locked shell.
pub(crate) struct PathFetcher {
    path: String,
}

impl PathFetcher {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }

    fn locate(&self, name: &str, base_dir: &Path) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.path)
            .with_context(|| format!("Failed to expand path '{}'", self.path))?;
        let candidate = PathBuf::from(expanded.as_ref());
        let candidate = if candidate.is_absolute() {
            candidate
        } else {
            base_dir.join(candidate)
        };

        if !candidate.is_dir() {
            return Err(BuildError::FetchFailed {
                name: name.to_string(),
                url: format!("path:{}", self.path),
                reason: format!("{:?} is not a directory", candidate),
            }
            .into());
        }

        candidate
            .canonicalize()
            .with_context(|| format!("Failed to canonicalize {:?}", candidate))
    }
}

impl InputFetcher for PathFetcher {
    fn fetch(
        &self,
        name: &str,
        locked: Option<&LockedNode>,
        base_dir: &Path,
        context: &FetchContext,
    ) -> Result<Fetched> {
        let origin = self.locate(name, base_dir)?;
        let hash = format_digest(&hash_tree(&origin)?);
        verify_hash(name, locked, &hash)?;

        let dest = context.sources_dir.join(source_dir_name(&hash));
        if dest.exists() {
            debug!(input = name, path = %dest.display(), "reusing cached source tree");
        } else {
            debug!(input = name, origin = %origin.display(), "copying path input");
            let staging = prepare_staging(&dest)?;
            copy_tree(&origin, &staging)?;
            commit_staging(&staging, &dest)?;
        }

        Ok(Fetched {
            root: dest,
            origin,
            rev: None,
            hash,
            last_modified: None,
        })
    }
}
