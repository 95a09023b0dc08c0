use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::hash::store_hash;
use crate::util::fs::{commit_staging, copy_tree, prepare_staging, remove_path, symlink};

const ROOTS_DIR: &str = "roots";

/// Content-addressed artifact store.
///
/// Entries are immutable directories named `<hash>-<name>-<version>`; the
/// hash covers everything that identifies the artifact, so equal inputs
/// always land on the same path.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Live store paths recorded for one descriptor, consulted by cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRoot {
    pub descriptor: PathBuf,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, hash: &str, name: &str, version: &str) -> PathBuf {
        self.root.join(format!("{hash}-{name}-{version}"))
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create store directory {:?}", self.root))
    }

    /// Copy `source` into the store under an identity-derived path.
    pub fn add_tree(
        &self,
        identity: &[&str],
        name: &str,
        version: &str,
        source: &Path,
    ) -> Result<PathBuf> {
        let mut parts = vec!["tree", name, version];
        parts.extend_from_slice(identity);
        let dest = self.entry_path(&store_hash(parts), name, version);

        if dest.exists() {
            debug!(path = %dest.display(), "store entry already present");
            return Ok(dest);
        }

        self.ensure_root()?;
        let staging = prepare_staging(&dest)?;
        if let Err(err) = copy_tree(source, &staging) {
            remove_path(&staging)?;
            return Err(err);
        }
        commit_staging(&staging, &dest)?;
        debug!(path = %dest.display(), "added store entry");
        Ok(dest)
    }

    /// Symlink-merge `members` into one composite entry.
    ///
    /// Directories are recreated, files and symlinks are linked to the member
    /// that provides them. Two members providing the same path is an error.
    pub fn merge(&self, name: &str, version: &str, members: &[PathBuf]) -> Result<PathBuf> {
        let mut parts = vec!["merge".to_string(), name.to_string(), version.to_string()];
        parts.extend(members.iter().map(|member| member.display().to_string()));
        let dest = self.entry_path(&store_hash(parts), name, version);

        if dest.exists() {
            debug!(path = %dest.display(), "merged entry already present");
            return Ok(dest);
        }

        self.ensure_root()?;
        let staging = prepare_staging(&dest)?;
        if let Err(err) = link_members(name, members, &staging) {
            remove_path(&staging)?;
            return Err(err);
        }
        commit_staging(&staging, &dest)?;
        debug!(path = %dest.display(), members = members.len(), "merged store entry");
        Ok(dest)
    }

    /// Every committed entry in the store.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in
            fs::read_dir(&self.root).with_context(|| format!("Failed to list {:?}", self.root))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == ROOTS_DIR {
                continue;
            }
            entries.push(entry.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn roots_dir(&self) -> PathBuf {
        self.root.join(ROOTS_DIR)
    }

    fn root_file(&self, descriptor: &Path) -> PathBuf {
        let key = store_hash(["root", descriptor.display().to_string().as_str()]);
        self.roots_dir().join(format!("{key}.toml"))
    }

    /// Record the live paths of `descriptor`.
    pub fn register_root(&self, descriptor: &Path, paths: &BTreeSet<PathBuf>) -> Result<()> {
        let root = GcRoot {
            descriptor: descriptor.to_path_buf(),
            paths: paths.iter().cloned().collect(),
        };
        let file = self.root_file(descriptor);
        fs::create_dir_all(self.roots_dir())
            .with_context(|| format!("Failed to create {:?}", self.roots_dir()))?;
        let contents = toml::to_string_pretty(&root).context("Failed to serialize store root")?;

        if fs::read_to_string(&file).ok().as_deref() == Some(contents.as_str()) {
            return Ok(());
        }
        fs::write(&file, contents).with_context(|| format!("Failed to write {:?}", file))
    }

    /// All registered roots whose descriptor still exists; stale root files
    /// are removed.
    pub fn live_roots(&self) -> Result<Vec<GcRoot>> {
        let dir = self.roots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut roots = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let path = entry?.path();
            let contents =
                fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
            let root: GcRoot = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse store root {:?}", path))?;
            if root.descriptor.exists() {
                roots.push(root);
            } else {
                debug!(descriptor = %root.descriptor.display(), "dropping stale store root");
                remove_path(&path)?;
            }
        }
        Ok(roots)
    }
}

fn link_members(name: &str, members: &[PathBuf], dest: &Path) -> Result<()> {
    let mut owners: HashMap<PathBuf, PathBuf> = HashMap::new();

    for member in members {
        let walker = WalkDir::new(member)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {:?}", member))?;
            let relative = entry
                .path()
                .strip_prefix(member)
                .with_context(|| format!("Entry {:?} escaped {:?}", entry.path(), member))?
                .to_path_buf();
            let target = dest.join(&relative);
            let is_dir = entry.file_type().is_dir();

            if let Ok(existing) = target.symlink_metadata() {
                if is_dir && existing.is_dir() {
                    continue;
                }
                let first = owners
                    .get(&relative)
                    .cloned()
                    .unwrap_or_else(|| member.clone());
                return Err(BuildError::MergeCollision {
                    name: name.to_string(),
                    path: relative,
                    first,
                    second: member.clone(),
                }
                .into());
            }

            if is_dir {
                fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create directory {:?}", target))?;
            } else {
                let original = std::path::absolute(entry.path())
                    .with_context(|| format!("Failed to resolve {:?}", entry.path()))?;
                symlink(&original, &target)?;
            }
            owners.insert(relative, member.clone());
        }
    }

    Ok(())
}
