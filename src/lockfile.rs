use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const LOCKFILE_NAME: &str = "devshell.lock";
const LOCKFILE_VERSION: u32 = 1;

/// Lockfile format (similar to Cargo.lock)
/// Records the pinned state of every resolved input node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    /// Version of the lockfile format
    version: u32,
    /// Resolved nodes keyed by node id (`name` or `parent/name`)
    #[serde(default)]
    nodes: BTreeMap<String, LockedNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedNode {
    /// URL as written in the descriptor or dependency manifest
    pub url: String,
    /// Source kind (path | git | tarball)
    pub kind: String,
    /// Commit id for git inputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Tree hash (`sha256:<hex>`)
    pub hash: String,
    /// Commit time for git inputs (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Dependency name -> node id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockfile {
    /// Create a new, empty lockfile
    pub fn new() -> Self {
        Self {
            version: LOCKFILE_VERSION,
            nodes: BTreeMap::new(),
        }
    }

    /// Load lockfile from disk, or an empty one if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Load lockfile from disk
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lockfile from {:?}", path))?;

        let lockfile: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse lockfile from {:?}", path))?;

        if lockfile.version != LOCKFILE_VERSION {
            bail!(
                "Unsupported lockfile version {} in {:?} (expected {})",
                lockfile.version,
                path,
                LOCKFILE_VERSION
            );
        }

        Ok(lockfile)
    }

    /// Save lockfile to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lockfile directory {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize lockfile")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write lockfile to {:?}", path))?;

        Ok(())
    }

    /// Save only when the on-disk content differs. Returns whether it wrote.
    pub fn save_if_changed(&self, path: &Path) -> Result<bool> {
        if path.exists() {
            if let Ok(existing) = Self::load(path) {
                if &existing == self {
                    return Ok(false);
                }
            }
        }
        self.save(path)?;
        Ok(true)
    }

    pub fn insert(&mut self, id: impl Into<String>, node: LockedNode) {
        self.nodes.insert(id.into(), node);
    }

    pub fn node(&self, id: &str) -> Option<&LockedNode> {
        self.nodes.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(url: &str, rev: Option<&str>) -> LockedNode {
        LockedNode {
            url: url.to_string(),
            kind: if rev.is_some() { "git" } else { "path" }.to_string(),
            rev: rev.map(str::to_string),
            hash: "sha256:00".to_string(),
            last_modified: None,
            dependencies: BTreeMap::new(),
        }
    }

    #[test]
    fn test_lockfile_new() {
        let lockfile = Lockfile::new();
        assert_eq!(lockfile.version, 1);
        assert!(lockfile.nodes.is_empty());
    }

    #[test]
    fn test_lockfile_save_load() {
        let temp = TempDir::new().unwrap();
        let lockfile_path = temp.path().join(LOCKFILE_NAME);

        let mut lockfile = Lockfile::new();
        lockfile.insert("nixpkgs", node("git+https://example.org/pkgs", Some("abc123")));
        let mut overlay = node("path:./overlay", None);
        overlay
            .dependencies
            .insert("nixpkgs".to_string(), "nixpkgs".to_string());
        lockfile.insert("rust-overlay", overlay);
        lockfile.insert("rust-overlay/flake-utils", node("path:./utils", None));

        lockfile.save(&lockfile_path).unwrap();
        let loaded = Lockfile::load(&lockfile_path).unwrap();

        assert_eq!(loaded, lockfile);
        assert_eq!(loaded.node("nixpkgs").unwrap().rev.as_deref(), Some("abc123"));
        assert_eq!(
            loaded.node("rust-overlay").unwrap().dependencies["nixpkgs"],
            "nixpkgs"
        );
    }

    #[test]
    fn test_save_if_changed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LOCKFILE_NAME);

        let mut lockfile = Lockfile::new();
        lockfile.insert("pico", node("path:./pico", None));

        assert!(lockfile.save_if_changed(&path).unwrap());
        assert!(!lockfile.save_if_changed(&path).unwrap());

        lockfile.insert("extra", node("path:./extra", None));
        assert!(lockfile.save_if_changed(&path).unwrap());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LOCKFILE_NAME);
        fs::write(&path, "version = 7\n").unwrap();

        let err = Lockfile::load(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported lockfile version 7"));
    }
}
