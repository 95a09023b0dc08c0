use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::descriptor::{is_valid_name, Descriptor};
use crate::error::BuildError;
use crate::fetch::{create_fetcher, FetchContext, SourceKind, SourceUrl};
use crate::hash::store_hash;
use crate::lockfile::{LockedNode, Lockfile};
use crate::ui;

/// Manifest an input tree may carry to declare its own dependencies.
pub const SOURCE_MANIFEST: &str = "source.toml";
const MAX_DEPTH: usize = 8;

#[derive(Debug, Default, Deserialize)]
struct SourceManifest {
    #[serde(default)]
    dependencies: BTreeMap<String, DependencySpec>,
}

#[derive(Debug, Deserialize)]
struct DependencySpec {
    url: String,
}

/// Which locked pins to ignore during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    None,
    All,
    Only(BTreeSet<String>),
}

impl Refresh {
    /// Whether `id` (or the top-level input it belongs to) is refreshed.
    fn covers(&self, id: &str) -> bool {
        match self {
            Refresh::None => false,
            Refresh::All => true,
            Refresh::Only(names) => {
                let top = id.split('/').next().unwrap_or(id);
                names.contains(top)
            }
        }
    }
}

/// One pinned node of the input graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub id: String,
    pub url: String,
    pub kind: SourceKind,
    pub root: PathBuf,
    /// Anchor for relative dependency locations
    pub origin: PathBuf,
    pub rev: Option<String>,
    pub hash: String,
    pub last_modified: Option<String>,
    /// Dependency name -> node id
    pub dependencies: BTreeMap<String, String>,
}

/// Every resolved node, keyed by node id.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    nodes: BTreeMap<String, ResolvedInput>,
}

impl ResolvedGraph {
    pub fn get(&self, id: &str) -> Option<&ResolvedInput> {
        self.nodes.get(id)
    }

    /// Top-level input by name.
    pub fn input(&self, name: &str) -> Result<&ResolvedInput, BuildError> {
        self.nodes.get(name).ok_or_else(|| BuildError::UnknownInput {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResolvedInput)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn insert(&mut self, node: ResolvedInput) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Identity of a node together with its whole dependency closure.
    ///
    /// Two nodes that follow the same snapshot produce the same closure hash
    /// for that dependency, so artifacts derived from them stay consistent.
    pub fn closure_hash(&self, id: &str) -> String {
        let mut visited = BTreeSet::new();
        self.closure_hash_inner(id, &mut visited)
    }

    fn closure_hash_inner(&self, id: &str, visited: &mut BTreeSet<String>) -> String {
        let Some(node) = self.nodes.get(id) else {
            return store_hash(["missing", id]);
        };
        if !visited.insert(id.to_string()) {
            return store_hash(["cycle", node.hash.as_str()]);
        }

        let mut parts = vec![node.hash.clone()];
        for (name, dependency) in &node.dependencies {
            parts.push(name.clone());
            parts.push(self.closure_hash_inner(dependency, visited));
        }
        visited.remove(id);
        store_hash(parts)
    }

    /// Check that every `follows` override points at the followed node.
    pub fn verify_follows(&self, descriptor: &Descriptor) -> Result<()> {
        for (name, spec) in &descriptor.inputs {
            let node = self.input(name)?;
            for (dependency, target) in &spec.follows {
                match node.dependencies.get(dependency) {
                    Some(id) if id == target => {
                        let followed = self.input(target)?;
                        debug!(
                            input = %name,
                            dependency = %dependency,
                            rev = ?followed.rev,
                            "dependency follows top-level input"
                        );
                    }
                    Some(id) => anyhow::bail!(
                        "input '{name}' resolved dependency '{dependency}' to '{id}' instead of following '{target}'"
                    ),
                    None => {}
                }
            }
        }
        Ok(())
    }

    pub fn to_lockfile(&self) -> Lockfile {
        let mut lockfile = Lockfile::new();
        for (id, node) in &self.nodes {
            lockfile.insert(
                id.clone(),
                LockedNode {
                    url: node.url.clone(),
                    kind: node.kind.as_str().to_string(),
                    rev: node.rev.clone(),
                    hash: node.hash.clone(),
                    last_modified: node.last_modified.clone(),
                    dependencies: node.dependencies.clone(),
                },
            );
        }
        lockfile
    }
}

/// Resolves the descriptor's inputs into a pinned graph.
pub struct Resolver<'a> {
    descriptor: &'a Descriptor,
    lockfile: &'a Lockfile,
    base_dir: &'a Path,
    context: &'a FetchContext,
    refresh: Refresh,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(
        descriptor: &'a Descriptor,
        lockfile: &'a Lockfile,
        base_dir: &'a Path,
        context: &'a FetchContext,
        refresh: Refresh,
    ) -> Self {
        Self {
            descriptor,
            lockfile,
            base_dir,
            context,
            refresh,
        }
    }

    /// Resolve every declared input. Any failure aborts the whole graph.
    pub fn resolve(&self) -> Result<ResolvedGraph> {
        let mut graph = ResolvedGraph::default();

        for (name, spec) in &self.descriptor.inputs {
            self.resolve_node(name, &spec.url, self.base_dir, &mut graph)?;
        }

        for (name, spec) in &self.descriptor.inputs {
            self.resolve_dependencies(name, &spec.follows, 1, &mut graph)?;
        }

        graph.verify_follows(self.descriptor)?;
        Ok(graph)
    }

    fn locked(&self, id: &str, url: &str) -> Option<&'a LockedNode> {
        if self.refresh.covers(id) {
            return None;
        }
        self.lockfile.node(id).filter(|node| node.url == url)
    }

    fn resolve_node(
        &self,
        id: &str,
        url: &str,
        base_dir: &Path,
        graph: &mut ResolvedGraph,
    ) -> Result<()> {
        let source = SourceUrl::parse(url)?;
        let locked = self.locked(id, url);
        let fetcher = create_fetcher(&source);

        let progress = ui::Progress::new("Resolving", id);
        let fetched = match fetcher.fetch(id, locked, base_dir, self.context) {
            Ok(fetched) => fetched,
            Err(err) => {
                progress.fail("Failed", format!("{err:#}"));
                return Err(err);
            }
        };
        let detail = fetched
            .rev
            .as_deref()
            .map(|rev| format!("@ {}", &rev[..rev.len().min(12)]));
        progress.success("Resolved", detail);

        graph.insert(ResolvedInput {
            id: id.to_string(),
            url: url.to_string(),
            kind: source.kind(),
            root: fetched.root,
            origin: fetched.origin,
            rev: fetched.rev,
            hash: fetched.hash,
            last_modified: fetched.last_modified,
            dependencies: BTreeMap::new(),
        });
        Ok(())
    }

    fn resolve_dependencies(
        &self,
        id: &str,
        follows: &BTreeMap<String, String>,
        depth: usize,
        graph: &mut ResolvedGraph,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(BuildError::RecursionLimit {
                node: id.to_string(),
            }
            .into());
        }

        let (root, origin) = graph
            .get(id)
            .map(|node| (node.root.clone(), node.origin.clone()))
            .with_context(|| format!("Node '{id}' was not resolved"))?;
        let manifest = load_source_manifest(&root)?;

        for dependency in follows.keys() {
            if !manifest.dependencies.contains_key(dependency) {
                warn!(input = id, dependency = %dependency, "follows override for undeclared dependency");
                ui::warn(format!(
                    "input '{id}' has no dependency named '{dependency}'; ignoring its follows override"
                ));
            }
        }

        let mut resolved = BTreeMap::new();
        for (dependency, spec) in &manifest.dependencies {
            if !is_valid_name(dependency) {
                anyhow::bail!("input '{id}' declares invalid dependency name '{dependency}'");
            }

            if let Some(target) = follows.get(dependency) {
                resolved.insert(dependency.clone(), target.clone());
                continue;
            }

            let child = format!("{id}/{dependency}");
            self.resolve_node(&child, &spec.url, &origin, graph)?;
            self.resolve_dependencies(&child, &BTreeMap::new(), depth + 1, graph)?;
            resolved.insert(dependency.clone(), child);
        }

        if let Some(node) = graph.nodes.get_mut(id) {
            node.dependencies = resolved;
        }
        Ok(())
    }
}

fn load_source_manifest(root: &Path) -> Result<SourceManifest> {
    let path = root.join(SOURCE_MANIFEST);
    if !path.exists() {
        return Ok(SourceManifest::default());
    }

    let contents =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}
