use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::descriptor::ToolchainSpec;
use crate::error::BuildError;
use crate::platform::System;
use crate::resolve::{ResolvedGraph, ResolvedInput};
use crate::store::Store;
use crate::ui;

const CHANNELS_FILE: &str = "channels.toml";
const TOOLCHAINS_DIR: &str = "toolchains";
const MANIFEST_FILE: &str = "manifest.toml";
const TARGETS_DIR: &str = "targets";
const BUNDLE_NAME: &str = "rust-toolchain";

/// Installable toolchain component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Rustc,
    Cargo,
    Clippy,
    Rustfmt,
    RustSrc,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Rustc,
        Component::Cargo,
        Component::Clippy,
        Component::Rustfmt,
        Component::RustSrc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Component::Rustc => "rustc",
            Component::Cargo => "cargo",
            Component::Clippy => "clippy",
            Component::Rustfmt => "rustfmt",
            Component::RustSrc => "rust-src",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, BuildError> {
        Component::ALL
            .iter()
            .copied()
            .find(|component| component.as_str() == name.trim())
            .ok_or_else(|| BuildError::UnknownComponent {
                name: name.to_string(),
            })
    }

    /// Parse a component selection into canonical order.
    ///
    /// Duplicates collapse, unknown names fail, and the compiler driver must
    /// be part of every selection.
    pub fn select(names: &[String]) -> Result<Vec<Component>> {
        let mut selected = Vec::new();
        for name in names {
            let component = Component::from_name(name)?;
            if !selected.contains(&component) {
                selected.push(component);
            }
        }

        if !selected.contains(&Component::Rustc) {
            bail!("toolchain component 'rustc' is required");
        }

        selected.sort();
        Ok(selected)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct Channels {
    #[serde(default)]
    channels: BTreeMap<String, String>,
}

/// `toolchains/<version>/manifest.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolchainManifest {
    pub version: String,
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
}

/// Read-only view of a resolved input laid out as a toolchain provider.
pub struct ToolchainProvider<'a> {
    input: &'a ResolvedInput,
}

impl<'a> ToolchainProvider<'a> {
    pub fn new(input: &'a ResolvedInput) -> Self {
        Self { input }
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.input.root.join(TOOLCHAINS_DIR).join(version)
    }

    /// Map a channel name to a pinned version. A channel that is itself a
    /// published version resolves to that version.
    pub fn resolve_channel(&self, channel: &str) -> Result<String> {
        let path = self.input.root.join(CHANNELS_FILE);
        let channels: Channels = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?
        } else {
            Channels::default()
        };

        if let Some(version) = channels.channels.get(channel) {
            return Ok(version.clone());
        }
        if self.version_dir(channel).join(MANIFEST_FILE).is_file() {
            return Ok(channel.to_string());
        }

        Err(BuildError::UnknownChannel {
            input: self.input.id.clone(),
            channel: channel.to_string(),
        }
        .into())
    }

    pub fn manifest(&self, version: &str) -> Result<ToolchainManifest> {
        let path = self.version_dir(version).join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read toolchain manifest {:?}", path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse toolchain manifest {:?}", path))
    }

    pub fn component_tree(
        &self,
        version: &str,
        system: &System,
        component: Component,
    ) -> Result<PathBuf> {
        let system_dir = self.version_dir(version).join(system.as_str());
        if !system_dir.is_dir() {
            return Err(BuildError::UnsupportedSystem {
                artifact: format!("{}#toolchain-{version}", self.input.id),
                system: system.to_string(),
            }
            .into());
        }

        let tree = system_dir.join(component.as_str());
        if !tree.is_dir() {
            return Err(BuildError::MissingToolchainArtifact {
                version: version.to_string(),
                kind: "component",
                name: component.as_str().to_string(),
            }
            .into());
        }
        Ok(tree)
    }

    pub fn target_tree(&self, version: &str, target: &str) -> Result<PathBuf> {
        let tree = self.version_dir(version).join(TARGETS_DIR).join(target);
        if !tree.is_dir() {
            return Err(BuildError::MissingToolchainArtifact {
                version: version.to_string(),
                kind: "target",
                name: target.to_string(),
            }
            .into());
        }
        Ok(tree)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedArtifact {
    pub name: String,
    pub version: String,
    pub tree: PathBuf,
}

/// Everything needed to materialize a toolchain, checked up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainPlan {
    pub version: String,
    pub system: System,
    pub components: Vec<Component>,
    pub artifacts: Vec<PlannedArtifact>,
    pub target: Option<String>,
    pub std: Option<PlannedArtifact>,
    input_hash: String,
}

/// Locate every selected component and the cross-target std, rejecting any
/// artifact whose version differs from the pinned channel version.
pub fn plan(graph: &ResolvedGraph, spec: &ToolchainSpec, system: &System) -> Result<ToolchainPlan> {
    let input = graph.input(&spec.input)?;
    let provider = ToolchainProvider::new(input);
    let components = Component::select(&spec.components)?;

    let version = provider.resolve_channel(&spec.channel)?;
    let manifest = provider.manifest(&version)?;
    check_version("toolchain manifest", &version, &manifest.version)?;
    debug!(channel = %spec.channel, version = %version, "resolved toolchain channel");

    let mut artifacts = Vec::new();
    for component in &components {
        let declared = manifest.components.get(component.as_str()).ok_or_else(|| {
            BuildError::MissingToolchainArtifact {
                version: version.clone(),
                kind: "component",
                name: component.as_str().to_string(),
            }
        })?;
        check_version(component.as_str(), &version, declared)?;

        artifacts.push(PlannedArtifact {
            name: component.as_str().to_string(),
            version: declared.clone(),
            tree: provider.component_tree(&version, system, *component)?,
        });
    }

    let std = match &spec.target {
        Some(target) => {
            let declared = manifest.targets.get(target).ok_or_else(|| {
                BuildError::MissingToolchainArtifact {
                    version: version.clone(),
                    kind: "target",
                    name: target.clone(),
                }
            })?;
            let name = format!("rust-std-{target}");
            check_version(&name, &version, declared)?;

            Some(PlannedArtifact {
                tree: provider.target_tree(&version, target)?,
                name,
                version: declared.clone(),
            })
        }
        None => None,
    };

    Ok(ToolchainPlan {
        version,
        system: system.clone(),
        components,
        artifacts,
        target: spec.target.clone(),
        std,
        input_hash: graph.closure_hash(&input.id),
    })
}

fn check_version(artifact: &str, expected: &str, actual: &str) -> Result<(), BuildError> {
    if expected != actual {
        return Err(BuildError::VersionSkew {
            artifact: artifact.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

impl ToolchainPlan {
    /// Copy each member into the store and merge them into one bundle.
    pub fn realize(&self, store: &Store) -> Result<ToolchainBundle> {
        let progress = ui::Progress::new("Building", format!("{BUNDLE_NAME} {}", self.version));

        let result = (|| -> Result<ToolchainBundle> {
            let mut members = Vec::new();
            for artifact in &self.artifacts {
                members.push(store.add_tree(
                    &[self.system.as_str(), self.input_hash.as_str()],
                    &artifact.name,
                    &artifact.version,
                    &artifact.tree,
                )?);
            }

            let std_path = match &self.std {
                Some(std) => {
                    let path = store.add_tree(
                        &[self.input_hash.as_str()],
                        &std.name,
                        &std.version,
                        &std.tree,
                    )?;
                    members.push(path.clone());
                    Some(path)
                }
                None => None,
            };

            let path = store.merge(BUNDLE_NAME, &self.version, &members)?;
            Ok(ToolchainBundle {
                version: self.version.clone(),
                target: self.target.clone(),
                components: self.components.clone(),
                path,
                std_path,
                members,
            })
        })();

        match &result {
            Ok(bundle) => progress.success("Built", Some(bundle.path.display().to_string())),
            Err(err) => progress.fail("Failed", format!("{err:#}")),
        }
        result
    }
}

/// Merged toolchain in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainBundle {
    pub version: String,
    pub target: Option<String>,
    pub components: Vec<Component>,
    pub path: PathBuf,
    pub std_path: Option<PathBuf>,
    /// Store entries the bundle links into
    pub members: Vec<PathBuf>,
}

impl ToolchainBundle {
    pub fn has(&self, component: Component) -> bool {
        self.components.contains(&component)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path.join("bin")
    }

    pub fn rustc(&self) -> PathBuf {
        self.bin_dir().join("rustc")
    }

    pub fn cargo(&self) -> Option<PathBuf> {
        self.has(Component::Cargo)
            .then(|| self.bin_dir().join("cargo"))
    }

    /// Library directory of the cross-target standard library.
    pub fn std_lib_dir(&self) -> Option<PathBuf> {
        match (&self.std_path, &self.target) {
            (Some(std), Some(target)) => Some(rustlib_dir(std, target)),
            _ => None,
        }
    }

    pub fn rust_src_dir(&self) -> Option<PathBuf> {
        self.has(Component::RustSrc)
            .then(|| self.path.join("lib/rustlib/src/rust/library"))
    }
}

fn rustlib_dir(root: &Path, target: &str) -> PathBuf {
    root.join("lib").join("rustlib").join(target).join("lib")
}
