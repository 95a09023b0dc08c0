use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::descriptor::PackageRef;
use crate::error::BuildError;
use crate::platform::System;
use crate::resolve::{ResolvedGraph, ResolvedInput};
use crate::store::Store;

const PACKAGES_DIR: &str = "packages";
const PACKAGE_MANIFEST: &str = "package.toml";

/// `packages/<name>/package.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageMeta {
    pub version: String,
    /// Supported systems; empty means every system with a tree.
    #[serde(default)]
    pub systems: Vec<String>,
}

/// A package located inside a resolved input, ready to be copied into the
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSource {
    pub package: PackageRef,
    pub version: String,
    pub tree: PathBuf,
    /// Closure hash of the providing input
    pub input_hash: String,
}

impl PackageSource {
    /// Copy the package tree into the store.
    pub fn realize(&self, store: &Store, system: &System) -> Result<InstalledPackage> {
        let path = store.add_tree(
            &[
                system.as_str(),
                self.package.input.as_str(),
                self.input_hash.as_str(),
            ],
            &self.package.name,
            &self.version,
            &self.tree,
        )?;
        Ok(InstalledPackage {
            package: self.package.clone(),
            version: self.version.clone(),
            path,
        })
    }
}

/// A package materialized in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub package: PackageRef,
    pub version: String,
    pub path: PathBuf,
}

impl InstalledPackage {
    pub fn bin_dir(&self) -> PathBuf {
        self.path.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.path.join("lib")
    }
}

/// Read-only view of a resolved input laid out as a package index.
pub struct PackageIndex<'a> {
    input: &'a ResolvedInput,
}

impl<'a> PackageIndex<'a> {
    pub fn new(input: &'a ResolvedInput) -> Self {
        Self { input }
    }

    pub fn meta(&self, name: &str) -> Result<PackageMeta> {
        let path = self
            .input
            .root
            .join(PACKAGES_DIR)
            .join(name)
            .join(PACKAGE_MANIFEST);

        if !path.is_file() {
            return Err(BuildError::MissingPackage {
                input: self.input.id.clone(),
                package: name.to_string(),
            }
            .into());
        }

        let contents =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Locate the installed tree of `name` for `system`.
    pub fn locate(&self, name: &str, system: &System) -> Result<(PackageMeta, PathBuf)> {
        let meta = self.meta(name)?;

        let listed = meta.systems.is_empty()
            || meta
                .systems
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(system.as_str()));
        let tree = self
            .input
            .root
            .join(PACKAGES_DIR)
            .join(name)
            .join(system.as_str());

        if !listed || !tree.is_dir() {
            return Err(BuildError::UnsupportedSystem {
                artifact: format!("{}#{}", self.input.id, name),
                system: system.to_string(),
            }
            .into());
        }

        Ok((meta, tree))
    }
}

/// Locate every referenced package before anything is copied.
pub fn plan_packages(
    graph: &ResolvedGraph,
    packages: &[PackageRef],
    system: &System,
) -> Result<Vec<PackageSource>> {
    packages
        .iter()
        .map(|package| -> Result<PackageSource> {
            let input = graph.input(&package.input)?;
            let (meta, tree) = PackageIndex::new(input).locate(&package.name, system)?;
            Ok(PackageSource {
                package: package.clone(),
                version: meta.version,
                tree,
                input_hash: graph.closure_hash(&input.id),
            })
        })
        .collect()
}
