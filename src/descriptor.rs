use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::fetch::SourceUrl;
use crate::toolchain::Component;

pub const DESCRIPTOR_FILE: &str = "devshell.toml";

/// Variables computed by activation; `[shell.env]` may not redefine them.
pub const RESERVED_VARIABLES: &[&str] = &[
    "PATH",
    "RUSTC",
    "CARGO",
    "RUSTFLAGS",
    "CARGO_ENCODED_RUSTFLAGS",
    "LD_LIBRARY_PATH",
    "RUST_SRC_PATH",
];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("name pattern is valid"))
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable pattern is valid")
    })
}

pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// Parsed `devshell.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<ToolchainSpec>,
    #[serde(default)]
    pub shell: ShellSpec,
    #[serde(flatten)]
    pub extras: BTreeMap<String, toml::Value>,
}

/// A declared external input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub url: String,
    /// Dependency name of this input -> top-level input whose lock it reuses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub follows: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainSpec {
    pub input: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellSpec {
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Auxiliary packages whose `lib` directories form `LD_LIBRARY_PATH`.
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, toml::Value>,
}

impl Default for ShellSpec {
    fn default() -> Self {
        Self {
            index: default_index(),
            packages: Vec::new(),
            libraries: Vec::new(),
            env: BTreeMap::new(),
            extras: BTreeMap::new(),
        }
    }
}

fn default_channel() -> String {
    "stable".to_string()
}

fn default_components() -> Vec<String> {
    Component::ALL
        .iter()
        .map(|component| component.as_str().to_string())
        .collect()
}

fn default_index() -> String {
    "nixpkgs".to_string()
}

/// Reference to a package, `name` or `input#name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageRef {
    pub input: String,
    pub name: String,
}

impl PackageRef {
    pub fn parse(value: &str, default_input: &str) -> Result<Self> {
        let (input, name) = match value.split_once('#') {
            Some((input, name)) => (input.trim(), name.trim()),
            None => (default_input, value.trim()),
        };

        if !is_valid_name(input) {
            bail!("Invalid input name '{input}' in package reference '{value}'");
        }
        if !is_valid_name(name) {
            bail!("Invalid package name '{name}' in package reference '{value}'");
        }

        Ok(Self {
            input: input.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.input, self.name)
    }
}

/// A validation problem found in a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorIssue {
    pub source: PathBuf,
    pub message: String,
}

impl DescriptorIssue {
    fn new(source: &Path, message: impl Into<String>) -> Self {
        Self {
            source: source.to_path_buf(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DescriptorIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source.display(), self.message)
    }
}

impl Descriptor {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!(
                "No descriptor found at {:?}. Run 'devshell init' to create one.",
                path
            );
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse descriptor {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Package references for `shell.packages`, in declaration order.
    pub fn packages(&self) -> Result<Vec<PackageRef>> {
        self.shell
            .packages
            .iter()
            .map(|value| PackageRef::parse(value, &self.shell.index))
            .collect()
    }

    /// Package references for `shell.libraries`, in declaration order.
    pub fn libraries(&self) -> Result<Vec<PackageRef>> {
        self.shell
            .libraries
            .iter()
            .map(|value| PackageRef::parse(value, &self.shell.index))
            .collect()
    }

    /// Static checks that need no network access.
    pub fn validate(&self, source: &Path) -> Vec<DescriptorIssue> {
        let mut issues = Vec::new();

        let mut unknown: Vec<String> = self.extras.keys().cloned().collect();
        for (name, input) in &self.inputs {
            unknown.extend(input.extras.keys().map(|key| format!("inputs.{name}.{key}")));
        }
        if let Some(toolchain) = &self.toolchain {
            unknown.extend(toolchain.extras.keys().map(|key| format!("toolchain.{key}")));
        }
        unknown.extend(self.shell.extras.keys().map(|key| format!("shell.{key}")));
        for key in unknown {
            issues.push(DescriptorIssue::new(source, format!("unknown key '{key}'")));
        }

        for (name, input) in &self.inputs {
            if !is_valid_name(name) {
                issues.push(DescriptorIssue::new(
                    source,
                    format!("invalid input name '{name}'"),
                ));
            }
            if let Err(err) = SourceUrl::parse(&input.url) {
                issues.push(DescriptorIssue::new(
                    source,
                    format!("input '{name}': {err:#}"),
                ));
            }
            for (dependency, target) in &input.follows {
                if !is_valid_name(dependency) {
                    issues.push(DescriptorIssue::new(
                        source,
                        format!("input '{name}': invalid dependency name '{dependency}'"),
                    ));
                }
                if target == name {
                    issues.push(DescriptorIssue::new(
                        source,
                        format!("input '{name}' cannot follow itself"),
                    ));
                } else if !self.inputs.contains_key(target) {
                    issues.push(DescriptorIssue::new(
                        source,
                        format!("input '{name}' follows undeclared input '{target}'"),
                    ));
                }
            }
        }

        if let Some(toolchain) = &self.toolchain {
            if !self.inputs.contains_key(&toolchain.input) {
                issues.push(DescriptorIssue::new(
                    source,
                    format!("toolchain input '{}' is not declared", toolchain.input),
                ));
            }
            if toolchain.channel.trim().is_empty() {
                issues.push(DescriptorIssue::new(source, "toolchain channel is empty"));
            }
            if let Err(err) = Component::select(&toolchain.components) {
                issues.push(DescriptorIssue::new(source, format!("{err:#}")));
            }
            if let Some(target) = &toolchain.target {
                if !is_valid_name(target) {
                    issues.push(DescriptorIssue::new(
                        source,
                        format!("invalid toolchain target '{target}'"),
                    ));
                }
            }
        }

        for (label, values) in [
            ("package", &self.shell.packages),
            ("library", &self.shell.libraries),
        ] {
            for value in values {
                match PackageRef::parse(value, &self.shell.index) {
                    Ok(package) if !self.inputs.contains_key(&package.input) => {
                        issues.push(DescriptorIssue::new(
                            source,
                            format!(
                                "{label} '{value}' refers to undeclared input '{}'",
                                package.input
                            ),
                        ));
                    }
                    Ok(_) => {}
                    Err(err) => issues.push(DescriptorIssue::new(source, format!("{err:#}"))),
                }
            }
        }

        for name in self.shell.env.keys() {
            if !variable_pattern().is_match(name) {
                issues.push(DescriptorIssue::new(
                    source,
                    format!("invalid environment variable name '{name}'"),
                ));
            } else if RESERVED_VARIABLES.contains(&name.as_str()) {
                issues.push(DescriptorIssue::new(
                    source,
                    format!("environment variable '{name}' is computed by activation and cannot be set"),
                ));
            }
        }

        issues
    }
}
