use anyhow::{bail, Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;
use crate::descriptor::{Descriptor, DescriptorIssue, DESCRIPTOR_FILE};
use crate::environment::{Activation, Shell};
use crate::error::BuildError;
use crate::fetch::FetchContext;
use crate::index::{plan_packages, InstalledPackage};
use crate::lockfile::{Lockfile, LOCKFILE_NAME};
use crate::platform::System;
use crate::resolve::{Refresh, ResolvedGraph, Resolver};
use crate::store::Store;
use crate::toolchain::{self, ToolchainBundle};
use crate::ui;
use crate::util::fs::remove_path;
use crate::util::xdg;

/// Descriptor written by `devshell init`, embedded at compile time.
const DESCRIPTOR_TEMPLATE: &str = include_str!("../templates/devshell.toml");

/// Overrides the store location from the config file.
pub const STORE_DIR_ENV: &str = "DEVSHELL_STORE_DIR";

/// Workspace path types
#[derive(Debug, Clone, Copy)]
pub enum WorkspacePath {
    /// Directory holding the descriptor
    Root,
    /// Descriptor file: <root>/devshell.toml
    Descriptor,
    /// Lock file: <root>/devshell.lock
    Lockfile,
    /// Cache directory: $XDG_CACHE_HOME/devshell
    Cache,
    /// Artifact store: $DEVSHELL_STORE_DIR, config `store_dir` or <cache>/store
    Store,
    /// Fetched input trees: <cache>/sources
    Sources,
    /// Bare git repositories: <cache>/git
    GitCache,
    /// Downloaded archives: <cache>/downloads
    Downloads,
}

/// Command line settings that shape a workspace.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceOptions {
    pub descriptor: Option<PathBuf>,
    pub system: Option<String>,
    pub offline: bool,
}

/// A descriptor together with the caches and store it is evaluated against.
#[derive(Debug)]
pub struct Workspace {
    descriptor_path: PathBuf,
    cache_dir: PathBuf,
    store_dir: PathBuf,
    system: System,
    offline: bool,
    config: Config,
}

/// Result of resolving and writing the lock file.
#[derive(Debug)]
pub struct LockOutcome {
    pub graph: ResolvedGraph,
    pub written: bool,
}

/// Everything materialized for a descriptor.
#[derive(Debug)]
pub struct Realized {
    pub graph: ResolvedGraph,
    pub toolchain: Option<ToolchainBundle>,
    pub packages: Vec<InstalledPackage>,
    pub libraries: Vec<InstalledPackage>,
    pub activation: Activation,
}

/// Activation rendered for a shell.
#[derive(Debug)]
pub struct EnvironmentExport {
    pub shell: Shell,
    pub script: String,
    /// The requested shell was unknown and the default was used.
    pub defaulted: bool,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
}

impl Workspace {
    /// Create a new Workspace
    ///
    /// The descriptor defaults to `./devshell.toml`. The store location is
    /// taken from `$DEVSHELL_STORE_DIR`, then the config file, then
    /// `$XDG_CACHE_HOME/devshell/store`.
    pub fn new(options: WorkspaceOptions) -> Result<Self> {
        let config = Config::load(&Config::default_path()?)?;
        Self::with_config(options, config)
    }

    pub fn with_config(options: WorkspaceOptions, config: Config) -> Result<Self> {
        let cwd = env::current_dir().context("Failed to determine current directory")?;
        let descriptor_path = match options.descriptor {
            Some(path) => {
                let path = cwd.join(path);
                if path.is_dir() {
                    path.join(DESCRIPTOR_FILE)
                } else {
                    path
                }
            }
            None => cwd.join(DESCRIPTOR_FILE),
        };

        // Store paths end up in symlink targets and exported variables, so
        // relative locations are anchored to the working directory.
        let cache_dir = cwd.join(xdg::cache_dir()?);
        let store_dir = match env::var(STORE_DIR_ENV) {
            Ok(value) if !value.trim().is_empty() => cwd.join(value),
            _ => match config.store_dir()? {
                Some(dir) => cwd.join(dir),
                None => cache_dir.join("store"),
            },
        };

        let system = match options.system {
            Some(value) => System::parse(&value)?,
            None => System::host(),
        };

        Ok(Self {
            descriptor_path,
            cache_dir,
            store_dir,
            system,
            offline: options.offline || config.offline,
            config,
        })
    }

    /// Get path for a specific workspace location
    pub fn path(&self, path_type: WorkspacePath) -> PathBuf {
        let root = self
            .descriptor_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        match path_type {
            WorkspacePath::Root => root,
            WorkspacePath::Descriptor => self.descriptor_path.clone(),
            WorkspacePath::Lockfile => root.join(LOCKFILE_NAME),
            WorkspacePath::Cache => self.cache_dir.clone(),
            WorkspacePath::Store => self.store_dir.clone(),
            WorkspacePath::Sources => self.cache_dir.join("sources"),
            WorkspacePath::GitCache => self.cache_dir.join("git"),
            WorkspacePath::Downloads => self.cache_dir.join("downloads"),
        }
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Store {
        Store::new(self.path(WorkspacePath::Store))
    }

    fn fetch_context(&self) -> FetchContext {
        FetchContext {
            sources_dir: self.path(WorkspacePath::Sources),
            git_dir: self.path(WorkspacePath::GitCache),
            downloads_dir: self.path(WorkspacePath::Downloads),
            offline: self.offline,
        }
    }

    /// Write the descriptor template.
    pub fn init(&self, force: bool) -> Result<PathBuf> {
        let path = self.path(WorkspacePath::Descriptor);
        if path.exists() && !force {
            bail!(
                "Descriptor {:?} already exists. Use --force to overwrite it.",
                path
            );
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        fs::write(&path, DESCRIPTOR_TEMPLATE)
            .with_context(|| format!("Failed to write descriptor {:?}", path))?;
        Ok(path)
    }

    /// Parse the descriptor and report every static problem.
    pub fn check(&self) -> Result<Vec<DescriptorIssue>> {
        let path = self.path(WorkspacePath::Descriptor);
        let descriptor = Descriptor::load(&path)?;
        Ok(descriptor.validate(&path))
    }

    /// Load a descriptor that passes validation.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let path = self.path(WorkspacePath::Descriptor);
        let descriptor = Descriptor::load(&path)?;

        let issues = descriptor.validate(&path);
        if !issues.is_empty() {
            for issue in &issues {
                ui::error(issue);
            }
            bail!("Descriptor is invalid ({} issue(s)).", issues.len());
        }
        Ok(descriptor)
    }

    pub fn lockfile(&self) -> Result<Lockfile> {
        Lockfile::load_or_default(&self.path(WorkspacePath::Lockfile))
    }

    fn resolve(&self, descriptor: &Descriptor, refresh: Refresh) -> Result<ResolvedGraph> {
        let lockfile = self.lockfile()?;
        let context = self.fetch_context();
        let root = self.path(WorkspacePath::Root);
        Resolver::new(descriptor, &lockfile, &root, &context, refresh).resolve()
    }

    fn write_lockfile(&self, graph: &ResolvedGraph) -> Result<bool> {
        let path = self.path(WorkspacePath::Lockfile);
        let written = graph.to_lockfile().save_if_changed(&path)?;
        if written {
            info!(path = %path.display(), nodes = graph.len(), "wrote lock file");
        }
        Ok(written)
    }

    /// Resolve every input, reusing pins, and write the lock file.
    pub fn lock(&self) -> Result<LockOutcome> {
        let descriptor = self.descriptor()?;
        let graph = self.resolve(&descriptor, Refresh::None)?;
        let written = self.write_lockfile(&graph)?;
        Ok(LockOutcome { graph, written })
    }

    /// Re-resolve `names` (every input when empty) ignoring their pins.
    pub fn update(&self, names: &[String]) -> Result<LockOutcome> {
        let descriptor = self.descriptor()?;

        for name in names {
            if !descriptor.inputs.contains_key(name) {
                return Err(BuildError::UnknownInput { name: name.clone() }.into());
            }
        }

        let refresh = if names.is_empty() {
            Refresh::All
        } else {
            Refresh::Only(names.iter().cloned().collect())
        };

        let graph = self.resolve(&descriptor, refresh)?;
        let written = self.write_lockfile(&graph)?;
        Ok(LockOutcome { graph, written })
    }

    /// Resolve, materialize and merge everything the descriptor declares.
    ///
    /// Every artifact is located and version-checked before the store is
    /// touched, and the lock file is only written once all of it succeeded.
    pub fn realize(&self) -> Result<Realized> {
        let descriptor = self.descriptor()?;
        let graph = self.resolve(&descriptor, Refresh::None)?;

        let toolchain_plan = descriptor
            .toolchain
            .as_ref()
            .map(|spec| toolchain::plan(&graph, spec, &self.system))
            .transpose()?;
        let package_plan = plan_packages(&graph, &descriptor.packages()?, &self.system)?;
        let library_plan = plan_packages(&graph, &descriptor.libraries()?, &self.system)?;

        let store = self.store();
        let toolchain = toolchain_plan
            .map(|plan| plan.realize(&store))
            .transpose()?;
        let packages = package_plan
            .iter()
            .map(|package| package.realize(&store, &self.system))
            .collect::<Result<Vec<_>>>()?;
        let libraries = library_plan
            .iter()
            .map(|library| library.realize(&store, &self.system))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            packages = packages.len(),
            libraries = libraries.len(),
            system = %self.system,
            "materialized packages"
        );

        let activation = Activation::new(
            toolchain.as_ref(),
            &packages,
            &libraries,
            &descriptor.shell.env,
        );

        let realized = Realized {
            graph,
            toolchain,
            packages,
            libraries,
            activation,
        };
        self.register_root(&realized)?;
        self.write_lockfile(&realized.graph)?;
        Ok(realized)
    }

    fn register_root(&self, realized: &Realized) -> Result<()> {
        let sources = self.path(WorkspacePath::Sources);
        let mut live = BTreeSet::new();

        if let Some(toolchain) = &realized.toolchain {
            live.insert(toolchain.path.clone());
            live.extend(toolchain.members.iter().cloned());
        }
        for package in realized.packages.iter().chain(&realized.libraries) {
            live.insert(package.path.clone());
        }
        for (_, node) in realized.graph.iter() {
            if node.root.starts_with(&sources) {
                live.insert(node.root.clone());
            }
        }

        let descriptor = self.path(WorkspacePath::Descriptor);
        let descriptor = fs::canonicalize(&descriptor).unwrap_or(descriptor);
        self.store().register_root(&descriptor, &live)
    }

    /// Realize the descriptor and render its activation for `shell`.
    ///
    /// Unknown shell names fall back to zsh.
    pub fn environment_export(&self, shell: &str) -> Result<EnvironmentExport> {
        let (shell, defaulted) = match Shell::from_name(shell) {
            Some(shell) => (shell, false),
            None => (Shell::Zsh, true),
        };

        let realized = self.realize()?;
        let script = realized.activation.format_for_shell(shell)?;
        Ok(EnvironmentExport {
            shell,
            script,
            defaulted,
        })
    }

    /// Remove store entries and source trees that no live descriptor uses.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let store = self.store();
        debug!(store = %store.root().display(), "collecting unreferenced entries");
        let live: HashSet<PathBuf> = store
            .live_roots()?
            .into_iter()
            .flat_map(|root| root.paths)
            .collect();

        let mut report = CleanupReport::default();
        let mut candidates = store.entries()?;
        candidates.extend(list_dir(&self.path(WorkspacePath::Sources))?);

        for entry in candidates {
            if live.contains(&entry) {
                report.kept += 1;
                continue;
            }
            debug!(path = %entry.display(), "removing unreferenced entry");
            remove_path(&entry)?;
            report.removed.push(entry);
        }

        let downloads = self.path(WorkspacePath::Downloads);
        if downloads.exists() {
            remove_path(&downloads)?;
            report.removed.push(downloads);
        }

        Ok(report)
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const SYSTEM: &str = "linux-x86_64";

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// A project with a path-based package index and toolchain provider.
    struct Project {
        temp: TempDir,
    }

    impl Project {
        fn new(descriptor: &str) -> Self {
            let temp = TempDir::new().unwrap();
            env::set_var("XDG_CACHE_HOME", temp.path().join("cache"));
            env::set_var("XDG_CONFIG_HOME", temp.path().join("config"));
            env::remove_var(STORE_DIR_ENV);

            let index = temp.path().join("project/index");
            for name in ["gcc", "zlib"] {
                write(
                    &index.join(format!("packages/{name}/package.toml")),
                    "version = \"1.0.0\"\n",
                );
                write(
                    &index.join(format!("packages/{name}/{SYSTEM}/bin/{name}")),
                    name,
                );
                write(
                    &index.join(format!("packages/{name}/{SYSTEM}/lib/lib{name}.so")),
                    name,
                );
            }

            let overlay = temp.path().join("project/overlay");
            write(&overlay.join("channels.toml"), "[channels]\nstable = \"1.82.0\"\n");
            write(
                &overlay.join("toolchains/1.82.0/manifest.toml"),
                "version = \"1.82.0\"\n[components]\nrustc = \"1.82.0\"\ncargo = \"1.82.0\"\n[targets]\nwasm32-unknown-unknown = \"1.82.0\"\n",
            );
            for component in ["rustc", "cargo"] {
                write(
                    &overlay.join(format!("toolchains/1.82.0/{SYSTEM}/{component}/bin/{component}")),
                    component,
                );
            }
            write(
                &overlay.join("toolchains/1.82.0/targets/wasm32-unknown-unknown/lib/rustlib/wasm32-unknown-unknown/lib/libstd.rlib"),
                "std",
            );

            write(&temp.path().join("project/devshell.toml"), descriptor);
            Self { temp }
        }

        fn workspace(&self) -> Workspace {
            Workspace::with_config(
                WorkspaceOptions {
                    descriptor: Some(self.temp.path().join("project")),
                    system: Some(SYSTEM.to_string()),
                    offline: false,
                },
                Config::default(),
            )
            .unwrap()
        }
    }

    const DESCRIPTOR: &str = r#"
[inputs.nixpkgs]
url = "path:./index"

[inputs.rust-overlay]
url = "path:./overlay"

[toolchain]
input = "rust-overlay"
components = ["rustc", "cargo"]
target = "wasm32-unknown-unknown"

[shell]
packages = ["gcc"]
"#;

    #[test]
    #[serial]
    fn paths_follow_descriptor_and_cache() {
        let project = Project::new(DESCRIPTOR);
        let workspace = project.workspace();
        let root = project.temp.path().join("project");

        assert_eq!(workspace.path(WorkspacePath::Root), root);
        assert_eq!(workspace.path(WorkspacePath::Lockfile), root.join("devshell.lock"));
        assert_eq!(
            workspace.path(WorkspacePath::Store),
            project.temp.path().join("cache/devshell/store")
        );
        assert_eq!(workspace.system().as_str(), SYSTEM);
    }

    #[test]
    #[serial]
    fn store_dir_can_be_overridden() {
        let project = Project::new(DESCRIPTOR);
        let custom = project.temp.path().join("custom-store");
        env::set_var(STORE_DIR_ENV, &custom);
        let workspace = project.workspace();
        env::remove_var(STORE_DIR_ENV);

        assert_eq!(workspace.path(WorkspacePath::Store), custom);
    }

    #[test]
    #[serial]
    fn relative_store_dir_is_anchored_to_working_directory() {
        let project = Project::new(DESCRIPTOR);
        env::set_var(STORE_DIR_ENV, "relstore");
        let workspace = project.workspace();
        env::remove_var(STORE_DIR_ENV);

        let store = workspace.path(WorkspacePath::Store);
        assert!(store.is_absolute());
        assert_eq!(store, env::current_dir().unwrap().join("relstore"));
    }

    #[test]
    #[serial]
    fn realize_activates_toolchain_and_packages() {
        let project = Project::new(DESCRIPTOR);
        let workspace = project.workspace();

        let realized = workspace.realize().unwrap();
        let toolchain = realized.toolchain.as_ref().unwrap();
        assert_eq!(toolchain.version, "1.82.0");
        assert!(toolchain.rustc().exists());

        let variables = &realized.activation.variables;
        assert_eq!(variables["LD_LIBRARY_PATH"], "");
        assert!(variables["RUSTFLAGS"].contains("wasm"));
        assert!(variables["RUSTFLAGS"].contains("1.82.0"));
        assert_eq!(realized.activation.path.len(), 2);
        assert!(workspace.path(WorkspacePath::Lockfile).exists());

        // Second activation reuses every store path and leaves the lock alone.
        let lock_before = fs::read_to_string(workspace.path(WorkspacePath::Lockfile)).unwrap();
        let again = workspace.realize().unwrap();
        assert_eq!(again.activation, realized.activation);
        assert_eq!(
            fs::read_to_string(workspace.path(WorkspacePath::Lockfile)).unwrap(),
            lock_before
        );
    }

    #[test]
    #[serial]
    fn missing_package_fails_before_store_is_touched() {
        let project = Project::new(&DESCRIPTOR.replace("[\"gcc\"]", "[\"gcc\", \"cmake\"]"));
        let workspace = project.workspace();

        let err = workspace.realize().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::MissingPackage { .. })
        ));
        assert!(workspace.store().entries().unwrap().is_empty());
        assert!(!workspace.path(WorkspacePath::Lockfile).exists());
    }

    #[test]
    #[serial]
    fn undeclared_input_is_rejected() {
        let project = Project::new(&DESCRIPTOR.replace("[\"gcc\"]", "[\"pico#picotool\"]"));
        let workspace = project.workspace();

        assert_eq!(workspace.check().unwrap().len(), 1);
        assert!(workspace.realize().is_err());
        assert!(workspace.store().entries().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn update_rejects_unknown_inputs() {
        let project = Project::new(DESCRIPTOR);
        let workspace = project.workspace();

        let err = workspace.update(&["pico".to_string()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnknownInput { .. })
        ));

        let outcome = workspace.update(&["nixpkgs".to_string()]).unwrap();
        assert!(outcome.written);
        assert_eq!(outcome.graph.len(), 2);
        assert!(!workspace.lock().unwrap().written);
    }

    #[test]
    #[serial]
    fn cleanup_keeps_live_entries() {
        let project = Project::new(DESCRIPTOR);
        let workspace = project.workspace();
        workspace.realize().unwrap();

        let stale = workspace.store().root().join("0000-stale-1.0");
        fs::create_dir_all(&stale).unwrap();

        let report = workspace.cleanup().unwrap();
        assert_eq!(report.removed, vec![stale.clone()]);
        assert!(!stale.exists());
        assert!(report.kept > 0);

        // Dropping the descriptor releases everything it held.
        fs::remove_file(workspace.path(WorkspacePath::Descriptor)).unwrap();
        let report = workspace.cleanup().unwrap();
        assert_eq!(report.kept, 0);
        assert!(workspace.store().entries().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn init_refuses_to_overwrite() {
        let project = Project::new(DESCRIPTOR);
        let workspace = project.workspace();

        assert!(workspace.init(false).is_err());
        let path = workspace.init(true).unwrap();
        let descriptor = Descriptor::load(&path).unwrap();
        assert!(descriptor.validate(&path).is_empty());
        assert!(descriptor.inputs.contains_key("nixpkgs"));
    }

    #[test]
    #[serial]
    fn unknown_shell_defaults_to_zsh() {
        let project = Project::new(DESCRIPTOR);
        let workspace = project.workspace();

        let export = workspace.environment_export("powershell").unwrap();
        assert!(export.defaulted);
        assert_eq!(export.shell, Shell::Zsh);
        assert!(export.script.contains("export RUSTC="));
    }
}
