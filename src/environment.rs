use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::index::InstalledPackage;
use crate::toolchain::ToolchainBundle;

const ENCODED_FLAG_SEPARATOR: char = '\x1f';

/// Output format for an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Zsh,
    Bash,
    Fish,
    Json,
}

impl Shell {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "zsh" => Some(Shell::Zsh),
            "bash" => Some(Shell::Bash),
            "fish" => Some(Shell::Fish),
            "json" => Some(Shell::Json),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Shell::Zsh => "zsh",
            Shell::Bash => "bash",
            Shell::Fish => "fish",
            Shell::Json => "json",
        }
    }
}

/// Environment produced by activating a descriptor.
///
/// `path` entries are prepended to the caller's `PATH` in order; every
/// entry of `variables` replaces the caller's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub path: Vec<PathBuf>,
    pub variables: BTreeMap<String, String>,
}

impl Activation {
    pub fn new(
        toolchain: Option<&ToolchainBundle>,
        packages: &[InstalledPackage],
        libraries: &[InstalledPackage],
        env: &BTreeMap<String, String>,
    ) -> Self {
        let mut path = Vec::new();
        let mut variables = env.clone();

        if let Some(toolchain) = toolchain {
            path.push(toolchain.bin_dir());
            variables.insert("RUSTC".into(), display(&toolchain.rustc()));
            if let Some(cargo) = toolchain.cargo() {
                variables.insert("CARGO".into(), display(&cargo));
            }
            if let Some(src) = toolchain.rust_src_dir() {
                variables.insert("RUST_SRC_PATH".into(), display(&src));
            }
        }

        // Cargo splits RUSTFLAGS on whitespace; the encoded form keeps a
        // store path with spaces intact and takes precedence.
        let std_lib = toolchain.and_then(ToolchainBundle::std_lib_dir);
        let (rustflags, encoded) = match &std_lib {
            Some(dir) => (
                format!("-L {}", dir.display()),
                format!("-L{ENCODED_FLAG_SEPARATOR}{}", dir.display()),
            ),
            None => (String::new(), String::new()),
        };
        variables.insert("RUSTFLAGS".into(), rustflags);
        variables.insert("CARGO_ENCODED_RUSTFLAGS".into(), encoded);

        for package in packages {
            let bin = package.bin_dir();
            if !path.contains(&bin) {
                path.push(bin);
            }
        }

        let library_path = libraries
            .iter()
            .map(|library| display(&library.lib_dir()))
            .collect::<Vec<_>>()
            .join(":");
        variables.insert("LD_LIBRARY_PATH".into(), library_path);

        Self { path, variables }
    }

    /// Format the activation for the given shell.
    ///
    /// Scripts prepend to the evaluating shell's own `PATH` and are meant to
    /// be evaluated once per shell. `devshell shell` builds the child's
    /// `PATH` with [`Activation::search_path`] instead, which stays stable
    /// when shells are nested.
    pub fn format_for_shell(&self, shell: Shell) -> Result<String> {
        match shell {
            Shell::Zsh | Shell::Bash => Ok(self.format_posix()),
            Shell::Fish => Ok(self.format_fish()),
            Shell::Json => self.to_json(),
        }
    }

    fn format_posix(&self) -> String {
        let mut lines = Vec::new();
        if !self.path.is_empty() {
            let prefix = self
                .path
                .iter()
                .map(|dir| escape_double_quoted(&display(dir)))
                .collect::<Vec<_>>()
                .join(":");
            lines.push(format!("export PATH=\"{prefix}:$PATH\""));
        }
        for (name, value) in &self.variables {
            lines.push(format!("export {name}=\"{}\"", escape_double_quoted(value)));
        }
        lines.join("\n")
    }

    fn format_fish(&self) -> String {
        let mut lines = Vec::new();
        if !self.path.is_empty() {
            let prefix = self
                .path
                .iter()
                .map(|dir| quote_fish(&display(dir)))
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(format!("set -gx PATH {prefix} $PATH"));
        }
        for (name, value) in &self.variables {
            lines.push(format!("set -gx {name} {}", quote_fish(value)));
        }
        lines.join("\n")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize activation")
    }

    /// `PATH` value with the activation prefix ahead of `current`.
    ///
    /// Entries of `current` that the prefix already provides are dropped, so
    /// applying the activation to an activated environment changes nothing.
    pub fn search_path(&self, current: Option<OsString>) -> Result<OsString> {
        let mut dirs = self.path.clone();
        if let Some(current) = current {
            dirs.extend(std::env::split_paths(&current).filter(|dir| !self.path.contains(dir)));
        }
        std::env::join_paths(dirs).context("Failed to build PATH for the activated shell")
    }

    /// Apply the activation to a child process.
    pub fn apply(&self, command: &mut Command) -> Result<()> {
        command.env("PATH", self.search_path(std::env::var_os("PATH"))?);
        command.envs(&self.variables);
        Ok(())
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn escape_double_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn quote_fish(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PackageRef;
    use crate::toolchain::Component;
    use rstest::rstest;

    fn bundle(components: Vec<Component>, target: Option<&str>) -> ToolchainBundle {
        ToolchainBundle {
            version: "1.82.0".to_string(),
            target: target.map(str::to_string),
            components,
            path: PathBuf::from("/store/aaaa-rust-toolchain-1.82.0"),
            std_path: target.map(|target| {
                PathBuf::from(format!("/store/bbbb-rust-std-{target}-1.82.0"))
            }),
            members: Vec::new(),
        }
    }

    fn package(name: &str) -> InstalledPackage {
        InstalledPackage {
            package: PackageRef::parse(name, "nixpkgs").unwrap(),
            version: "1.0".to_string(),
            path: PathBuf::from(format!("/store/cccc-{name}-1.0")),
        }
    }

    #[test]
    fn wasm_target_adds_single_library_search_dir() {
        let toolchain = bundle(
            vec![Component::Rustc, Component::Cargo],
            Some("wasm32-unknown-unknown"),
        );
        let activation = Activation::new(Some(&toolchain), &[], &[], &BTreeMap::new());

        let rustflags = &activation.variables["RUSTFLAGS"];
        assert_eq!(rustflags.matches("-L ").count(), 1);
        assert!(rustflags.contains("wasm"));
        assert!(rustflags.contains("1.82.0"));
        assert_eq!(
            rustflags,
            "-L /store/bbbb-rust-std-wasm32-unknown-unknown-1.82.0/lib/rustlib/wasm32-unknown-unknown/lib"
        );
        assert_eq!(
            activation.variables["CARGO"],
            "/store/aaaa-rust-toolchain-1.82.0/bin/cargo"
        );
        assert!(!activation.variables.contains_key("RUST_SRC_PATH"));
    }

    #[test]
    fn encoded_rustflags_survive_spaces_in_store_path() {
        let mut toolchain = bundle(vec![Component::Rustc], Some("thumbv6m-none-eabi"));
        toolchain.std_path = Some(PathBuf::from(
            "/Users/me/Library/Application Support/devshell/store/bbbb-rust-std-thumbv6m-none-eabi-1.82.0",
        ));
        let activation = Activation::new(Some(&toolchain), &[], &[], &BTreeMap::new());

        let flags: Vec<&str> = activation.variables["CARGO_ENCODED_RUSTFLAGS"]
            .split('\x1f')
            .collect();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0], "-L");
        assert!(flags[1].contains("Application Support"));
        assert!(flags[1].ends_with("lib/rustlib/thumbv6m-none-eabi/lib"));
    }

    #[test]
    fn unselected_components_are_not_exported() {
        let toolchain = bundle(vec![Component::Rustc, Component::RustSrc], None);
        let activation = Activation::new(Some(&toolchain), &[], &[], &BTreeMap::new());

        assert!(!activation.variables.contains_key("CARGO"));
        assert_eq!(activation.variables["RUSTFLAGS"], "");
        assert_eq!(activation.variables["CARGO_ENCODED_RUSTFLAGS"], "");
        assert!(activation.variables["RUST_SRC_PATH"].ends_with("lib/rustlib/src/rust/library"));
    }

    #[test]
    fn empty_library_list_exports_empty_library_path() {
        let activation = Activation::new(None, &[package("gcc")], &[], &BTreeMap::new());
        assert_eq!(activation.variables["LD_LIBRARY_PATH"], "");

        let activation = Activation::new(
            None,
            &[],
            &[package("zlib"), package("openssl")],
            &BTreeMap::new(),
        );
        assert_eq!(
            activation.variables["LD_LIBRARY_PATH"],
            "/store/cccc-zlib-1.0/lib:/store/cccc-openssl-1.0/lib"
        );
    }

    #[test]
    fn path_prefix_puts_toolchain_before_packages() {
        let toolchain = bundle(vec![Component::Rustc], None);
        let env = BTreeMap::from([("PICO_SDK_FETCH_FROM_GIT".to_string(), "1".to_string())]);
        let activation = Activation::new(
            Some(&toolchain),
            &[package("gcc"), package("cmake")],
            &[],
            &env,
        );

        assert_eq!(
            activation.path,
            vec![
                PathBuf::from("/store/aaaa-rust-toolchain-1.82.0/bin"),
                PathBuf::from("/store/cccc-gcc-1.0/bin"),
                PathBuf::from("/store/cccc-cmake-1.0/bin"),
            ]
        );
        assert_eq!(activation.variables["PICO_SDK_FETCH_FROM_GIT"], "1");
    }

    #[test]
    fn formatting_is_deterministic() {
        let toolchain = bundle(Component::ALL.to_vec(), Some("wasm32-unknown-unknown"));
        let build = || Activation::new(Some(&toolchain), &[package("gcc")], &[], &BTreeMap::new());

        for shell in [Shell::Zsh, Shell::Bash, Shell::Fish, Shell::Json] {
            assert_eq!(
                build().format_for_shell(shell).unwrap(),
                build().format_for_shell(shell).unwrap()
            );
        }
    }

    #[test]
    fn posix_output_exports_and_escapes() {
        let env = BTreeMap::from([("GREETING".to_string(), "say \"hi\" $USER".to_string())]);
        let activation = Activation::new(None, &[package("gcc")], &[], &env);
        let output = activation.format_for_shell(Shell::Bash).unwrap();

        assert!(output.starts_with("export PATH=\"/store/cccc-gcc-1.0/bin:$PATH\"\n"));
        assert!(output.contains("export GREETING=\"say \\\"hi\\\" \\$USER\""));
        assert!(output.contains("export LD_LIBRARY_PATH=\"\""));
        assert!(output.contains("export RUSTFLAGS=\"\""));
    }

    #[test]
    fn fish_output_uses_set() {
        let env = BTreeMap::from([("QUOTE".to_string(), "it's".to_string())]);
        let activation = Activation::new(None, &[package("gcc")], &[], &env);
        let output = activation.format_for_shell(Shell::Fish).unwrap();

        assert!(output.starts_with("set -gx PATH '/store/cccc-gcc-1.0/bin' $PATH\n"));
        assert!(output.contains("set -gx QUOTE 'it\\'s'"));
    }

    #[test]
    fn json_output_lists_path_and_variables() {
        let activation = Activation::new(None, &[package("gcc")], &[], &BTreeMap::new());
        let value: serde_json::Value =
            serde_json::from_str(&activation.format_for_shell(Shell::Json).unwrap()).unwrap();

        assert_eq!(value["path"][0], "/store/cccc-gcc-1.0/bin");
        assert_eq!(value["variables"]["LD_LIBRARY_PATH"], "");
    }

    #[test]
    fn search_path_prepends_activation() {
        let activation = Activation::new(None, &[package("gcc")], &[], &BTreeMap::new());
        let joined = activation
            .search_path(Some(OsString::from("/usr/bin:/bin")))
            .unwrap();
        assert_eq!(joined, OsString::from("/store/cccc-gcc-1.0/bin:/usr/bin:/bin"));
    }

    #[test]
    fn search_path_is_stable_under_nesting() {
        let toolchain = bundle(vec![Component::Rustc], None);
        let activation = Activation::new(
            Some(&toolchain),
            &[package("gcc"), package("cmake")],
            &[],
            &BTreeMap::new(),
        );

        let outer = activation
            .search_path(Some(OsString::from("/usr/bin:/bin")))
            .unwrap();
        let inner = activation.search_path(Some(outer.clone())).unwrap();
        assert_eq!(inner, outer);
        assert_eq!(
            outer,
            OsString::from(
                "/store/aaaa-rust-toolchain-1.82.0/bin:/store/cccc-gcc-1.0/bin:/store/cccc-cmake-1.0/bin:/usr/bin:/bin"
            )
        );
    }

    #[rstest]
    #[case("zsh", Some(Shell::Zsh))]
    #[case("BASH", Some(Shell::Bash))]
    #[case("Fish", Some(Shell::Fish))]
    #[case("json", Some(Shell::Json))]
    #[case("powershell", None)]
    fn shell_from_name(#[case] name: &str, #[case] expected: Option<Shell>) {
        assert_eq!(Shell::from_name(name), expected);
    }
}
