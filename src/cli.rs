use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// devshell - Reproducible development shells
///
/// devshell reads a `devshell.toml` descriptor, pins its inputs in
/// `devshell.lock`, materializes the declared toolchain and packages into a
/// content-addressed store and activates them in a shell.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Descriptor file or the directory containing it
    #[arg(short = 'f', long = "file", value_name = "PATH", global = true)]
    pub file: Option<PathBuf>,

    /// Target system identifier such as linux-x86_64 (defaults to the host)
    #[arg(long, value_name = "SYSTEM", global = true)]
    pub system: Option<String>,

    /// Never access the network; fail when an input is not cached
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a devshell.toml template
    Init {
        /// Overwrite an existing descriptor
        #[arg(long)]
        force: bool,
    },

    /// Validate the descriptor without fetching anything
    Check,

    /// Resolve inputs and write devshell.lock
    Lock,

    /// Re-resolve inputs ignoring their pins
    Update {
        /// Inputs to update (updates all if not specified)
        #[arg(value_name = "INPUT")]
        inputs: Vec<String>,
    },

    /// Materialize the toolchain and packages and print the toolchain path
    Build,

    /// Output the activated environment
    Env {
        /// Output format (zsh, bash, fish, json)
        #[arg(short, long, value_name = "SHELL", default_value = "zsh")]
        shell: String,
    },

    /// Start a shell (or run a command) inside the activated environment
    Shell {
        /// Shell program (defaults to config default_shell, then $SHELL)
        #[arg(short, long, value_name = "SHELL")]
        shell: Option<String>,

        /// Command to run instead of an interactive shell
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Show declared inputs and their locked pins
    Show,

    /// Remove store entries no descriptor references
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn shell_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "devshell", "--system", "linux-x86_64", "shell", "--", "cargo", "build", "--release",
        ])
        .unwrap();

        assert_eq!(cli.system.as_deref(), Some("linux-x86_64"));
        match cli.command {
            Commands::Shell { shell, command } => {
                assert!(shell.is_none());
                assert_eq!(command, vec!["cargo", "build", "--release"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["devshell", "env", "-f", "demo", "--offline", "-s", "fish"])
            .unwrap();

        assert!(cli.offline);
        assert_eq!(cli.file, Some(PathBuf::from("demo")));
        assert!(matches!(cli.command, Commands::Env { shell } if shell == "fish"));
    }
}
