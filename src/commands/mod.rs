use crate::cli::{Cli, Commands};
use crate::workspace::{Workspace, WorkspaceOptions};
use anyhow::Result;

mod build;
mod check;
mod cleanup;
mod env;
mod init;
mod lock;
mod shell;
mod show;
mod update;

pub fn execute(cli: Cli) -> Result<()> {
    let workspace = Workspace::new(WorkspaceOptions {
        descriptor: cli.file,
        system: cli.system,
        offline: cli.offline,
    })?;

    match cli.command {
        Commands::Init { force } => init::execute(&workspace, force),

        Commands::Check => check::execute(&workspace),

        Commands::Lock => lock::execute(&workspace),

        Commands::Update { inputs } => update::execute(&workspace, inputs),

        Commands::Build => build::execute(&workspace),

        Commands::Env { shell } => env::execute(&workspace, shell),

        Commands::Shell { shell, command } => shell::execute(&workspace, shell, command),

        Commands::Show => show::execute(&workspace),

        Commands::Cleanup => cleanup::execute(&workspace),
    }
}
