use anyhow::Result;
use clap::Parser;
use devshell::cli::Cli;
use devshell::commands;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Diagnostics go to stderr; stdout carries activation scripts.
    let default_filter = if cli.verbose {
        "devshell=debug"
    } else {
        "devshell=warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    commands::execute(cli)
}
