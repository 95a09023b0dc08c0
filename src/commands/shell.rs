use crate::{ui, Workspace};
use anyhow::{Context, Result};
use std::env;
use std::process::{Command, ExitStatus};

pub fn execute(workspace: &Workspace, shell: Option<String>, command: Vec<String>) -> Result<()> {
    let realized = workspace.realize()?;

    let mut process = match command.split_first() {
        Some((program, args)) => {
            let mut process = Command::new(program);
            process.args(args);
            process
        }
        None => {
            let program = shell_program(workspace, shell);
            ui::status("Entering", format!("{program} (exit to leave)"));
            Command::new(program)
        }
    };
    realized.activation.apply(&mut process)?;

    let status = process
        .status()
        .with_context(|| format!("Failed to start {:?}", process.get_program()))?;
    std::process::exit(exit_code(status));
}

fn shell_program(workspace: &Workspace, requested: Option<String>) -> String {
    requested
        .or_else(|| workspace.config().default_shell.clone())
        .or_else(|| env::var("SHELL").ok().filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
