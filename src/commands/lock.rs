use crate::workspace::WorkspacePath;
use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace) -> Result<()> {
    let outcome = workspace.lock()?;
    let path = workspace.path(WorkspacePath::Lockfile);

    if outcome.graph.is_empty() {
        ui::warn("The descriptor declares no inputs.");
    }
    if outcome.written {
        ui::success(
            "Locked",
            format!("{} input(s) in {}", outcome.graph.len(), path.display()),
        );
    } else {
        ui::info(format!("{} is up to date.", path.display()));
    }
    Ok(())
}
