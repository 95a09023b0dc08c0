use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace, force: bool) -> Result<()> {
    let path = workspace.init(force)?;
    ui::success("Created", path.display());
    ui::info("Edit the inputs, then run 'devshell lock'.");
    Ok(())
}
