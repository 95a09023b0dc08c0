use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace, inputs: Vec<String>) -> Result<()> {
    let outcome = workspace.update(&inputs)?;

    if outcome.written {
        ui::success("Updated", "devshell.lock");
    } else {
        ui::info("All pins are already current.");
    }
    Ok(())
}
