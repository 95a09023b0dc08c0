use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace) -> Result<()> {
    let report = workspace.cleanup()?;

    for path in &report.removed {
        ui::status("Removed", path.display());
    }
    ui::success(
        "Cleanup",
        format!(
            "removed {} unreferenced entr{}, kept {}",
            report.removed.len(),
            if report.removed.len() == 1 { "y" } else { "ies" },
            report.kept
        ),
    );
    Ok(())
}
