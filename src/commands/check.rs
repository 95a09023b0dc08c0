use crate::workspace::WorkspacePath;
use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace) -> Result<()> {
    let issues = workspace.check()?;

    if issues.is_empty() {
        ui::success(
            "Check",
            format!(
                "{} is valid.",
                workspace.path(WorkspacePath::Descriptor).display()
            ),
        );
        Ok(())
    } else {
        for issue in &issues {
            ui::error(issue);
        }
        anyhow::bail!("Descriptor validation failed ({} issue(s)).", issues.len());
    }
}
