use crate::{ui, Workspace};
use anyhow::Result;

pub fn execute(workspace: &Workspace) -> Result<()> {
    let realized = workspace.realize()?;

    match &realized.toolchain {
        Some(toolchain) => println!("{}", toolchain.path.display()),
        None => ui::info("No toolchain declared."),
    }
    for package in realized.packages.iter().chain(&realized.libraries) {
        ui::status(
            "Ready",
            format!("{} {} ({})", package.package, package.version, package.path.display()),
        );
    }
    Ok(())
}
