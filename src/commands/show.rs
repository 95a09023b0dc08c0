use crate::descriptor::Descriptor;
use crate::lockfile::LockedNode;
use crate::workspace::WorkspacePath;
use crate::Workspace;
use anyhow::Result;

pub fn execute(workspace: &Workspace) -> Result<()> {
    let descriptor = Descriptor::load(&workspace.path(WorkspacePath::Descriptor))?;
    let lockfile = workspace.lockfile()?;

    if let Some(description) = &descriptor.description {
        println!("{description}");
        println!();
    }

    for (name, input) in &descriptor.inputs {
        println!("{name}");
        println!("  url:    {}", input.url);
        match lockfile.node(name) {
            Some(node) if node.url == input.url => print_pin(node, "  "),
            Some(_) => println!("  locked: stale (url changed; run 'devshell lock')"),
            None => println!("  locked: no"),
        }

        let dependencies = lockfile
            .node(name)
            .map(|node| node.dependencies.clone())
            .unwrap_or_default();
        for (dependency, id) in &dependencies {
            if input.follows.get(dependency) == Some(id) {
                println!("  {dependency} follows {id}");
            } else if let Some(node) = lockfile.node(id) {
                println!("  {dependency} -> {}", node.url);
                print_pin(node, "    ");
            }
        }
    }

    println!();
    println!("system:    {}", workspace.system());
    if let Some(toolchain) = &descriptor.toolchain {
        println!(
            "toolchain: {}#{} [{}]{}",
            toolchain.input,
            toolchain.channel,
            toolchain.components.join(", "),
            toolchain
                .target
                .as_deref()
                .map(|target| format!(" target {target}"))
                .unwrap_or_default()
        );
    }
    if !descriptor.shell.packages.is_empty() {
        println!("packages:  {}", descriptor.shell.packages.join(", "));
    }
    if !descriptor.shell.libraries.is_empty() {
        println!("libraries: {}", descriptor.shell.libraries.join(", "));
    }

    Ok(())
}

fn print_pin(node: &LockedNode, indent: &str) {
    println!("{indent}kind:   {}", node.kind);
    if let Some(rev) = &node.rev {
        println!("{indent}rev:    {rev}");
    }
    println!("{indent}hash:   {}", node.hash);
    if let Some(last_modified) = &node.last_modified {
        println!("{indent}date:   {last_modified}");
    }
}
