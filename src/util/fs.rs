use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Temporary sibling of `dest` used to stage a directory before renaming it
/// into place.
pub fn staging_dir(dest: &Path) -> Result<PathBuf> {
    let parent = dest
        .parent()
        .with_context(|| format!("Path {:?} has no parent directory", dest))?;
    let name = dest
        .file_name()
        .with_context(|| format!("Path {:?} has no file name", dest))?
        .to_string_lossy();
    Ok(parent.join(format!(".{name}.tmp-{}", std::process::id())))
}

/// Create an empty staging directory for `dest`, removing leftovers.
pub fn prepare_staging(dest: &Path) -> Result<PathBuf> {
    let staging = staging_dir(dest)?;
    if staging.symlink_metadata().is_ok() {
        remove_path(&staging)?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create staging directory {:?}", staging))?;
    Ok(staging)
}

/// Move a fully populated staging directory to `dest`.
///
/// If another process finished the same entry first, the staged copy is
/// discarded and the existing entry wins.
pub fn commit_staging(staging: &Path, dest: &Path) -> Result<()> {
    match fs::rename(staging, dest) {
        Ok(()) => Ok(()),
        Err(_) if dest.exists() => remove_path(staging),
        Err(err) => Err(err)
            .with_context(|| format!("Failed to move {:?} into place at {:?}", staging, dest)),
    }
}

/// Recursively copy `source` into the existing directory `dest`, preserving
/// symlinks and permissions.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    let walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", source))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("Entry {:?} escaped {:?}", entry.path(), source))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {:?}", target))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink {:?}", entry.path()))?;
            symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {:?} to {:?}", entry.path(), target))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
pub fn symlink(original: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(original, link)
        .with_context(|| format!("Failed to create symlink {:?} -> {:?}", link, original))
}

#[cfg(windows)]
pub fn symlink(original: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(original, link)
        .with_context(|| format!("Failed to create symlink {:?} -> {:?}", link, original))
}

/// Remove a file, symlink or directory tree.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = path
        .symlink_metadata()
        .with_context(|| format!("Failed to stat {:?}", path))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove directory {:?}", path))
    } else {
        fs::remove_file(path).with_context(|| format!("Failed to remove {:?}", path))
    }
}
