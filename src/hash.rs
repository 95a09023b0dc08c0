use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

const HASH_PREFIX: &str = "sha256:";

/// Length of the hash prefix used in store entry names.
pub const STORE_HASH_LEN: usize = 32;

pub fn format_digest(bytes: &[u8; 32]) -> String {
    format!("{HASH_PREFIX}{}", hex::encode(bytes))
}

pub fn compute_file_sha256(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing at {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read file {:?} while hashing", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

/// Hash a directory tree by path, entry type, executable bit and content.
///
/// Entries are visited in sorted order and `.git` directories are skipped,
/// so the result depends only on the tree's content.
pub fn hash_tree(root: &Path) -> Result<[u8; 32]> {
    let mut hasher = Sha256::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk tree {:?}", root))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("Entry {:?} escaped tree {:?}", entry.path(), root))?;
        let relative = relative.to_string_lossy();
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink {:?}", entry.path()))?;
            hasher.update(b"L\0");
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"D\0");
            hasher.update(relative.as_bytes());
        } else {
            let digest = compute_file_sha256(entry.path())?;
            hasher.update(if is_executable(entry.path())? {
                b"X\0"
            } else {
                b"F\0"
            });
            hasher.update(relative.as_bytes());
            hasher.update(b"\0");
            hasher.update(digest);
        }
        hasher.update(b"\n");
    }

    Ok(hasher.finalize().into())
}

/// Short hex hash over a sequence of identity parts.
pub fn store_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update(b"\0");
    }
    let digest = hex::encode(hasher.finalize());
    digest[..STORE_HASH_LEN].to_string()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let metadata =
        fs::metadata(path).with_context(|| format!("Failed to stat {:?}", path))?;
    Ok(metadata.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_hash_matches_known_digest() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("file");
        fs::write(&file, b"hello world").unwrap();
        let digest = compute_file_sha256(&file).unwrap();
        assert_eq!(
            format_digest(&digest),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn tree_hash_ignores_location_and_git_dir() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        for root in [first.path(), second.path()] {
            fs::create_dir_all(root.join("bin")).unwrap();
            fs::write(root.join("bin/tool"), "#!/bin/sh\n").unwrap();
            fs::write(root.join("README"), "docs").unwrap();
        }
        fs::create_dir_all(second.path().join(".git")).unwrap();
        fs::write(second.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        assert_eq!(
            hash_tree(first.path()).unwrap(),
            hash_tree(second.path()).unwrap()
        );
    }

    #[test]
    fn tree_hash_changes_with_content() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a"), "one").unwrap();
        let before = hash_tree(temp.path()).unwrap();
        fs::write(temp.path().join("a"), "two").unwrap();
        assert_ne!(before, hash_tree(temp.path()).unwrap());
    }

    #[test]
    fn store_hash_is_stable_and_short() {
        let a = store_hash(["package", "gcc", "13.2.0"]);
        let b = store_hash(["package", "gcc", "13.2.0"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), STORE_HASH_LEN);
        assert_ne!(a, store_hash(["package", "gcc13.2.0"]));
    }
}
