use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};
use url::Url;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use super::{source_dir_name, verify_hash, FetchContext, Fetched, InputFetcher};
use crate::error::BuildError;
use crate::hash::{format_digest, hash_tree, store_hash};
use crate::lockfile::LockedNode;
use crate::util::fs::{commit_staging, prepare_staging, remove_path};

const DEFAULT_USER_AGENT: &str = concat!("devshell/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    TarXz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Guess from the file name; unknown names are treated as gzip tarballs,
    /// which is what forge archive endpoints serve.
    fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveFormat::TarXz
        } else if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar
        } else {
            ArchiveFormat::TarGz
        }
    }
}

/// Archive input over `http(s)` or `file`.
pub(crate) struct TarballFetcher {
    url: String,
}

impl TarballFetcher {
    pub(crate) fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    fn failed(&self, name: &str, reason: impl ToString) -> BuildError {
        BuildError::FetchFailed {
            name: name.to_string(),
            url: self.url.clone(),
            reason: reason.to_string(),
        }
    }

    /// Local path of the archive, downloading it when remote.
    fn obtain(&self, name: &str, context: &FetchContext) -> Result<PathBuf> {
        let parsed = Url::parse(&self.url).map_err(|err| self.failed(name, err))?;

        if parsed.scheme() == "file" {
            let path = parsed
                .to_file_path()
                .map_err(|_| self.failed(name, "invalid file URL"))?;
            if !path.is_file() {
                return Err(self.failed(name, format!("{:?} does not exist", path)).into());
            }
            return Ok(path);
        }

        let file_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("archive.tar.gz");
        let dest = context.downloads_dir.join(format!(
            "{}-{}",
            &store_hash(["tarball", self.url.as_str()])[..16],
            file_name
        ));

        if context.offline {
            if dest.is_file() {
                debug!(input = name, path = %dest.display(), "using downloaded archive");
                return Ok(dest);
            }
            return Err(BuildError::NotCached {
                name: name.to_string(),
            }
            .into());
        }

        info!(input = name, url = %self.url, "downloading archive");
        download(&self.url, &dest).map_err(|err| self.failed(name, format!("{err:#}")))?;
        Ok(dest)
    }
}

impl InputFetcher for TarballFetcher {
    fn fetch(
        &self,
        name: &str,
        locked: Option<&LockedNode>,
        _base_dir: &Path,
        context: &FetchContext,
    ) -> Result<Fetched> {
        if let Some(node) = locked {
            let cached = context.sources_dir.join(source_dir_name(&node.hash));
            if cached.exists() {
                debug!(input = name, path = %cached.display(), "reusing unpacked archive");
                return Ok(Fetched {
                    origin: cached.clone(),
                    root: cached,
                    rev: None,
                    hash: node.hash.clone(),
                    last_modified: None,
                });
            }
        }

        let archive = self.obtain(name, context)?;
        fs::create_dir_all(&context.sources_dir).with_context(|| {
            format!("Failed to create sources directory {:?}", context.sources_dir)
        })?;

        let unpack_target = context
            .sources_dir
            .join(format!("unpack-{}", &store_hash(["tarball", self.url.as_str()])[..16]));
        let unpack = prepare_staging(&unpack_target)?;
        let format = ArchiveFormat::from_name(&archive.to_string_lossy());
        if let Err(err) = extract_archive(&archive, format, &unpack) {
            remove_path(&unpack)?;
            return Err(self.failed(name, format!("{err:#}")).into());
        }

        let root = single_top_level_dir(&unpack)?.unwrap_or_else(|| unpack.clone());
        let hash = format_digest(&hash_tree(&root)?);
        if let Err(err) = verify_hash(name, locked, &hash) {
            remove_path(&unpack)?;
            return Err(err.into());
        }

        let dest = context.sources_dir.join(source_dir_name(&hash));
        if root == unpack {
            commit_staging(&unpack, &dest)?;
        } else {
            if !dest.exists() {
                fs::rename(&root, &dest).with_context(|| {
                    format!("Failed to move {:?} into place at {:?}", root, dest)
                })?;
            }
            remove_path(&unpack)?;
        }

        Ok(Fetched {
            origin: dest.clone(),
            root: dest,
            rev: None,
            hash,
            last_modified: None,
        })
    }
}

fn download(url: &str, dest: &Path) -> Result<()> {
    let client = Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let mut response = client
        .get(url)
        .header(USER_AGENT, DEFAULT_USER_AGENT)
        .send()
        .with_context(|| format!("Failed to download {url}"))?;

    if !response.status().is_success() {
        let status = response.status();
        bail!("Download of {url} returned {status}");
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create download directory {:?}", parent))?;
    }

    let temp_path = dest.with_extension("download");
    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temporary download at {:?}", temp_path))?;
    let mut buffer = [0u8; 8192];

    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("Failed while reading {url}"))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("Failed while writing download to {:?}", temp_path))?;
    }

    file.flush()
        .with_context(|| format!("Failed to flush download to {:?}", temp_path))?;
    fs::rename(&temp_path, dest)
        .with_context(|| format!("Failed to move download from {:?} to {:?}", temp_path, dest))?;

    Ok(())
}

fn extract_archive(archive_path: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive {:?}", archive_path))?;

    match format {
        ArchiveFormat::TarGz => Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .with_context(|| format!("Failed to unpack tar.gz archive {:?}", archive_path)),
        ArchiveFormat::TarXz => Archive::new(XzDecoder::new(file))
            .unpack(dest)
            .with_context(|| format!("Failed to unpack tar.xz archive {:?}", archive_path)),
        ArchiveFormat::Tar => Archive::new(file)
            .unpack(dest)
            .with_context(|| format!("Failed to unpack tar archive {:?}", archive_path)),
        ArchiveFormat::Zip => extract_zip(file, archive_path, dest),
    }
}

fn extract_zip(file: File, archive_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read zip archive {:?}", archive_path))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).with_context(|| {
            format!("Failed to read zip entry #{index} from {:?}", archive_path)
        })?;

        let Some(enclosed) = entry.enclosed_name().map(|path| dest.join(path)) else {
            continue;
        };

        if entry.name().ends_with('/') {
            fs::create_dir_all(&enclosed)
                .with_context(|| format!("Failed to create directory {:?}", enclosed))?;
            continue;
        }

        if let Some(parent) = enclosed.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory {:?}", parent))?;
        }

        let mut outfile = File::create(&enclosed)
            .with_context(|| format!("Failed to create file {:?}", enclosed))?;
        io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("Failed to extract zip entry {:?}", enclosed))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&enclosed, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("Failed to set permissions on {:?}", enclosed))?;
            }
        }
    }

    Ok(())
}

/// The lone directory inside `root`, if the archive wrapped its content in one.
fn single_top_level_dir(root: &Path) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(root)
        .with_context(|| format!("Failed to list {:?}", root))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to list {:?}", root))?;

    if entries.len() != 1 {
        return Ok(None);
    }

    let entry = entries.remove(0);
    if entry.file_type()?.is_dir() {
        Ok(Some(entry.path()))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn context(temp: &TempDir, offline: bool) -> FetchContext {
        FetchContext {
            sources_dir: temp.path().join("cache/sources"),
            git_dir: temp.path().join("cache/git"),
            downloads_dir: temp.path().join("cache/downloads"),
            offline,
        }
    }

    #[test]
    fn format_from_name() {
        assert_eq!(ArchiveFormat::from_name("a.tar.gz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_name("a.TXZ"), ArchiveFormat::TarXz);
        assert_eq!(ArchiveFormat::from_name("a.zip"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_name("a.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_name("main"), ArchiveFormat::TarGz);
    }

    #[test]
    fn fetch_file_archive_strips_wrapper_directory() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("overlay.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("overlay-main/packages/picotool/package.toml", "version = \"2.0.0\"\n"),
                ("overlay-main/README", "overlay"),
            ],
        );

        let fetcher = TarballFetcher::new(&format!("file://{}", archive.display()));
        let fetched = fetcher
            .fetch("pico", None, temp.path(), &context(&temp, true))
            .unwrap();

        assert!(fetched.root.join("packages/picotool/package.toml").exists());
        assert_eq!(fs::read_to_string(fetched.root.join("README")).unwrap(), "overlay");
        assert!(fetched.rev.is_none());
    }

    #[test]
    fn locked_archive_is_served_from_cache() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("overlay.tar.gz");
        write_tar_gz(&archive, &[("README", "overlay")]);

        let url = format!("file://{}", archive.display());
        let fetcher = TarballFetcher::new(&url);
        let fetched = fetcher
            .fetch("pico", None, temp.path(), &context(&temp, true))
            .unwrap();

        fs::remove_file(&archive).unwrap();
        let locked = LockedNode {
            url,
            kind: "tarball".to_string(),
            rev: None,
            hash: fetched.hash.clone(),
            last_modified: None,
            dependencies: Default::default(),
        };
        let again = fetcher
            .fetch("pico", Some(&locked), temp.path(), &context(&temp, true))
            .unwrap();
        assert_eq!(again, fetched);
    }

    #[test]
    fn remote_archive_offline_fails() {
        let temp = TempDir::new().unwrap();
        let fetcher = TarballFetcher::new("https://example.invalid/overlay.tar.gz");
        let err = fetcher
            .fetch("pico", None, temp.path(), &context(&temp, true))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::NotCached { .. })
        ));
    }
}
