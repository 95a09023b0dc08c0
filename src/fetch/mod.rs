use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::BuildError;
use crate::lockfile::LockedNode;

mod git;
mod path;
mod tarball;

use git::GitFetcher;
use path::PathFetcher;
use tarball::TarballFetcher;

const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar", ".zip"];

/// Where fetched trees and fetch caches live.
#[derive(Clone, Debug)]
pub(crate) struct FetchContext {
    /// Unpacked input trees
    pub sources_dir: PathBuf,
    /// Bare git repositories, one per remote
    pub git_dir: PathBuf,
    /// Downloaded archives
    pub downloads_dir: PathBuf,
    pub offline: bool,
}

/// A fetched, pinned input tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Fetched {
    pub root: PathBuf,
    /// Directory that relative dependency locations are anchored to
    pub origin: PathBuf,
    pub rev: Option<String>,
    pub hash: String,
    pub last_modified: Option<String>,
}

pub(crate) trait InputFetcher {
    /// Fetch the input, honoring `locked` as the pin when present.
    ///
    /// `base_dir` anchors relative locations.
    fn fetch(
        &self,
        name: &str,
        locked: Option<&LockedNode>,
        base_dir: &Path,
        context: &FetchContext,
    ) -> Result<Fetched>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Path,
    Git,
    Tarball,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Path => "path",
            SourceKind::Git => "git",
            SourceKind::Tarball => "tarball",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed input location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUrl {
    /// `path:<dir>`
    Path { path: String },
    /// `git+<transport>://...?ref=..&rev=..`; `url` has the `git+` prefix
    /// and query removed.
    Git {
        url: String,
        reference: Option<String>,
        rev: Option<String>,
    },
    /// Archive over `http(s)` or `file`.
    Tarball { url: String },
}

impl SourceUrl {
    pub fn parse(value: &str) -> Result<Self, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidUrl {
            url: value.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = value.trim();
        if let Some(path) = trimmed.strip_prefix("path:") {
            if path.trim().is_empty() {
                return Err(invalid("path is empty"));
            }
            return Ok(SourceUrl::Path {
                path: path.trim().to_string(),
            });
        }

        let parsed = Url::parse(trimmed).map_err(|err| invalid(&err.to_string()))?;
        let scheme = parsed.scheme().to_string();

        if let Some(transport) = scheme.strip_prefix("git+") {
            if !matches!(transport, "https" | "http" | "ssh" | "file") {
                return Err(invalid("unsupported git transport"));
            }

            let mut reference = None;
            let mut rev = None;
            for (key, val) in parsed.query_pairs() {
                match key.as_ref() {
                    "ref" => reference = Some(val.into_owned()),
                    "rev" => {
                        if val.len() != 40 || !val.chars().all(|c| c.is_ascii_hexdigit()) {
                            return Err(invalid("rev must be a full 40-character commit id"));
                        }
                        rev = Some(val.to_ascii_lowercase());
                    }
                    other => return Err(invalid(&format!("unknown query parameter '{other}'"))),
                }
            }

            let mut transport_url = parsed.clone();
            transport_url.set_query(None);
            let url = transport_url
                .as_str()
                .strip_prefix("git+")
                .unwrap_or(transport_url.as_str())
                .to_string();

            return Ok(SourceUrl::Git {
                url,
                reference,
                rev,
            });
        }

        if let Some(transport) = scheme.strip_prefix("tarball+") {
            if !matches!(transport, "https" | "http" | "file") {
                return Err(invalid("unsupported tarball transport"));
            }
            let url = trimmed
                .strip_prefix("tarball+")
                .unwrap_or(trimmed)
                .to_string();
            return Ok(SourceUrl::Tarball { url });
        }

        if matches!(scheme.as_str(), "https" | "http" | "file") {
            let path = parsed.path().to_ascii_lowercase();
            if ARCHIVE_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
                return Ok(SourceUrl::Tarball {
                    url: trimmed.to_string(),
                });
            }
            return Err(invalid(
                "not an archive; use git+https:// for repositories or tarball+https:// for archives",
            ));
        }

        Err(invalid(&format!("unsupported scheme '{scheme}'")))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            SourceUrl::Path { .. } => SourceKind::Path,
            SourceUrl::Git { .. } => SourceKind::Git,
            SourceUrl::Tarball { .. } => SourceKind::Tarball,
        }
    }
}

pub(crate) fn create_fetcher(source: &SourceUrl) -> Box<dyn InputFetcher> {
    match source {
        SourceUrl::Path { path } => Box::new(PathFetcher::new(path)),
        SourceUrl::Git {
            url,
            reference,
            rev,
        } => Box::new(GitFetcher::new(url, reference.clone(), rev.clone())),
        SourceUrl::Tarball { url } => Box::new(TarballFetcher::new(url)),
    }
}

/// Directory name for a content-addressed source tree.
pub(crate) fn source_dir_name(hash: &str) -> String {
    let hex = hash.strip_prefix("sha256:").unwrap_or(hash);
    let end = hex.len().min(crate::hash::STORE_HASH_LEN);
    format!("tree-{}", &hex[..end])
}

/// Reject a fetched tree whose hash differs from the locked one.
pub(crate) fn verify_hash(
    name: &str,
    locked: Option<&LockedNode>,
    actual: &str,
) -> Result<(), BuildError> {
    match locked {
        Some(node) if node.hash != actual => Err(BuildError::HashMismatch {
            name: name.to_string(),
            expected: node.hash.clone(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}
