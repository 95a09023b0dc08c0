use std::path::PathBuf;
use thiserror::Error;

/// Resolution and build failures.
///
/// Every variant is fatal: the shell is never activated once one of these
/// surfaces, and nothing is exported.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("input '{name}' is not declared in the descriptor")]
    UnknownInput { name: String },

    #[error("invalid input URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to fetch input '{name}' from {url}: {reason}")]
    FetchFailed {
        name: String,
        url: String,
        reason: String,
    },

    #[error("input '{name}' is not available offline; run without --offline to fetch it")]
    NotCached { name: String },

    #[error("hash mismatch for input '{name}'\n  locked: {expected}\n  actual: {actual}\nRun 'devshell update {name}' to re-lock it.")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("package '{package}' is not provided by input '{input}'")]
    MissingPackage { input: String, package: String },

    #[error("'{artifact}' does not support system '{system}'")]
    UnsupportedSystem { artifact: String, system: String },

    #[error("toolchain channel '{channel}' is not provided by input '{input}'")]
    UnknownChannel { input: String, channel: String },

    #[error("unknown toolchain component '{name}' (expected one of: rustc, cargo, clippy, rustfmt, rust-src)")]
    UnknownComponent { name: String },

    #[error("toolchain {version} does not provide {kind} '{name}'")]
    MissingToolchainArtifact {
        version: String,
        kind: &'static str,
        name: String,
    },

    #[error("version skew: {artifact} is {actual} but the pinned toolchain is {expected}")]
    VersionSkew {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("file collision while merging '{name}': {path:?} is provided by both {first:?} and {second:?}")]
    MergeCollision {
        name: String,
        path: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("input dependency chain too deep at '{node}'")]
    RecursionLimit { node: String },
}
