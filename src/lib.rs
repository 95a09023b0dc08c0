// Public API
pub mod cli;
pub mod commands;

// Core domain types
mod config;
mod descriptor;
mod environment;
mod error;
mod fetch;
mod hash;
mod index;
mod lockfile;
mod platform;
mod resolve;
mod store;
mod toolchain;
mod ui;
mod util;
mod workspace;

// Re-export main types
pub use config::Config;
pub use descriptor::{Descriptor, DescriptorIssue, PackageRef};
pub use environment::{Activation, Shell};
pub use error::BuildError;
pub use fetch::{SourceKind, SourceUrl};
pub use index::InstalledPackage;
pub use lockfile::{LockedNode, Lockfile};
pub use platform::System;
pub use resolve::{Refresh, ResolvedGraph, ResolvedInput};
pub use store::Store;
pub use toolchain::{Component, ToolchainBundle};
pub use workspace::{Workspace, WorkspaceOptions, WorkspacePath};
