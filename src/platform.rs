use anyhow::{bail, Result};
use regex::Regex;
use std::env;
use std::fmt;
use std::sync::OnceLock;

/// Platform identifier in `<os>-<arch>` form, e.g. `linux-x86_64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct System(String);

fn system_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_]+-[a-z0-9_]+$").expect("system pattern is valid"))
}

impl System {
    /// System of the running host.
    pub fn host() -> Self {
        let os = match env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self(format!("{}-{}", os, env::consts::ARCH))
    }

    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        if !system_pattern().is_match(&normalized) {
            bail!("Invalid system '{value}'; expected <os>-<arch> such as linux-x86_64");
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
