//! Optional TOML configuration.
//!
//! Looked up from `$FIXTURES_CONFIG`, then `./fixtures.toml`. Every field has
//! a default, so running without a file is the normal case.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "FIXTURES_CONFIG";
pub const CONFIG_FILE: &str = "fixtures.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixturesConfig {
    pub layout: LayoutConfig,
    pub source: SourceConfig,
    pub install: InstallConfig,
}

/// Where the generated OCI layout lives.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub path: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("oci-content"),
        }
    }
}

/// The busybox source image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// Image reference handed to `skopeo copy`.
    pub image: String,
    /// Fetch the image when `path` does not exist.
    pub fetch: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("busybox"),
            image: "docker://docker.io/library/busybox".to_string(),
            fetch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallConfig {
    /// Name of the `--user` remote imported bundles are installed from.
    pub remote: String,
    /// ostree archive repo backing that remote.
    pub repo: PathBuf,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            remote: "flatpak-oci-fixtures".to_string(),
            repo: default_repo(),
        }
    }
}

fn default_repo() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("flatpak-oci-fixtures")
        .join("repo")
}

impl FixturesConfig {
    /// Load from the configured location, or defaults if there is none.
    pub fn load() -> Result<Self> {
        let env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match config_path(env, Path::new("."))? {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
    }
}

/// An explicit path must exist; the working-directory file is optional.
fn config_path(explicit: Option<PathBuf>, cwd: &Path) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("{} points at '{}', which is not a file", CONFIG_ENV, path.display());
        }
        return Ok(Some(path));
    }
    let local = cwd.join(CONFIG_FILE);
    Ok(local.is_file().then_some(local))
}
