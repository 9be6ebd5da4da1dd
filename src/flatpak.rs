//! The deployment side: importing and installing OCI bundles with Flatpak.
//!
//! [`Deployer`] is what the installer needs from Flatpak. [`FlatpakCli`]
//! implements it by shelling out to `flatpak` and `ostree`, keeping imported
//! bundles in a private archive repo exposed as a `--user` remote.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::content::FlatpakRef;
use crate::process::Cmd;

pub trait Deployer {
    /// Create the local repo and register it as a remote if needed.
    fn ensure_remote(&self) -> Result<()>;

    /// Import a single-architecture OCI layout into the local repo.
    fn import_bundle(&self, flatpak_ref: &FlatpakRef, bundle: &Path) -> Result<()>;

    /// Install the imported ref, or update it if it is already installed
    /// from our remote.
    fn install(&self, flatpak_ref: &FlatpakRef) -> Result<()>;

    /// Launch an installed application.
    fn run(&self, app_id: &str) -> Result<()>;
}

/// [`Deployer`] backed by the `flatpak` and `ostree` command-line tools.
#[derive(Debug, Clone)]
pub struct FlatpakCli {
    remote: String,
    repo: PathBuf,
}

impl FlatpakCli {
    pub fn new(remote: &str, repo: &Path) -> Self {
        Self {
            remote: remote.to_string(),
            repo: repo.to_path_buf(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn init_repo(&self) -> Result<()> {
        if let Some(parent) = self.repo.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(repo = %self.repo.display(), "initializing local repo");
        Cmd::new("ostree")
            .args(["init", "--mode=archive-z2", "--repo"])
            .arg_path(&self.repo)
            .error_msg("ostree init failed")
            .run()?;
        Cmd::new("flatpak")
            .arg("build-update-repo")
            .arg_path(&self.repo)
            .error_msg("flatpak build-update-repo failed")
            .run()?;
        Ok(())
    }

    /// Origin remote of an installed ref, if it is installed at all.
    fn installed_origin(&self, flatpak_ref: &FlatpakRef) -> Result<Option<String>> {
        let out = Cmd::new("flatpak")
            .args(["info", "--user", "-o"])
            .arg(flatpak_ref.short())
            .allow_fail()
            .run()?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout_trimmed().to_string()))
    }
}

impl Deployer for FlatpakCli {
    fn ensure_remote(&self) -> Result<()> {
        if !self.repo.exists() {
            self.init_repo()?;
        }

        let remotes = Cmd::new("flatpak")
            .args(["remotes", "--user"])
            .error_msg("flatpak remotes failed")
            .run()?;
        if !has_remote(&remotes.stdout, &self.remote) {
            info!(remote = %self.remote, "adding local remote");
            Cmd::new("flatpak")
                .args(["remote-add", "--user", "--no-gpg-verify"])
                .arg(&self.remote)
                .arg_path(&self.repo)
                .error_msg("flatpak remote-add failed")
                .run()?;
        }
        Ok(())
    }

    fn import_bundle(&self, flatpak_ref: &FlatpakRef, bundle: &Path) -> Result<()> {
        info!(flatpak_ref = %flatpak_ref, "importing OCI bundle");
        Cmd::new("flatpak")
            .args(["build-import-bundle", "--update-appstream", "--oci", "--ref"])
            .arg(flatpak_ref.to_string())
            .arg_path(&self.repo)
            .arg_path(bundle)
            .error_msg("flatpak build-import-bundle failed")
            .run()?;
        Ok(())
    }

    fn install(&self, flatpak_ref: &FlatpakRef) -> Result<()> {
        let origin = self.installed_origin(flatpak_ref)?;
        let cmd = if origin.as_deref() == Some(self.remote.as_str()) {
            info!(flatpak_ref = %flatpak_ref, "updating");
            Cmd::new("flatpak")
                .args(["update", "-y", "--user"])
                .arg(flatpak_ref.to_string())
        } else {
            info!(flatpak_ref = %flatpak_ref, remote = %self.remote, "installing");
            Cmd::new("flatpak")
                .args(["install", "-y", "--user", "--reinstall"])
                .arg(&self.remote)
                .arg(flatpak_ref.to_string())
        };
        cmd.inherit_output()
            .error_msg("flatpak install failed")
            .run()?;
        Ok(())
    }

    fn run(&self, app_id: &str) -> Result<()> {
        Cmd::new("flatpak")
            .args(["run", "--user", app_id])
            .inherit_output()
            .error_msg("flatpak run failed")
            .run()?;
        Ok(())
    }
}

/// Whether `flatpak remotes` output lists `name` in its first column.
fn has_remote(output: &str, name: &str) -> bool {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|first| first == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_remote_matches_first_column_only() {
        let out = "flathub\tuser\nflatpak-oci-fixtures\tuser,no-gpg-verify\n";
        assert!(has_remote(out, "flatpak-oci-fixtures"));
        assert!(has_remote(out, "flathub"));
        assert!(!has_remote(out, "user"));
        assert!(!has_remote(out, "flatpak-oci"));
        assert!(!has_remote("", "flathub"));
    }

    #[test]
    fn accessors() {
        let cli = FlatpakCli::new("local", Path::new("/tmp/repo"));
        assert_eq!(cli.remote(), "local");
        assert_eq!(cli.repo(), Path::new("/tmp/repo"));
    }
}
