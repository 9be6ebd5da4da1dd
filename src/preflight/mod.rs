//! Preflight checks for host tools.
//!
//! Validates that the host has the external tools a run needs before any
//! output is written. This prevents half-finished runs with cryptic errors.
//!
//! # Example
//!
//! ```rust
//! use flatpak_oci_fixtures::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("flatpak") {
//!     println!("flatpak not installed");
//! }
//!
//! let tools = &[("flatpak", "flatpak"), ("ostree", "ostree")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::process;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Tools needed to fetch the busybox source image.
///
/// Each tuple is (command_name, package_name).
pub const FETCH_TOOLS: &[(&str, &str)] = &[("skopeo", "skopeo")];

/// Tools needed to install content into Flatpak.
pub const INSTALL_TOOLS: &[(&str, &str)] = &[("flatpak", "flatpak"), ("ostree", "ostree")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the tools `install-oci` shells out to.
pub fn check_install_tools() -> Result<()> {
    check_required_tools(INSTALL_TOOLS)
}

/// Check the tools needed to fetch the source image.
pub fn check_fetch_tools() -> Result<()> {
    check_required_tools(FETCH_TOOLS)
}
