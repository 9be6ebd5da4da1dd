//! Test content for Flatpak's OCI support.
//!
//! Builds two fixed Flatpak items, a busybox-based platform runtime and a
//! "Hello, World" application, as multi-architecture (amd64 + arm64) OCI
//! image indexes in a local OCI layout, and installs them into Flatpak.
//!
//! # Architecture
//!
//! ```text
//! make-test-content                     install-oci <TAG>
//!     │                                     │
//!     ├── source: busybox OCI layout        ├── install: resolve tag,
//!     ├── builder: layer -> config ->       │   select arch, write a
//!     │   manifest per arch, index, tag     │   single-arch bundle
//!     └── oci: blobs + index.json  ───────▶ └── flatpak: Deployer
//! ```
//!
//! The layout is written only by the builder; the installer only reads it.
//!
//! # Example
//!
//! ```rust,ignore
//! use flatpak_oci_fixtures::{Arch, Builder, FlatpakCli, Installer, OciLayout, SourceImage};
//!
//! let layout = OciLayout::create("oci-content".as_ref())?;
//! Builder::new(layout.clone(), SourceImage::new("busybox".as_ref())).build_all()?;
//!
//! let installer = Installer::new(layout, FlatpakCli::new("local", "repo".as_ref()));
//! installer.install("oci-net.fishsoup.Hello", Arch::host()?)?;
//! ```

pub mod arch;
pub mod builder;
pub mod config;
pub mod content;
pub mod error;
pub mod flatpak;
pub mod install;
pub mod layer;
pub mod logging;
pub mod oci;
pub mod preflight;
pub mod process;
pub mod source;

#[cfg(test)]
mod testing;

pub use arch::Arch;
pub use builder::{ArchVariant, Builder, BuiltItem};
pub use config::FixturesConfig;
pub use content::{ContentItem, FlatpakRef, RefKind, BUSYBOX_PLATFORM, HELLO_APP};
pub use error::FixtureError;
pub use flatpak::{Deployer, FlatpakCli};
pub use install::{select_architecture, Installed, Installer};
pub use oci::{Digest, OciLayout};
pub use source::SourceImage;
