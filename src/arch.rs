//! Supported CPU architectures.
//!
//! OCI and Flatpak name the same architectures differently (`amd64` vs
//! `x86_64`, `arm64` vs `aarch64`). [`Arch`] holds both spellings and parses
//! from either.

use std::fmt;
use std::str::FromStr;

use crate::error::FixtureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Every supported architecture, sorted by OCI name.
    pub const ALL: [Arch; 2] = [Arch::Amd64, Arch::Arm64];

    /// Name used in OCI platform objects and image configs.
    pub fn oci_name(self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// Name used in Flatpak refs and metadata.
    pub fn flatpak_name(self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "aarch64",
        }
    }

    /// Architecture of the running binary.
    pub fn host() -> Result<Self, FixtureError> {
        std::env::consts::ARCH.parse()
    }
}

impl FromStr for Arch {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(FixtureError::UnsupportedArchitecture {
                requested: other.to_string(),
                available: FixtureError::list(Arch::ALL.iter().map(|a| a.oci_name())),
            }),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.oci_name())
    }
}
