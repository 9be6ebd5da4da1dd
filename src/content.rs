//! The two fixed pieces of test content.
//!
//! Items are plain values: there are exactly two of them and nothing is
//! meant to add more at runtime.

use anyhow::{bail, Result};
use std::fmt;

use crate::arch::Arch;

/// Flatpak ref kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Runtime,
    App,
}

impl RefKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RefKind::Runtime => "runtime",
            RefKind::App => "app",
        }
    }
}

/// Where an item's filesystem layer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Userland re-used from the busybox source image.
    BusyboxUserland,
    /// A single generated script printing a greeting.
    HelloScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentItem {
    /// Reverse-DNS identifier.
    pub id: &'static str,
    pub kind: RefKind,
    pub branch: &'static str,
    pub payload: Payload,
}

pub const PLATFORM_ID: &str = "net.fishsoup.BusyBoxPlatform";
pub const PLATFORM_BRANCH: &str = "2023";
pub const SDK_ID: &str = "net.fishsoup.BusyBoxSdk";

pub const BUSYBOX_PLATFORM: ContentItem = ContentItem {
    id: PLATFORM_ID,
    kind: RefKind::Runtime,
    branch: PLATFORM_BRANCH,
    payload: Payload::BusyboxUserland,
};

pub const HELLO_APP: ContentItem = ContentItem {
    id: "net.fishsoup.Hello",
    kind: RefKind::App,
    branch: "stable",
    payload: Payload::HelloScript,
};

/// Build order: the runtime comes first since the app depends on it.
pub const ALL_ITEMS: [ContentItem; 2] = [BUSYBOX_PLATFORM, HELLO_APP];

/// Command the app's metadata points at, relative to `/app`.
pub const HELLO_COMMAND: &str = "bin/hello";

pub const HELLO_SCRIPT: &str = "#!/bin/sh\necho \"Hello, World\"\n";

impl ContentItem {
    /// Reference name the item is tagged under in the OCI layout.
    pub fn tag(&self) -> String {
        format!("oci-{}", self.id)
    }

    pub fn flatpak_ref(&self, arch: Arch) -> FlatpakRef {
        FlatpakRef {
            kind: self.kind,
            id: self.id.to_string(),
            arch: arch.flatpak_name().to_string(),
            branch: self.branch.to_string(),
        }
    }

    /// Flatpak `metadata` keyfile for this item.
    pub fn metadata(&self, arch: Arch) -> String {
        let arch = arch.flatpak_name();
        match self.kind {
            RefKind::Runtime => format!(
                "[Runtime]\n\
                 name={id}\n\
                 runtime={PLATFORM_ID}/{arch}/{PLATFORM_BRANCH}\n\
                 sdk={SDK_ID}/{arch}/{PLATFORM_BRANCH}\n",
                id = self.id,
            ),
            RefKind::App => format!(
                "[Application]\n\
                 name={id}\n\
                 runtime={PLATFORM_ID}/{arch}/{PLATFORM_BRANCH}\n\
                 sdk={SDK_ID}/{arch}/{PLATFORM_BRANCH}\n\
                 command=/app/{HELLO_COMMAND}\n",
                id = self.id,
            ),
        }
    }

    /// Look up an item by tag or by bare id.
    pub fn by_name(name: &str) -> Option<ContentItem> {
        ALL_ITEMS
            .into_iter()
            .find(|item| item.id == name || item.tag() == name)
    }
}

/// A parsed `<kind>/<id>/<arch>/<branch>` Flatpak ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatpakRef {
    pub kind: RefKind,
    pub id: String,
    pub arch: String,
    pub branch: String,
}

impl FlatpakRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        let [kind, id, arch, branch] = parts.as_slice() else {
            bail!("invalid flatpak ref '{raw}': expected <kind>/<id>/<arch>/<branch>");
        };
        let kind = match *kind {
            "runtime" => RefKind::Runtime,
            "app" => RefKind::App,
            other => bail!("invalid flatpak ref '{raw}': unknown kind '{other}'"),
        };
        if id.is_empty() || arch.is_empty() || branch.is_empty() {
            bail!("invalid flatpak ref '{raw}': empty component");
        }
        Ok(Self {
            kind,
            id: id.to_string(),
            arch: arch.to_string(),
            branch: branch.to_string(),
        })
    }

    /// `<kind>/<id>`, as accepted by `flatpak info`.
    pub fn short(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for FlatpakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind.as_str(),
            self.id,
            self.arch,
            self.branch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_match_layout_names() {
        assert_eq!(BUSYBOX_PLATFORM.tag(), "oci-net.fishsoup.BusyBoxPlatform");
        assert_eq!(HELLO_APP.tag(), "oci-net.fishsoup.Hello");
    }

    #[test]
    fn flatpak_ref_roundtrips_through_display() {
        let r = HELLO_APP.flatpak_ref(Arch::Amd64);
        assert_eq!(r.to_string(), "app/net.fishsoup.Hello/x86_64/stable");
        assert_eq!(FlatpakRef::parse(&r.to_string()).unwrap(), r);
        assert_eq!(r.short(), "app/net.fishsoup.Hello");
    }

    #[test]
    fn flatpak_ref_rejects_malformed() {
        assert!(FlatpakRef::parse("app/net.fishsoup.Hello/x86_64").is_err());
        assert!(FlatpakRef::parse("bundle/a/b/c").is_err());
        assert!(FlatpakRef::parse("app//x86_64/stable").is_err());
    }

    #[test]
    fn runtime_metadata_names_platform_and_sdk() {
        let md = BUSYBOX_PLATFORM.metadata(Arch::Arm64);
        assert!(md.starts_with("[Runtime]\n"));
        assert!(md.contains("runtime=net.fishsoup.BusyBoxPlatform/aarch64/2023\n"));
        assert!(md.contains("sdk=net.fishsoup.BusyBoxSdk/aarch64/2023\n"));
    }

    #[test]
    fn app_metadata_has_command() {
        let md = HELLO_APP.metadata(Arch::Amd64);
        assert!(md.starts_with("[Application]\nname=net.fishsoup.Hello\n"));
        assert!(md.contains("command=/app/bin/hello\n"));
    }

    #[test]
    fn by_name_accepts_tag_or_id() {
        assert_eq!(ContentItem::by_name("oci-net.fishsoup.Hello"), Some(HELLO_APP));
        assert_eq!(
            ContentItem::by_name("net.fishsoup.BusyBoxPlatform"),
            Some(BUSYBOX_PLATFORM)
        );
        assert_eq!(ContentItem::by_name("org.example.Other"), None);
    }
}
