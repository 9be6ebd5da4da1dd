//! Content Builder: per-architecture Flatpak OCI images and the
//! multi-architecture index that ties them together.
//!
//! For every [`ContentItem`] the builder
//!
//! 1. builds one single-architecture image per [`Arch`]
//!    ([`Builder::build_variant`]),
//! 2. writes an image index listing them, sorted by architecture
//!    ([`Builder::assemble_index`]),
//! 3. points the item's tag at that index ([`Builder::tag`]).
//!
//! The tag is only written once the index blob is on disk, so a failed item
//! never shows up as built.

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::arch::Arch;
use crate::content::{ContentItem, Payload, ALL_ITEMS, HELLO_COMMAND, HELLO_SCRIPT};
use crate::layer::{read_entries, Layer, LayerBuilder, SourceEntry, SourceKind};
use crate::oci::types::{
    ContainerConfig, RootFs, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::oci::{Descriptor, ImageConfig, ImageIndex, ImageManifest, OciLayout, Platform};
use crate::source::SourceImage;

pub const LABEL_REF: &str = "org.flatpak.ref";
pub const LABEL_METADATA: &str = "org.flatpak.metadata";
pub const LABEL_INSTALLED_SIZE: &str = "org.flatpak.installed-size";
pub const LABEL_DOWNLOAD_SIZE: &str = "org.flatpak.download-size";
/// Commit metadata key `xa.metadata`. `flatpak build-import-bundle --oci`
/// rebuilds the ostree commit metadata only from `org.flatpak.commit-metadata.*`
/// labels, and deploy refuses a commit without `xa.metadata`.
pub const LABEL_COMMIT_XA_METADATA: &str = "org.flatpak.commit-metadata.xa.metadata";

const OS: &str = "linux";

/// One architecture's image for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchVariant {
    pub item: &'static str,
    pub arch: Arch,
    /// Descriptor of the single-architecture manifest.
    pub manifest: Descriptor,
}

/// What a completed item build produced.
#[derive(Debug, Clone)]
pub struct BuiltItem {
    pub item: ContentItem,
    pub tag: String,
    pub index: Descriptor,
    pub variants: Vec<ArchVariant>,
}

pub struct Builder {
    layout: OciLayout,
    source: SourceImage,
}

impl Builder {
    pub fn new(layout: OciLayout, source: SourceImage) -> Self {
        Self { layout, source }
    }

    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    /// Build the single-architecture image of `item` for `arch`.
    pub fn build_variant(&self, item: &ContentItem, arch: Arch) -> Result<ArchVariant> {
        let flatpak_ref = item.flatpak_ref(arch);
        let metadata = item.metadata(arch);

        let layer = match item.payload {
            Payload::BusyboxUserland => self.userland_layer(arch, &metadata)?,
            Payload::HelloScript => hello_layer(&metadata)?,
        };

        let layer_desc = self
            .layout
            .put_blob(MEDIA_TYPE_OCI_LAYER_GZIP, &layer.compressed)?;

        let labels = BTreeMap::from([
            (LABEL_REF.to_string(), flatpak_ref.to_string()),
            (
                LABEL_COMMIT_XA_METADATA.to_string(),
                BASE64.encode(gvariant_string(&metadata)),
            ),
            (LABEL_METADATA.to_string(), metadata),
            (
                LABEL_INSTALLED_SIZE.to_string(),
                layer.uncompressed_size.to_string(),
            ),
            (LABEL_DOWNLOAD_SIZE.to_string(), layer_desc.size.to_string()),
        ]);
        let config = ImageConfig {
            architecture: arch.oci_name().to_string(),
            os: OS.to_string(),
            config: ContainerConfig { labels },
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![layer.diff_id.clone()],
            },
        };
        let config_desc = self.layout.put_json(MEDIA_TYPE_OCI_CONFIG, &config)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: config_desc,
            layers: vec![layer_desc],
            annotations: BTreeMap::from([(LABEL_REF.to_string(), flatpak_ref.to_string())]),
        };
        let manifest_desc = self.layout.put_json(MEDIA_TYPE_OCI_MANIFEST, &manifest)?;

        info!(
            item = item.id,
            %arch,
            flatpak_ref = %flatpak_ref,
            manifest = %manifest_desc.digest,
            "built single-arch image"
        );

        Ok(ArchVariant {
            item: item.id,
            arch,
            manifest: manifest_desc,
        })
    }

    /// Write the image index for `item`. Needs exactly one variant per
    /// supported architecture; entries are ordered by architecture name.
    pub fn assemble_index(
        &self,
        item: &ContentItem,
        variants: &[ArchVariant],
    ) -> Result<Descriptor> {
        let mut by_arch: BTreeMap<&'static str, &ArchVariant> = BTreeMap::new();
        for v in variants {
            if v.item != item.id {
                bail!(
                    "variant for '{}' passed while assembling index for '{}'",
                    v.item,
                    item.id
                );
            }
            if by_arch.insert(v.arch.oci_name(), v).is_some() {
                bail!("duplicate {} variant for '{}'", v.arch, item.id);
            }
        }
        let missing: Vec<_> = Arch::ALL
            .iter()
            .filter(|a| !by_arch.contains_key(a.oci_name()))
            .map(|a| a.oci_name())
            .collect();
        if !missing.is_empty() {
            bail!(
                "cannot assemble index for '{}': missing variants for {}",
                item.id,
                missing.join(", ")
            );
        }

        let manifests = by_arch
            .into_values()
            .map(|v| {
                let mut d = v.manifest.clone();
                d.platform = Some(Platform {
                    architecture: v.arch.oci_name().to_string(),
                    os: OS.to_string(),
                    variant: None,
                });
                d
            })
            .collect();

        let index = self
            .layout
            .put_json(MEDIA_TYPE_OCI_INDEX, &ImageIndex::new(manifests))?;
        debug!(item = item.id, index = %index.digest, "assembled image index");
        Ok(index)
    }

    /// Point the item's tag at `index`, replacing any previous target.
    pub fn tag(&self, item: &ContentItem, index: &Descriptor) -> Result<String> {
        let tag = item.tag();
        self.layout.set_tag(&tag, index)?;
        info!(item = item.id, tag = %tag, index = %index.digest, "tagged");
        Ok(tag)
    }

    /// Build, index and tag one item.
    pub fn build_item(&self, item: &ContentItem) -> Result<BuiltItem> {
        let variants = Arch::ALL
            .iter()
            .map(|&arch| self.build_variant(item, arch))
            .collect::<Result<Vec<_>>>()?;
        let index = self.assemble_index(item, &variants)?;
        let tag = self.tag(item, &index)?;
        Ok(BuiltItem {
            item: *item,
            tag,
            index,
            variants,
        })
    }

    /// Build every item, then drop blobs no tag reaches any more.
    pub fn build_all(&self) -> Result<Vec<BuiltItem>> {
        let built = ALL_ITEMS
            .iter()
            .map(|item| self.build_item(item))
            .collect::<Result<Vec<_>>>()?;
        let removed = self.layout.gc()?;
        if removed > 0 {
            info!(removed, "removed unreferenced blobs");
        }
        Ok(built)
    }

    fn userland_layer(&self, arch: Arch, metadata: &str) -> Result<Layer> {
        let source = self.source.userland_layer(arch)?;
        let entries = read_entries(&source.bytes)?;
        debug!(
            %arch,
            source_layer = %source.descriptor.digest,
            entries = entries.len(),
            "read source userland"
        );

        let mut layer = LayerBuilder::new();
        layer.file("metadata", 0o644, metadata)?;
        layer.dir("files", 0o755)?;
        add_userland(&mut layer, &entries)?;
        debug!(%arch, entries = layer.len(), "platform layer assembled");
        layer.finish()
    }
}

fn hello_layer(metadata: &str) -> Result<Layer> {
    let mut layer = LayerBuilder::new();
    layer.file("metadata", 0o644, metadata)?;
    layer.file(&format!("files/{HELLO_COMMAND}"), 0o755, HELLO_SCRIPT)?;
    layer.dir("export", 0o755)?;
    layer.finish()
}

/// Keep only `/bin/sh` out of busybox's `bin/`; Flatpak's OCI export does
/// not handle the hundreds of hard links there efficiently.
fn keep_userland_path(path: &str) -> bool {
    match path.strip_prefix("bin/") {
        Some(name) => name == "sh",
        None => true,
    }
}

/// Re-root busybox entries under `files/`. Hard links become regular files
/// carrying their target's content, since the target may have been dropped.
fn add_userland(layer: &mut LayerBuilder, entries: &[SourceEntry]) -> Result<()> {
    let files: BTreeMap<&str, (&[u8], u32)> = entries
        .iter()
        .filter_map(|e| match &e.kind {
            SourceKind::File(data) => Some((e.path.as_str(), (data.as_slice(), e.mode))),
            _ => None,
        })
        .collect();

    for entry in entries {
        if !keep_userland_path(&entry.path) || is_whiteout(&entry.path) {
            continue;
        }
        let dest = format!("files/{}", entry.path);
        match &entry.kind {
            SourceKind::Dir => {
                layer.dir(&dest, entry.mode)?;
            }
            SourceKind::File(data) => {
                layer.file(&dest, entry.mode, data.as_slice())?;
            }
            SourceKind::Symlink(target) => {
                layer.symlink(&dest, target)?;
            }
            SourceKind::HardLink(target) => {
                let Some((data, _)) = files.get(target.as_str()) else {
                    bail!(
                        "hard link {} points at {}, which is not a regular file in the source layer",
                        entry.path,
                        target
                    );
                };
                layer.file(&dest, entry.mode, *data)?;
            }
        }
    }
    Ok(())
}

/// Serialized GVariant of type `v` holding the string `value`: the string
/// and its NUL, the separator NUL, then the type string `s`.
fn gvariant_string(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 3);
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\0\0s");
    out
}

fn is_whiteout(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with(".wh."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{BUSYBOX_PLATFORM, HELLO_APP};
    use crate::error::FixtureError;
    use crate::testing::fake_busybox_source;
    use std::fs;
    use tempfile::TempDir;

    fn builder(tmp: &TempDir, arches: &[Arch]) -> Builder {
        let source = fake_busybox_source(tmp.path(), arches);
        let layout = OciLayout::create(&tmp.path().join("oci")).unwrap();
        Builder::new(layout, SourceImage::new(&source))
    }

    fn layer_entries(layout: &OciLayout, manifest: &Descriptor) -> Vec<SourceEntry> {
        let m: ImageManifest = layout.read_json(&manifest.digest).unwrap();
        read_entries(&layout.read_blob(&m.layers[0].digest).unwrap()).unwrap()
    }

    #[test]
    fn rebuild_is_byte_identical() {
        let tmp1 = TempDir::new().unwrap();
        let tmp2 = TempDir::new().unwrap();
        let a = builder(&tmp1, &Arch::ALL);
        let b = builder(&tmp2, &Arch::ALL);

        for item in ALL_ITEMS {
            let first = a.build_item(&item).unwrap();
            let again = a.build_item(&item).unwrap();
            let elsewhere = b.build_item(&item).unwrap();
            assert_eq!(first.index.digest, again.index.digest);
            assert_eq!(first.index.digest, elsewhere.index.digest);
            assert_eq!(
                a.layout().read_blob(&first.index.digest).unwrap(),
                b.layout().read_blob(&elsewhere.index.digest).unwrap()
            );
            assert_eq!(first.variants, elsewhere.variants);
        }
    }

    #[test]
    fn index_has_one_entry_per_arch_in_order() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);
        let built = b.build_item(&HELLO_APP).unwrap();

        let index: ImageIndex = b.layout().read_json(&built.index.digest).unwrap();
        let arches: Vec<_> = index
            .manifests
            .iter()
            .map(|d| d.platform.as_ref().unwrap().architecture.as_str())
            .collect();
        assert_eq!(arches, vec!["amd64", "arm64"]);
        assert!(index
            .manifests
            .iter()
            .all(|d| d.platform.as_ref().unwrap().os == "linux"));
        assert_eq!(index.media_type, MEDIA_TYPE_OCI_INDEX);
    }

    #[test]
    fn assemble_index_rejects_duplicates_and_omissions() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);
        let amd = b.build_variant(&HELLO_APP, Arch::Amd64).unwrap();
        let arm = b.build_variant(&HELLO_APP, Arch::Arm64).unwrap();

        assert!(b.assemble_index(&HELLO_APP, &[amd.clone()]).is_err());
        assert!(b
            .assemble_index(&HELLO_APP, &[amd.clone(), amd.clone(), arm.clone()])
            .is_err());
        assert!(b.assemble_index(&BUSYBOX_PLATFORM, &[amd.clone(), arm.clone()]).is_err());

        // Input order does not change the result.
        let fwd = b.assemble_index(&HELLO_APP, &[amd.clone(), arm.clone()]).unwrap();
        let rev = b.assemble_index(&HELLO_APP, &[arm, amd]).unwrap();
        assert_eq!(fwd, rev);
    }

    #[test]
    fn app_image_carries_flatpak_labels() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);
        let v = b.build_variant(&HELLO_APP, Arch::Arm64).unwrap();

        let manifest: ImageManifest = b.layout().read_json(&v.manifest.digest).unwrap();
        assert_eq!(
            manifest.annotations.get(LABEL_REF).map(String::as_str),
            Some("app/net.fishsoup.Hello/aarch64/stable")
        );
        assert_eq!(manifest.layers[0].media_type, MEDIA_TYPE_OCI_LAYER_GZIP);

        let config: ImageConfig = b.layout().read_json(&manifest.config.digest).unwrap();
        assert_eq!(config.architecture, "arm64");
        assert_eq!(config.os, "linux");
        assert_eq!(config.label(LABEL_REF), Some("app/net.fishsoup.Hello/aarch64/stable"));
        assert_eq!(config.label(LABEL_METADATA), Some(HELLO_APP.metadata(Arch::Arm64).as_str()));
        assert_eq!(
            config.label(LABEL_DOWNLOAD_SIZE),
            Some(manifest.layers[0].size.to_string().as_str())
        );
        assert_eq!(config.rootfs.diff_ids.len(), 1);
    }

    #[test]
    fn config_carries_xa_metadata_commit_label() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);

        for item in ALL_ITEMS {
            let v = b.build_variant(&item, Arch::Amd64).unwrap();
            let manifest: ImageManifest = b.layout().read_json(&v.manifest.digest).unwrap();
            let config: ImageConfig = b.layout().read_json(&manifest.config.digest).unwrap();

            let encoded = config.label(LABEL_COMMIT_XA_METADATA).unwrap();
            let raw = BASE64.decode(encoded).unwrap();
            let (body, tail) = raw.split_at(raw.len() - 3);
            assert_eq!(tail, b"\0\0s");
            assert_eq!(
                std::str::from_utf8(body).unwrap(),
                item.metadata(Arch::Amd64)
            );
        }
    }

    #[test]
    fn gvariant_string_layout() {
        assert_eq!(gvariant_string("ab"), b"ab\0\0s".to_vec());
        assert_eq!(gvariant_string(""), b"\0\0s".to_vec());
    }

    #[test]
    fn app_layer_contains_hello_script() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);
        let v = b.build_variant(&HELLO_APP, Arch::Amd64).unwrap();

        let entries = layer_entries(b.layout(), &v.manifest);
        let hello = entries.iter().find(|e| e.path == "files/bin/hello").unwrap();
        assert_eq!(hello.mode & 0o777, 0o755);
        let SourceKind::File(data) = &hello.kind else {
            panic!("hello is not a regular file");
        };
        let script = String::from_utf8(data.clone()).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("echo \"Hello, World\""));
        assert!(entries.iter().any(|e| e.path == "metadata"));
        assert!(entries.iter().any(|e| e.path == "export" && e.kind == SourceKind::Dir));
    }

    #[test]
    fn platform_layer_keeps_only_sh_from_bin() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);
        let v = b.build_variant(&BUSYBOX_PLATFORM, Arch::Arm64).unwrap();

        let entries = layer_entries(b.layout(), &v.manifest);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"files/bin/sh"));
        assert!(paths.contains(&"files/etc/passwd"));
        assert!(!paths.contains(&"files/bin/busybox"));
        assert!(!paths.contains(&"files/bin/ls"));

        // bin/sh was a hard link to the dropped bin/busybox.
        let sh = entries.iter().find(|e| e.path == "files/bin/sh").unwrap();
        assert_eq!(sh.kind, SourceKind::File(b"busybox-arm64".to_vec()));

        let mtab = entries.iter().find(|e| e.path == "files/etc/mtab").unwrap();
        assert_eq!(mtab.kind, SourceKind::Symlink("/proc/mounts".into()));

        let metadata = entries.iter().find(|e| e.path == "metadata").unwrap();
        assert_eq!(
            metadata.kind,
            SourceKind::File(BUSYBOX_PLATFORM.metadata(Arch::Arm64).into_bytes())
        );
    }

    #[test]
    fn missing_source_aborts_before_tagging() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &[Arch::Amd64]);

        let err = b.build_item(&BUSYBOX_PLATFORM).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FixtureError>(),
            Some(FixtureError::MissingSourceContent(_))
        ));
        assert!(b.layout().tags().unwrap().is_empty());

        // The app has no source dependency and still builds.
        b.build_item(&HELLO_APP).unwrap();
        assert_eq!(
            b.layout().tags().unwrap().keys().cloned().collect::<Vec<_>>(),
            vec![HELLO_APP.tag()]
        );
    }

    #[test]
    fn build_all_tags_both_items_and_collects_garbage() {
        let tmp = TempDir::new().unwrap();
        let b = builder(&tmp, &Arch::ALL);
        let stray = b.layout().put_blob(MEDIA_TYPE_OCI_CONFIG, b"stray").unwrap();

        let built = b.build_all().unwrap();
        assert_eq!(built.len(), 2);

        let tags = b.layout().tags().unwrap();
        assert_eq!(
            tags.keys().cloned().collect::<Vec<_>>(),
            vec![
                "oci-net.fishsoup.BusyBoxPlatform".to_string(),
                "oci-net.fishsoup.Hello".to_string()
            ]
        );
        assert!(!b.layout().has_blob(&stray.digest));
        assert!(b.layout().verify().unwrap() > 0);

        let index_json = fs::read_to_string(b.layout().root().join("index.json")).unwrap();
        assert!(index_json.contains("org.opencontainers.image.ref.name"));
    }

    #[test]
    fn whiteouts_are_recognised() {
        assert!(is_whiteout("etc/.wh.motd"));
        assert!(is_whiteout(".wh..wh..opq"));
        assert!(!is_whiteout("etc/motd"));
    }
}
