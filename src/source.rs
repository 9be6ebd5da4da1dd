//! The busybox source image the platform runtime is derived from.
//!
//! The source is a multi-architecture OCI layout, as written by
//! `skopeo copy --multi-arch=all docker://docker.io/library/busybox oci:<dir>`.
//! Anything wrong with it (directory absent, no manifest for the requested
//! architecture, unreadable blobs) is reported as
//! [`FixtureError::MissingSourceContent`].

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::arch::Arch;
use crate::error::FixtureError;
use crate::oci::types::{is_index_media_type, is_manifest_media_type};
use crate::oci::{Descriptor, ImageIndex, ImageManifest, OciLayout};
use crate::process::Cmd;

/// Nested indexes deeper than this are treated as malformed.
const MAX_INDEX_DEPTH: usize = 4;

/// The first layer of the source image for one architecture.
#[derive(Debug, Clone)]
pub struct SourceLayer {
    pub descriptor: Descriptor,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SourceImage {
    path: PathBuf,
}

impl SourceImage {
    /// Refer to a source layout. Nothing is read until a layer is requested.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.join(crate::oci::types::OCI_LAYOUT_FILE).is_file()
    }

    /// Copy `image` (a skopeo transport reference) into this layout with
    /// every architecture included.
    pub fn fetch(&self, image: &str) -> Result<()> {
        info!(image, dest = %self.path.display(), "fetching source image (all architectures)");
        Cmd::new("skopeo")
            .args(["copy", "--multi-arch=all", image])
            .arg(format!("oci:{}", self.path.display()))
            .error_msg("skopeo copy of the source image failed. Install skopeo.")
            .run()?;
        Ok(())
    }

    fn layout(&self) -> Result<OciLayout> {
        if !self.path.is_dir() {
            return Err(missing(format!(
                "source image directory {} does not exist",
                self.path.display()
            )));
        }
        OciLayout::open(&self.path)
            .map_err(|e| missing(format!("{}: {e:#}", self.path.display())))
    }

    /// Find the manifest for `linux/<arch>`, descending through nested
    /// indexes starting from `index.json`.
    pub fn manifest_for(&self, arch: Arch) -> Result<(Descriptor, ImageManifest)> {
        let layout = self.layout()?;
        let top = layout
            .index()
            .map_err(|e| missing(format!("{}: {e:#}", self.path.display())))?;

        let mut seen_arches = Vec::new();
        let found = find_manifest(&layout, top, arch, 0, &mut seen_arches)?;
        let Some(desc) = found else {
            return Err(missing(format!(
                "no linux/{} manifest in {} (found: {})",
                arch,
                self.path.display(),
                FixtureError::list(&seen_arches)
            )));
        };

        let manifest: ImageManifest = layout
            .read_json(&desc.digest)
            .map_err(|e| missing(format!("manifest {}: {e:#}", desc.digest)))?;
        Ok((desc, manifest))
    }

    /// Read the first (userland) layer for `arch`.
    pub fn userland_layer(&self, arch: Arch) -> Result<SourceLayer> {
        let (_, manifest) = self.manifest_for(arch)?;
        let Some(descriptor) = manifest.layers.first().cloned() else {
            return Err(missing(format!(
                "linux/{arch} manifest in {} has no layers",
                self.path.display()
            )));
        };
        let layout = self.layout()?;
        let bytes = layout
            .read_blob(&descriptor.digest)
            .map_err(|e| missing(format!("layer {}: {e:#}", descriptor.digest)))?;
        Ok(SourceLayer { descriptor, bytes })
    }
}

fn find_manifest(
    layout: &OciLayout,
    index: ImageIndex,
    arch: Arch,
    depth: usize,
    seen_arches: &mut Vec<String>,
) -> Result<Option<Descriptor>> {
    if depth > MAX_INDEX_DEPTH {
        return Err(missing(format!(
            "image index nesting deeper than {MAX_INDEX_DEPTH} in {}",
            layout.root().display()
        )));
    }

    for desc in index.manifests {
        if is_index_media_type(&desc.media_type) {
            let child: ImageIndex = layout
                .read_json(&desc.digest)
                .with_context(|| format!("reading nested index {}", desc.digest))
                .map_err(|e| missing(format!("{e:#}")))?;
            if let Some(found) = find_manifest(layout, child, arch, depth + 1, seen_arches)? {
                return Ok(Some(found));
            }
        } else if is_manifest_media_type(&desc.media_type) {
            let Some(platform) = &desc.platform else {
                continue;
            };
            if platform.os == "linux" && platform.architecture == arch.oci_name() {
                return Ok(Some(desc));
            }
            seen_arches.push(platform.architecture.clone());
        }
    }
    Ok(None)
}

fn missing(what: String) -> anyhow::Error {
    FixtureError::MissingSourceContent(what).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{read_entries, SourceKind};
    use crate::testing::fake_busybox_source;
    use tempfile::TempDir;

    fn is_missing(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<FixtureError>(),
            Some(FixtureError::MissingSourceContent(_))
        )
    }

    #[test]
    fn finds_layer_through_nested_index() {
        let tmp = TempDir::new().unwrap();
        let src = SourceImage::new(&fake_busybox_source(tmp.path(), &[Arch::Amd64, Arch::Arm64]));
        assert!(src.exists());

        for arch in Arch::ALL {
            let layer = src.userland_layer(arch).unwrap();
            let entries = read_entries(&layer.bytes).unwrap();
            let busybox = entries.iter().find(|e| e.path == "bin/busybox").unwrap();
            assert_eq!(
                busybox.kind,
                SourceKind::File(format!("busybox-{}", arch.oci_name()).into_bytes())
            );
        }
    }

    #[test]
    fn missing_directory_is_missing_source_content() {
        let tmp = TempDir::new().unwrap();
        let src = SourceImage::new(&tmp.path().join("nope"));
        assert!(!src.exists());
        let err = src.userland_layer(Arch::Amd64).unwrap_err();
        assert!(is_missing(&err));
    }

    #[test]
    fn absent_architecture_is_missing_source_content() {
        let tmp = TempDir::new().unwrap();
        let src = SourceImage::new(&fake_busybox_source(tmp.path(), &[Arch::Amd64]));
        let err = src.userland_layer(Arch::Arm64).unwrap_err();
        assert!(is_missing(&err));
        assert!(format!("{err}").contains("linux/arm64"));
    }

    #[test]
    fn deleted_layer_blob_is_missing_source_content() {
        let tmp = TempDir::new().unwrap();
        let root = fake_busybox_source(tmp.path(), &[Arch::Amd64]);
        let src = SourceImage::new(&root);
        let (_, manifest) = src.manifest_for(Arch::Amd64).unwrap();
        std::fs::remove_file(root.join("blobs/sha256").join(manifest.layers[0].digest.hex()))
            .unwrap();
        assert!(is_missing(&src.userland_layer(Arch::Amd64).unwrap_err()));
    }
}
