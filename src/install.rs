//! Installer: resolve a tag, pick the manifest for an architecture and hand
//! it to a [`Deployer`].
//!
//! `flatpak build-import-bundle --oci` cannot consume a multi-architecture
//! index, so the chosen manifest is first copied into a temporary
//! single-architecture layout whose `index.json` entry is annotated with the
//! Flatpak ref as `org.opencontainers.image.ref.name`.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::arch::Arch;
use crate::builder::LABEL_REF;
use crate::content::FlatpakRef;
use crate::error::FixtureError;
use crate::flatpak::Deployer;
use crate::oci::types::{is_index_media_type, is_manifest_media_type, ANNOTATION_REF_NAME};
use crate::oci::{Descriptor, ImageConfig, ImageIndex, ImageManifest, OciLayout, Platform};

/// Pick the single entry of `index` built for `arch`.
pub fn select_architecture(index: &ImageIndex, arch: Arch) -> Result<Descriptor> {
    let mut matching = index.manifests.iter().filter(|d| {
        d.platform
            .as_ref()
            .is_some_and(|p| p.architecture == arch.oci_name())
    });

    let Some(found) = matching.next() else {
        let available = index
            .manifests
            .iter()
            .filter_map(|d| d.platform.as_ref().map(|p| p.architecture.as_str()));
        return Err(FixtureError::UnsupportedArchitecture {
            requested: arch.oci_name().to_string(),
            available: FixtureError::list(available),
        }
        .into());
    };
    if matching.next().is_some() {
        bail!("image index lists more than one {} manifest", arch);
    }
    Ok(found.clone())
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub flatpak_ref: FlatpakRef,
    pub manifest: Descriptor,
}

pub struct Installer<D> {
    layout: OciLayout,
    deployer: D,
}

impl<D: Deployer> Installer<D> {
    pub fn new(layout: OciLayout, deployer: D) -> Self {
        Self { layout, deployer }
    }

    pub fn deployer(&self) -> &D {
        &self.deployer
    }

    pub fn resolve(&self, name: &str) -> Result<Descriptor> {
        self.layout.resolve(name)
    }

    /// The manifest to install from a tag's target: the `arch` entry of an
    /// index, or the target itself when it already is a manifest for `arch`.
    pub fn manifest_for(&self, target: &Descriptor, arch: Arch) -> Result<Descriptor> {
        if is_index_media_type(&target.media_type) {
            let index: ImageIndex = self.layout.read_json(&target.digest)?;
            return select_architecture(&index, arch);
        }
        if !is_manifest_media_type(&target.media_type) {
            bail!(
                "{} has unsupported media type {}",
                target.digest,
                target.media_type
            );
        }

        let (_, config) = self.read_image(target)?;
        if config.architecture != arch.oci_name() {
            return Err(FixtureError::UnsupportedArchitecture {
                requested: arch.oci_name().to_string(),
                available: config.architecture,
            }
            .into());
        }
        Ok(target.clone())
    }

    fn read_image(&self, manifest: &Descriptor) -> Result<(ImageManifest, ImageConfig)> {
        let m: ImageManifest = self.layout.read_json(&manifest.digest)?;
        let config: ImageConfig = self
            .layout
            .read_json(&m.config.digest)
            .with_context(|| format!("reading config of {}", manifest.digest))?;
        Ok((m, config))
    }

    /// The Flatpak ref recorded in the manifest's config labels.
    pub fn flatpak_ref(&self, manifest: &Descriptor) -> Result<FlatpakRef> {
        let (_, config) = self.read_image(manifest)?;
        let Some(raw) = config.label(LABEL_REF) else {
            bail!(
                "{} not found in labels of {} - is this a Flatpak?",
                LABEL_REF,
                manifest.digest
            );
        };
        FlatpakRef::parse(raw)
    }

    /// Copy `manifest` and everything it references into a new layout at
    /// `dest`, with a single annotated `index.json` entry.
    pub fn write_bundle(&self, manifest: &Descriptor, arch: Arch, dest: &Path) -> Result<FlatpakRef> {
        let flatpak_ref = self.flatpak_ref(manifest)?;
        let (m, _) = self.read_image(manifest)?;

        let bundle = OciLayout::create(dest)?;
        bundle.copy_blob_from(&self.layout, &manifest.digest)?;
        bundle.copy_blob_from(&self.layout, &m.config.digest)?;
        for layer in &m.layers {
            bundle.copy_blob_from(&self.layout, &layer.digest)?;
        }

        let mut entry = manifest.clone();
        entry.platform = Some(Platform {
            architecture: arch.oci_name().to_string(),
            os: "linux".to_string(),
            variant: None,
        });
        entry.annotations = BTreeMap::from([(
            ANNOTATION_REF_NAME.to_string(),
            flatpak_ref.to_string(),
        )]);
        bundle.write_index(&ImageIndex::new(vec![entry]))?;
        Ok(flatpak_ref)
    }

    /// Resolve `name`, select `arch` and install the result.
    pub fn install(&self, name: &str, arch: Arch) -> Result<Installed> {
        let target = self.resolve(name)?;
        let manifest = self.manifest_for(&target, arch)?;
        info!(tag = name, %arch, manifest = %manifest.digest, "resolved");

        let tmp = tempfile::Builder::new()
            .prefix("flatpak-oci-")
            .tempdir()
            .context("creating temporary bundle directory")?;
        let flatpak_ref = self.write_bundle(&manifest, arch, tmp.path())?;

        self.deployer.ensure_remote()?;
        self.deployer.import_bundle(&flatpak_ref, tmp.path())?;
        self.deployer.install(&flatpak_ref)?;
        info!(flatpak_ref = %flatpak_ref, "installed");

        Ok(Installed {
            flatpak_ref,
            manifest,
        })
    }
}
