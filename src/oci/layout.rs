//! On-disk OCI image layout.
//!
//! ```text
//! <root>/
//! ├── oci-layout          # {"imageLayoutVersion": "1.0.0"}
//! ├── index.json          # reference table: tag -> descriptor
//! └── blobs/
//!     └── sha256/
//!         └── <hex>       # layers, configs, manifests, indexes
//! ```
//!
//! Tags are the `org.opencontainers.image.ref.name` annotations of the
//! `index.json` entries. Blob and `index.json` writes go to a dot-prefixed
//! temp file in the destination directory and are renamed into place, so a
//! reader sees either the previous file or the complete new one.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use walkdir::WalkDir;

use super::digest::Digest;
use super::types::{
    is_index_media_type, is_manifest_media_type, Descriptor, ImageIndex, ImageLayout,
    ImageManifest, ANNOTATION_REF_NAME, OCI_LAYOUT_FILE,
};
use crate::error::FixtureError;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open the layout at `root`, creating the marker, blob directory and an
    /// empty `index.json` as needed.
    pub fn create(root: &Path) -> Result<Self> {
        let layout = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(layout.blobs_dir())
            .with_context(|| format!("Failed to create {}", layout.blobs_dir().display()))?;

        let marker = root.join(OCI_LAYOUT_FILE);
        if !marker.is_file() {
            write_atomic(&marker, &serde_json::to_vec_pretty(&ImageLayout::default())?)?;
        }
        if !layout.index_path().is_file() {
            layout.write_index(&ImageIndex::default())?;
        }
        Ok(layout)
    }

    /// Open an existing layout without modifying it.
    pub fn open(root: &Path) -> Result<Self> {
        let marker = root.join(OCI_LAYOUT_FILE);
        if !marker.is_file() {
            bail!("not an OCI layout (missing {}): {}", OCI_LAYOUT_FILE, root.display());
        }
        let bytes =
            fs::read(&marker).with_context(|| format!("Failed to read {}", marker.display()))?;
        let parsed: ImageLayout = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", marker.display()))?;
        if !parsed.version.starts_with("1.") {
            bail!(
                "unsupported OCI layout version '{}' in {}",
                parsed.version,
                root.display()
            );
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store `bytes` under their digest. Existing blobs are left alone.
    pub fn put_blob(&self, media_type: &str, bytes: &[u8]) -> Result<Descriptor> {
        let digest = Digest::of_bytes(bytes);
        let path = self.blob_path(&digest);
        if !path.is_file() {
            write_atomic(&path, bytes)?;
            debug!(%digest, size = bytes.len(), media_type, "wrote blob");
        }
        Ok(Descriptor::new(media_type, digest, bytes.len() as u64))
    }

    /// Serialize `value` as pretty JSON and store it as a blob.
    pub fn put_json<T: Serialize>(&self, media_type: &str, value: &T) -> Result<Descriptor> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialize {media_type}"))?;
        self.put_blob(media_type, &bytes)
    }

    /// Read a blob and check that its content still hashes to `digest`.
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let bytes = fs::read(&path).with_context(|| format!("Failed to read blob {}", path.display()))?;
        let actual = Digest::of_bytes(&bytes);
        if &actual != digest {
            return Err(FixtureError::DigestMismatch {
                path: path.display().to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(bytes)
    }

    pub fn read_json<T: DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        let bytes = self.read_blob(digest)?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse blob {}", self.blob_path(digest).display()))
    }

    /// Copy one blob from another layout, verifying it on the way.
    pub fn copy_blob_from(&self, other: &OciLayout, digest: &Digest) -> Result<()> {
        if self.has_blob(digest) {
            return Ok(());
        }
        let bytes = other.read_blob(digest)?;
        write_atomic(&self.blob_path(digest), &bytes)
    }

    /// The parsed `index.json`.
    pub fn index(&self) -> Result<ImageIndex> {
        let path = self.index_path();
        let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Replace the whole reference table.
    pub fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.index_path(), &bytes)
    }

    /// Tag name -> descriptor, for every annotated `index.json` entry.
    pub fn tags(&self) -> Result<BTreeMap<String, Descriptor>> {
        Ok(self
            .index()?
            .manifests
            .into_iter()
            .filter_map(|d| {
                let name = d.ref_name()?.to_string();
                Some((name, d))
            })
            .collect())
    }

    /// Point `name` at `target`, replacing any previous entry of that name.
    ///
    /// The blob must already exist; tagging is the last step of a build.
    pub fn set_tag(&self, name: &str, target: &Descriptor) -> Result<()> {
        if name.is_empty() {
            bail!("tag name must not be empty");
        }
        if !self.has_blob(&target.digest) {
            bail!("refusing to tag '{}': blob {} is not in the layout", name, target.digest);
        }

        let mut index = self.index()?;
        index.manifests.retain(|d| d.ref_name() != Some(name));

        let mut entry = target.clone();
        entry.platform = None;
        entry
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), name.to_string());
        index.manifests.push(entry);
        index
            .manifests
            .sort_by(|a, b| a.ref_name().cmp(&b.ref_name()));

        self.write_index(&index)?;
        debug!(tag = name, digest = %target.digest, "tagged");
        Ok(())
    }

    /// Look up a tag.
    pub fn resolve(&self, name: &str) -> Result<Descriptor> {
        let tags = self.tags()?;
        match tags.get(name) {
            Some(d) => Ok(d.clone()),
            None => Err(FixtureError::ReferenceNotFound {
                name: name.to_string(),
                known: FixtureError::list(tags.keys()),
            }
            .into()),
        }
    }

    /// Re-hash every blob. Returns the number of blobs checked.
    pub fn verify(&self) -> Result<usize> {
        let mut checked = 0;
        for ent in WalkDir::new(self.blobs_dir())
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let ent = ent.with_context(|| format!("Failed to walk {}", self.blobs_dir().display()))?;
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let expected = Digest::from_hex(&name)?;
            let (actual, _) = Digest::of_file(ent.path())?;
            if actual != expected {
                return Err(FixtureError::DigestMismatch {
                    path: ent.path().display().to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
            checked += 1;
        }
        Ok(checked)
    }

    /// Every blob reachable from the reference table.
    pub fn reachable(&self) -> Result<BTreeSet<Digest>> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<Descriptor> = self.index()?.manifests;

        while let Some(desc) = pending.pop() {
            if !seen.insert(desc.digest.clone()) {
                continue;
            }
            if is_index_media_type(&desc.media_type) {
                let child: ImageIndex = self.read_json(&desc.digest)?;
                pending.extend(child.manifests);
            } else if is_manifest_media_type(&desc.media_type) {
                let manifest: ImageManifest = self.read_json(&desc.digest)?;
                pending.push(manifest.config);
                pending.extend(manifest.layers);
            }
        }
        Ok(seen)
    }

    /// Delete blobs that no tag reaches, plus temp files left behind by
    /// interrupted writes in the blob directory or the layout root. Returns
    /// the number of files removed.
    pub fn gc(&self) -> Result<usize> {
        let keep = self.reachable()?;
        let mut removed = remove_files(&self.blobs_dir(), |name| {
            is_stale_tmp(name)
                || Digest::from_hex(name)
                    .map(|d| !keep.contains(&d))
                    .unwrap_or(false)
        })?;
        removed += remove_files(&self.root, is_stale_tmp)?;
        Ok(removed)
    }
}

/// Remove the regular files directly under `dir` whose name matches.
fn remove_files(dir: &Path, matches: impl Fn(&str) -> bool) -> Result<usize> {
    let mut removed = 0;
    for ent in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let ent = ent?;
        if !ent.file_type()?.is_file() {
            continue;
        }
        let name = ent.file_name().to_string_lossy().into_owned();
        if matches(&name) {
            fs::remove_file(ent.path())
                .with_context(|| format!("Failed to remove {}", ent.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_stale_tmp(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp-")
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".{prefix}.tmp-{}-{n}", std::process::id())
}

/// Write to a sibling temp file, then rename over `dst`.
fn write_atomic(dst: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blob".to_string());
    let tmp = parent.join(tmp_name(&file_name));
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(e)
            .with_context(|| format!("Failed to move {} to {}", tmp.display(), dst.display()));
    }
    Ok(())
}
