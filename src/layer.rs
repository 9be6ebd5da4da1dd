//! Filesystem layers: deterministic tar+gzip writing and source-layer reading.
//!
//! Layers written here are reproducible: entries are sorted by path, every
//! header has mtime 0 and uid/gid 0, and the gzip header carries no
//! timestamp. Rebuilding from the same inputs gives the same bytes, hence
//! the same digest.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use crate::oci::Digest;

/// One entry of a layer being built.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
    Symlink { target: String },
}

/// Collects entries and writes them as a reproducible tar+gzip layer.
#[derive(Debug, Default)]
pub struct LayerBuilder {
    nodes: BTreeMap<String, Node>,
}

/// A finished layer.
#[derive(Debug, Clone)]
pub struct Layer {
    /// gzip-compressed tar, the blob stored in the layout.
    pub compressed: Vec<u8>,
    /// Digest of the uncompressed tar (`rootfs.diff_ids`).
    pub diff_id: Digest,
    pub uncompressed_size: u64,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(&mut self, path: &str, mode: u32) -> Result<&mut Self> {
        let path = normalize(path)?;
        self.parents(&path);
        self.nodes.insert(path, Node::Dir { mode });
        Ok(self)
    }

    pub fn file(&mut self, path: &str, mode: u32, data: impl Into<Vec<u8>>) -> Result<&mut Self> {
        let path = normalize(path)?;
        self.parents(&path);
        self.nodes.insert(
            path,
            Node::File {
                mode,
                data: data.into(),
            },
        );
        Ok(self)
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> Result<&mut Self> {
        let path = normalize(path)?;
        self.parents(&path);
        self.nodes.insert(
            path,
            Node::Symlink {
                target: target.to_string(),
            },
        );
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // Missing ancestors become 0755 directories.
    fn parents(&mut self, path: &str) {
        let mut end = 0;
        while let Some(pos) = path[end..].find('/') {
            end += pos;
            self.nodes
                .entry(path[..end].to_string())
                .or_insert(Node::Dir { mode: 0o755 });
            end += 1;
        }
    }

    pub fn finish(self) -> Result<Layer> {
        let mut builder = tar::Builder::new(Vec::new());

        for (path, node) in &self.nodes {
            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            match node {
                Node::Dir { mode } => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, path, std::io::empty())
                        .with_context(|| format!("Failed to add directory {path}"))?;
                }
                Node::File { mode, data } => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, path, data.as_slice())
                        .with_context(|| format!("Failed to add file {path}"))?;
                }
                Node::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header
                        .set_link_name(target)
                        .with_context(|| format!("Invalid symlink target for {path}: {target}"))?;
                    header.set_cksum();
                    builder
                        .append_data(&mut header, path, std::io::empty())
                        .with_context(|| format!("Failed to add symlink {path}"))?;
                }
            }
        }

        let tar_bytes = builder
            .into_inner()
            .context("Failed to finalize layer tar")?;
        let diff_id = Digest::of_bytes(&tar_bytes);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes)?;
        let compressed = encoder.finish().context("Failed to compress layer")?;

        Ok(Layer {
            compressed,
            diff_id,
            uncompressed_size: tar_bytes.len() as u64,
        })
    }
}

/// An entry read back from an existing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: String,
    pub mode: u32,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Dir,
    File(Vec<u8>),
    Symlink(String),
    /// Hard link to another path in the same layer.
    HardLink(String),
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Read every entry of a layer blob. The compression (none, gzip or zstd)
/// is detected from the blob's leading bytes.
pub fn read_entries(blob: &[u8]) -> Result<Vec<SourceEntry>> {
    let reader: Box<dyn Read + '_> = if blob.starts_with(GZIP_MAGIC) {
        Box::new(GzDecoder::new(blob))
    } else if blob.starts_with(ZSTD_MAGIC) {
        Box::new(zstd::stream::Decoder::new(Cursor::new(blob))?)
    } else {
        Box::new(blob)
    };

    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();
    for entry in archive.entries().context("Failed to read layer tar")? {
        let mut entry = entry.context("Failed to read layer entry")?;
        let raw_path = entry.path()?.to_string_lossy().into_owned();
        let Some(path) = normalize(&raw_path).ok() else {
            continue;
        };
        let mode = entry.header().mode().unwrap_or(0o644);

        let kind = match entry.header().entry_type() {
            tar::EntryType::Directory => SourceKind::Dir,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .with_context(|| format!("Failed to read {path} from layer"))?;
                SourceKind::File(data)
            }
            tar::EntryType::Symlink => SourceKind::Symlink(link_target(&entry, &path)?),
            tar::EntryType::Link => {
                let target = link_target(&entry, &path)?;
                SourceKind::HardLink(normalize(&target)?)
            }
            // Device nodes, fifos and pax/gnu extension records carry nothing
            // a Flatpak runtime can use.
            _ => continue,
        };
        out.push(SourceEntry { path, mode, kind });
    }
    Ok(out)
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, path: &str) -> Result<String> {
    match entry.link_name()? {
        Some(target) => Ok(target.to_string_lossy().into_owned()),
        None => bail!("link entry {path} has no target"),
    }
}

/// Strip `./` and `/` prefixes and trailing slashes; reject empty paths and
/// `..` components.
fn normalize(path: &str) -> Result<String> {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            break;
        }
    }
    let p = p.trim_end_matches('/');
    if p.is_empty() || p == "." {
        bail!("empty layer path '{path}'");
    }
    if p.split('/').any(|c| c == "..") {
        bail!("layer path escapes root: '{path}'");
    }
    Ok(p.to_string())
}
