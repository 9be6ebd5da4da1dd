//! Fixtures shared by unit tests.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::arch::Arch;
use crate::oci::types::{
    ContainerConfig, RootFs, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::oci::{Digest, ImageConfig, ImageIndex, ImageManifest, OciLayout, Platform};

/// Write a busybox-like multi-arch source layout under `dir` and return its
/// path. Shaped like skopeo's output: `index.json` points at one image index
/// that lists the per-arch manifests (plus a `386` entry that must be
/// ignored).
///
/// Each layer holds `bin/busybox` (content `busybox-<arch>`), hard links
/// `bin/sh` and `bin/ls` to it, `etc/passwd` and an `etc/mtab` symlink.
pub(crate) fn fake_busybox_source(dir: &Path, arches: &[Arch]) -> PathBuf {
    let root = dir.join("busybox");
    let layout = OciLayout::create(&root).unwrap();

    let mut platforms: Vec<String> = arches.iter().map(|a| a.oci_name().to_string()).collect();
    platforms.push("386".to_string());

    let mut manifests = Vec::new();
    for arch in &platforms {
        let tar = busybox_tar(arch);
        let diff_id = Digest::of_bytes(&tar);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar).unwrap();
        let layer = layout
            .put_blob(MEDIA_TYPE_OCI_LAYER_GZIP, &gz.finish().unwrap())
            .unwrap();

        let config = layout
            .put_json(
                MEDIA_TYPE_OCI_CONFIG,
                &ImageConfig {
                    architecture: arch.clone(),
                    os: "linux".into(),
                    config: ContainerConfig::default(),
                    rootfs: RootFs {
                        fs_type: "layers".into(),
                        diff_ids: vec![diff_id],
                    },
                },
            )
            .unwrap();

        let mut manifest = layout
            .put_json(
                MEDIA_TYPE_OCI_MANIFEST,
                &ImageManifest {
                    schema_version: 2,
                    media_type: MEDIA_TYPE_OCI_MANIFEST.into(),
                    config,
                    layers: vec![layer],
                    annotations: Default::default(),
                },
            )
            .unwrap();
        manifest.platform = Some(Platform {
            architecture: arch.clone(),
            os: "linux".into(),
            variant: None,
        });
        manifests.push(manifest);
    }

    let list = layout
        .put_json(MEDIA_TYPE_OCI_INDEX, &ImageIndex::new(manifests))
        .unwrap();
    layout.write_index(&ImageIndex::new(vec![list])).unwrap();
    root
}

fn busybox_tar(arch: &str) -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());

    let mut add = |path: &str, kind: tar::EntryType, mode: u32, data: &[u8], link: Option<&str>| {
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(kind);
        h.set_size(data.len() as u64);
        h.set_mode(mode);
        h.set_mtime(1_700_000_000);
        if let Some(link) = link {
            h.set_link_name(link).unwrap();
        }
        h.set_cksum();
        b.append_data(&mut h, path, data).unwrap();
    };

    let busybox = format!("busybox-{arch}");
    add("bin/", tar::EntryType::Directory, 0o755, b"", None);
    add("bin/busybox", tar::EntryType::Regular, 0o755, busybox.as_bytes(), None);
    add("bin/ls", tar::EntryType::Link, 0o755, b"", Some("bin/busybox"));
    add("bin/sh", tar::EntryType::Link, 0o755, b"", Some("bin/busybox"));
    add("etc/", tar::EntryType::Directory, 0o755, b"", None);
    add("etc/passwd", tar::EntryType::Regular, 0o644, b"root:x:0:0:root:/root:/bin/sh\n", None);
    add("etc/mtab", tar::EntryType::Symlink, 0o777, b"", Some("/proc/mounts"));

    b.into_inner().unwrap()
}
