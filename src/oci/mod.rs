//! OCI image-layout plumbing: digests, JSON objects and the on-disk store.

pub mod digest;
pub mod layout;
pub mod types;

pub use digest::Digest;
pub use layout::OciLayout;
pub use types::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform};
