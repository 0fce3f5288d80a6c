//! Docker V2 image manifest data model.
//!
//! The subset of the distribution manifest schema the registry produces and
//! serves: a config descriptor plus an ordered list of layer descriptors.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Schema version of every manifest this registry produces.
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

/// Media type of a V2 image manifest.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Media type of a Docker manifest list (fat manifest).
pub const MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Media type of an OCI image index.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Media type of an image configuration blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Media type of a gzip-compressed layer blob.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// A content descriptor: media type, size in bytes and `sha256:<hex>` digest
/// of the referenced blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// A V2 image manifest: one config descriptor plus ordered layer
/// descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Decode a manifest from its JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// All blob digests referenced by this manifest, config first.
    pub fn digests(&self) -> Vec<&str> {
        let mut digests = vec![self.config.digest.as_str()];
        digests.extend(self.layers.iter().map(|l| l.digest.as_str()));
        digests
    }
}

/// The subset of a manifest list / OCI image index needed to validate that
/// its constituent manifests are present before accepting it.
#[derive(Debug, Deserialize)]
pub struct ManifestIndex {
    pub manifests: Vec<Descriptor>,
}

impl ManifestIndex {
    /// Decode an index from its JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Whether a `Content-Type` value names a manifest list or image index.
pub fn is_index_media_type(content_type: &str) -> bool {
    content_type == MANIFEST_LIST_MEDIA_TYPE || content_type == OCI_INDEX_MEDIA_TYPE
}
