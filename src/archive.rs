//! Image-archive to registry-layout transformer.
//!
//! Consumes a tar stream as produced by `docker save` and emits a directory
//! in the layout the registry publishes to the store:
//!
//! ```text
//! <name>/
//!   manifests/<tag>         V2 manifest JSON (mirrored to `latest` and to
//!                           its own sha256 digest)
//!   blobs/sha256:<hex>      image config and gzip-compressed layers
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::EntryType;
use tempfile::TempDir;

use crate::error::{RegistryError, Result};
use crate::image::{
    Descriptor, ImageManifest, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
    MANIFEST_SCHEMA_VERSION,
};
use crate::util::sha256_hex;

/// One entry of the archive's `manifest.json`.
#[derive(Debug, serde::Deserialize)]
struct ArchiveEntry {
    #[serde(rename = "Config")]
    config: Option<String>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// A registry-compatible directory tree rooted in a temporary directory.
///
/// The backing directory is removed when the value is dropped, so callers
/// must keep it alive until the tree has been published.
#[derive(Debug)]
pub struct ImageLayout {
    root: TempDir,
    name: String,
}

impl ImageLayout {
    /// The layout root: the directory containing the single `<name>/`
    /// subdirectory.
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// The repository name taken from the archive's `repositories` file, or
    /// `"default"` when absent.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Transform an image archive into a registry-compatible layout.
///
/// `image_id` is the human identifier the image was saved under; only its
/// tag suffix influences the output (the manifest file name).
pub fn transform(reader: impl Read, image_id: &str) -> Result<ImageLayout> {
    let unpack = TempDir::new()?;
    untar(reader, unpack.path())?;
    tracing::debug!(dir = %unpack.path().display(), "unpacked image archive");

    let name = archive_name(unpack.path())?;

    let layout = TempDir::new()?;
    let workdir = layout.path().join(&name);
    let manifest_dir = workdir.join("manifests");
    let blob_dir = workdir.join("blobs");
    fs::create_dir_all(&manifest_dir)?;
    fs::create_dir_all(&blob_dir)?;

    let entries: Vec<ArchiveEntry> = serde_json::from_slice(&fs::read(
        unpack.path().join("manifest.json"),
    )?)?;
    let Some(entry) = entries.first() else {
        return Err(RegistryError::InvalidArchive(
            "expected manifest to contain data".into(),
        ));
    };

    let config_file = match &entry.config {
        Some(name) if name.ends_with(".json") => name,
        _ => {
            return Err(RegistryError::InvalidArchive(
                "image archive must be produced by a modern daemon".into(),
            ))
        }
    };
    let config_digest = format!("sha256:{}", &config_file[..config_file.len() - 5]);
    let config_dest = blob_dir.join(&config_digest);
    fs::copy(unpack.path().join(config_file), &config_dest)?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer in &entry.layers {
        let (size, digest) = compress_layer(&unpack.path().join(layer), &blob_dir)?;
        layers.push(Descriptor {
            media_type: LAYER_MEDIA_TYPE.into(),
            size,
            digest: format!("sha256:{digest}"),
        });
    }

    let manifest = ImageManifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        media_type: MANIFEST_MEDIA_TYPE.into(),
        config: Descriptor {
            media_type: CONFIG_MEDIA_TYPE.into(),
            size: fs::metadata(&config_dest)?.len(),
            digest: config_digest,
        },
        layers,
    };
    let data = serde_json::to_vec(&manifest)?;

    let tag = ref_tag(image_id);
    fs::write(manifest_dir.join(tag), &data)?;
    if tag != "latest" {
        fs::write(manifest_dir.join("latest"), &data)?;
    }
    fs::write(manifest_dir.join(sha256_hex(&data)), &data)?;

    Ok(ImageLayout { root: layout, name })
}

/// Unpack a tar stream into `dst`. Only directories and regular files are
/// materialized; symlinks and device nodes are ignored.
fn untar(reader: impl Read, dst: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        match entry.header().entry_type() {
            EntryType::Directory | EntryType::Regular => {
                entry.unpack_in(dst)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Derive the output directory name from the archive's `repositories` file.
///
/// The archive must describe exactly one repository with exactly one tag;
/// multi-tag saves are rejected. Archives without a `repositories` file get
/// the name `"default"`.
fn archive_name(unpack: &Path) -> Result<String> {
    let path = unpack.join("repositories");
    if !path.exists() {
        return Ok("default".into());
    }

    let repos: HashMap<String, HashMap<String, String>> =
        serde_json::from_slice(&fs::read(path)?)?;
    let mut repos = repos.into_iter();
    let (name, tags) = match (repos.next(), repos.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(RegistryError::InvalidArchive(
                "only one repository expected in input file".into(),
            ))
        }
    };
    if tags.len() != 1 {
        return Err(RegistryError::InvalidArchive(format!(
            "only one tag expected for {name}"
        )));
    }
    Ok(normalize_image_name(&name).to_owned())
}

fn normalize_image_name(name: &str) -> &str {
    name
}

/// Pick the manifest tag for an image identifier: digests map to `latest`,
/// `name:tag` keeps the tag, anything else defaults to `latest`.
fn ref_tag(image_id: &str) -> &str {
    if image_id.contains("sha256:") {
        return "latest";
    }
    match image_id.split_once(':') {
        Some((_, tag)) => tag,
        None => "latest",
    }
}

/// Gzip the uncompressed layer at `src` into `blob_dir`, returning the size
/// and bare hex sha256 of the compressed bytes. The blob is renamed to its
/// digest once the encoder has been flushed and closed, so size and digest
/// always describe the stored bytes.
fn compress_layer(src: &Path, blob_dir: &Path) -> Result<(u64, String)> {
    let tmp = blob_dir.join("layer.tmp.tgz");
    tracing::debug!(layer = %src.display(), "compressing layer");

    let mut input = File::open(src)?;
    let mut encoder = GzEncoder::new(File::create(&tmp)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    let digest = sha256_file(&tmp)?;
    let size = fs::metadata(&tmp)?.len();
    fs::rename(&tmp, blob_dir.join(format!("sha256:{digest}")))?;

    Ok((size, digest))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut context = Sha256::new();
    io::copy(&mut file, &mut context)?;
    Ok(hex::encode(context.finalize()))
}
