//! High-level registry operations used by the CLI.
//!
//! Pushing consumes an image archive (the tar stream a container daemon
//! exports), transforms it into the registry layout and publishes the
//! directory to the store. Pulling is left to the daemon itself: this
//! module only produces the registry-qualified reference to pull.

use std::io::Read;
use std::time::Duration;

use crate::archive;
use crate::cid;
use crate::error::{RegistryError, Result};
use crate::ipfs::IpfsClient;

/// Transform an image archive into the registry layout and publish it,
/// returning the CID that names the image directory.
///
/// `image_id` is the identifier the image was saved under; its tag suffix
/// picks the manifest name (`latest` when absent).
pub async fn push_archive(
    ipfs: &IpfsClient,
    reader: impl Read,
    image_id: &str,
) -> Result<String> {
    let layout = archive::transform(reader, image_id)?;
    tracing::debug!(root = %layout.path().display(), name = layout.name(), "prepared image");

    // the layout directory must outlive the upload
    let image_cid = ipfs.add_dir(layout.path()).await?;
    tracing::debug!(cid = %image_cid, "uploaded to /ipfs");
    Ok(image_cid)
}

/// The registry-qualified reference a daemon can pull. CID-shaped images
/// are normalized to their DNS-safe base32 form; plain repository names
/// pass through for the server's resolver chain to map.
pub fn pull_reference(registry_host: &str, image: &str) -> String {
    let normalized = cid::to_b32(image);
    if normalized.is_empty() {
        format!("{registry_host}/{image}")
    } else {
        format!("{registry_host}/{normalized}")
    }
}

/// Interrogate a running registry server's `/dig` endpoint and return the
/// response body.
pub async fn dig(registry_host: &str, name: &str, short: bool) -> Result<String> {
    let uri = format!("http://{registry_host}/dig?q={name}&short={short}");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let resp = client.get(&uri).send().await?;
    if !resp.status().is_success() {
        return Err(RegistryError::Api(resp.status().to_string()));
    }
    Ok(resp.text().await?)
}
