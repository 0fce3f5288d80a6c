//! Manifest endpoints: `/v2/<name>/manifests/<ref>`.
//!
//! GET and HEAD serve from the in-memory table, falling back to a gateway
//! fetch keyed by the resolved CID. A successful GET also records every
//! descriptor digest of the manifest against that CID, so the daemon's
//! subsequent blob requests resolve identically. PUT finalizes a push:
//! the manifest plus the repo's buffered layers are published to the store
//! as an `image/{manifests,blobs}` directory and the resulting CID is
//! recorded under the tag, the digest and the CID itself.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;

use crate::error::{RegistryError, Result};
use crate::image::{is_index_media_type, ImageManifest, ManifestIndex};
use crate::util::sha256_hex;

use super::error::RegError;
use super::{lock, path_elements, Registry};

/// A manifest as stored and served: raw bytes plus the content type they
/// were pushed or fetched with.
#[derive(Debug, Clone)]
pub(crate) struct ManifestEntry {
    pub content_type: String,
    pub blob: Vec<u8>,
}

/// Locally-known manifests: repo → tag-or-digest → manifest.
#[derive(Debug, Default)]
pub(crate) struct ManifestState {
    manifests: Mutex<HashMap<String, HashMap<String, ManifestEntry>>>,
}

impl ManifestState {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, repo: &str, target: &str) -> Option<ManifestEntry> {
        lock(&self.manifests)
            .get(repo)
            .and_then(|m| m.get(target))
            .cloned()
    }

    fn insert(&self, repo: &str, target: &str, entry: ManifestEntry) {
        lock(&self.manifests)
            .entry(repo.to_owned())
            .or_default()
            .insert(target.to_owned(), entry);
    }

    fn contains(&self, repo: &str, target: &str) -> bool {
        lock(&self.manifests)
            .get(repo)
            .is_some_and(|m| m.contains_key(target))
    }
}

/// Whether the path addresses the manifest endpoints.
pub(crate) fn is_manifest(path: &str) -> bool {
    let elem = path_elements(path);
    elem.len() >= 4 && elem[elem.len() - 2] == "manifests"
}

pub(crate) async fn handle(registry: &Registry, req: Request) -> Result<Response, RegError> {
    let path = req.uri().path().to_owned();
    let elem: Vec<String> = path_elements(&path)
        .into_iter()
        .map(str::to_owned)
        .collect();
    let target = elem[elem.len() - 1].clone();
    let repo = elem[1..elem.len() - 2].join("/");
    let method = req.method().clone();

    if method == Method::GET {
        let entry = cached_or_fetched(registry, &repo, &target).await?;

        // Prepare the reverse lookup by digest for pulling blobs.
        let Some(cid) = registry.resolve_cid(&repo, &target).await else {
            return Err(RegError::new(
                StatusCode::NOT_FOUND,
                "MANIFEST_UNKNOWN",
                format!("cannot resolve CID: {repo}:{target}"),
            ));
        };
        if let Ok(manifest) = ImageManifest::decode(&entry.blob) {
            for digest in manifest.digests() {
                registry.cids.add(&repo, digest, &cid);
            }
        }

        return Response::builder()
            .status(StatusCode::OK)
            .header("Docker-Content-Digest", sha256_hex(&entry.blob))
            .header("X-Docker-Content-ID", cid)
            .header(header::CONTENT_TYPE, entry.content_type)
            .header(header::CONTENT_LENGTH, entry.blob.len())
            .body(Body::from(entry.blob))
            .map_err(RegError::internal);
    }

    if method == Method::HEAD {
        let entry = cached_or_fetched(registry, &repo, &target).await?;

        return Response::builder()
            .status(StatusCode::OK)
            .header("Docker-Content-Digest", sha256_hex(&entry.blob))
            .header(header::CONTENT_TYPE, entry.content_type)
            .header(header::CONTENT_LENGTH, entry.blob.len())
            .body(Body::empty())
            .map_err(RegError::internal);
    }

    if method == Method::PUT {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let blob = axum::body::to_bytes(req.into_body(), usize::MAX)
            .await
            .map_err(RegError::internal)?
            .to_vec();
        let digest = sha256_hex(&blob);
        let entry = ManifestEntry {
            content_type: content_type.clone(),
            blob: blob.clone(),
        };

        // A manifest list's constituent manifests must already be uploaded.
        // An accepted list is stored but nothing is published for it.
        if is_index_media_type(&content_type) {
            let index = ManifestIndex::decode(&blob).map_err(|err| {
                RegError::new(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", err.to_string())
            })?;
            for desc in &index.manifests {
                if !registry.manifests.contains(&repo, &desc.digest) {
                    return Err(RegError::new(
                        StatusCode::NOT_FOUND,
                        "MANIFEST_UNKNOWN",
                        format!("Sub-manifest {:?} not found", desc.digest),
                    ));
                }
            }

            registry.manifests.insert(&repo, &target, entry.clone());
            registry.manifests.insert(&repo, &digest, entry);

            return Response::builder()
                .status(StatusCode::CREATED)
                .header("Docker-Content-Digest", digest)
                .header(header::LOCATION, format!("/v2/{repo}/manifests/{target}"))
                .body(Body::empty())
                .map_err(RegError::internal);
        }

        // Allow future references by tag and by immutable digest.
        registry.manifests.insert(&repo, &target, entry.clone());
        registry.manifests.insert(&repo, &digest, entry);

        let Some(layers) = registry.blobs.layers_for(&repo) else {
            return Err(RegError::new(
                StatusCode::NOT_FOUND,
                "MANIFEST_BLOB_UNKNOWN",
                format!("layers for {repo:?} not found"),
            ));
        };

        let mut refs = HashMap::new();
        refs.insert(target.clone(), blob.clone());
        refs.insert(digest.clone(), blob.clone());
        refs.insert("latest".to_owned(), blob);

        let cid = registry
            .ipfs
            .add_image(&refs, &layers)
            .await
            .map_err(RegError::internal)?;

        registry.cids.add(&repo, &target, &cid);
        registry.cids.add(&repo, &digest, &cid);
        registry.cids.add(&cid, "latest", &cid);
        registry.blobs.remove(&repo);
        tracing::debug!(%repo, %target, %cid, "published image");

        return Response::builder()
            .status(StatusCode::CREATED)
            .header("Docker-Content-Digest", digest)
            .header("X-Docker-Content-ID", cid)
            .header(header::LOCATION, format!("/v2/{repo}/manifests/{target}"))
            .body(Body::empty())
            .map_err(RegError::internal);
    }

    Err(RegError::new(
        StatusCode::BAD_REQUEST,
        "METHOD_UNKNOWN",
        "We don't understand your method + url",
    ))
}

/// Serve the manifest from the local table, fetching and caching it from
/// the gateway on a miss.
async fn cached_or_fetched(
    registry: &Registry,
    repo: &str,
    target: &str,
) -> Result<ManifestEntry, RegError> {
    if let Some(entry) = registry.manifests.get(repo, target) {
        return Ok(entry);
    }
    let entry = fetch_manifest(registry, repo, target)
        .await
        .map_err(|err| RegError::new(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", err.to_string()))?;
    registry.manifests.insert(repo, target, entry.clone());
    Ok(entry)
}

/// Fetch `<cid>/manifests/<target>` from the gateway for the resolved CID.
pub(crate) async fn fetch_manifest(
    registry: &Registry,
    repo: &str,
    target: &str,
) -> Result<ManifestEntry> {
    let cid = registry
        .resolve_cid(repo, target)
        .await
        .ok_or_else(|| RegistryError::UnresolvedCid(format!("{repo}:{target}")))?;

    let uri = registry.ipfs_url(&[&cid, "manifests", target]);
    let resp = registry.http.get(&uri).send().await?;
    if !resp.status().is_success() {
        return Err(RegistryError::Gateway {
            cid,
            status: resp.status().to_string(),
        });
    }
    let blob = resp.bytes().await?.to_vec();

    let manifest = ImageManifest::decode(&blob)?;
    Ok(ManifestEntry {
        content_type: manifest.media_type,
        blob,
    })
}
