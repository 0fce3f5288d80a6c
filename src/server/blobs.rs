//! Blob endpoints: `/v2/<name>/blobs/…`.
//!
//! Uploads follow the V2 session state machine: POST opens a session keyed
//! by a random UUID, PATCH appends bytes to the session buffer, PUT verifies
//! the client-supplied digest against the accumulated bytes and moves them
//! into the repo's in-flight blob table, where a later manifest PUT picks
//! them up. Reads resolve the repo to a CID and proxy the gateway.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use uuid::Uuid;

use crate::util::sha256_hex;

use super::error::RegError;
use super::{lock, path_elements, query_param, Registry};

/// In-flight upload and blob state, keyed per repo.
#[derive(Debug, Default)]
pub(crate) struct BlobState {
    /// repo → digest → blob bytes, pending a manifest PUT.
    contents: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    /// upload UUID → accumulated bytes.
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    /// repo → digests known to belong to it.
    layers: Mutex<HashMap<String, Vec<String>>>,
}

impl BlobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The repo's buffered layers by digest, or `None` when nothing has been
    /// uploaded for it.
    pub fn layers_for(&self, repo: &str) -> Option<HashMap<String, Vec<u8>>> {
        let layers = lock(&self.layers);
        let digests = layers.get(repo)?;
        let contents = lock(&self.contents);
        let blobs = contents.get(repo)?;
        Some(
            digests
                .iter()
                .filter_map(|d| blobs.get(d).map(|b| (d.clone(), b.clone())))
                .collect(),
        )
    }

    /// Drop the repo's buffered layers after manifest publication.
    pub fn remove(&self, repo: &str) {
        lock(&self.layers).remove(repo);
        lock(&self.contents).remove(repo);
    }
}

/// Whether the path addresses the blob endpoints.
pub(crate) fn is_blob(path: &str) -> bool {
    let elem = path_elements(path);
    if elem.len() < 4 {
        return false;
    }
    elem[elem.len() - 2] == "blobs"
        || (elem[elem.len() - 3] == "blobs" && elem[elem.len() - 2] == "uploads")
}

pub(crate) async fn handle(registry: &Registry, req: Request) -> Result<Response, RegError> {
    let path = req.uri().path().to_owned();
    let elem: Vec<String> = path_elements(&path)
        .into_iter()
        .map(str::to_owned)
        .collect();
    let target = elem[elem.len() - 1].clone();
    let service = elem[elem.len() - 2].clone();
    let digest = query_param(&req, "digest");
    let method = req.method().clone();

    if method == Method::POST && target == "uploads" {
        let repo = elem[1..elem.len() - 2].join("/");
        let uuid = Uuid::new_v4().to_string();
        lock(&registry.blobs.uploads).insert(uuid.clone(), Vec::new());

        return response(StatusCode::ACCEPTED)
            .header("Location", format!("/v2/{repo}/blobs/uploads/{uuid}"))
            .header("Range", "0-0")
            .header("Docker-Upload-UUID", uuid)
            .body(Body::empty())
            .map_err(RegError::internal);
    }

    if method == Method::PATCH && service == "uploads" {
        let repo = elem[1..elem.len() - 3].join("/");
        let body = read_body(req).await?;
        let len = {
            let mut uploads = lock(&registry.blobs.uploads);
            let Some(buffer) = uploads.get_mut(&target) else {
                return Err(RegError::new(
                    StatusCode::NOT_FOUND,
                    "BLOB_UPLOAD_UNKNOWN",
                    "Upload not found",
                ));
            };
            buffer.extend_from_slice(&body);
            buffer.len()
        };

        return response(StatusCode::NO_CONTENT)
            .header("Location", format!("/v2/{repo}/blobs/uploads/{target}"))
            .header("Range", format!("0-{}", len.saturating_sub(1)))
            .header("Docker-Upload-UUID", target)
            .body(Body::empty())
            .map_err(RegError::internal);
    }

    if method == Method::PUT && service == "uploads" {
        let repo = elem[1..elem.len() - 3].join("/");
        let buffer = {
            let uploads = lock(&registry.blobs.uploads);
            let Some(buffer) = uploads.get(&target) else {
                return Err(RegError::new(
                    StatusCode::NOT_FOUND,
                    "BLOB_UPLOAD_UNKNOWN",
                    "Upload not found",
                ));
            };
            buffer.clone()
        };

        if sha256_hex(&buffer) != digest {
            return Err(RegError::new(
                StatusCode::BAD_REQUEST,
                "BLOB_UPLOAD_INVALID",
                "digest does not match contents",
            ));
        }

        {
            let mut contents = lock(&registry.blobs.contents);
            contents
                .entry(repo.clone())
                .or_default()
                .insert(digest.clone(), buffer);
            let mut layers = lock(&registry.blobs.layers);
            let digests = layers.entry(repo.clone()).or_default();
            if !digests.contains(&digest) {
                digests.push(digest.clone());
            }
            lock(&registry.blobs.uploads).remove(&target);
        }

        return response(StatusCode::CREATED)
            .header("Docker-Content-Digest", digest.clone())
            .header("Location", format!("/v2/{repo}/blobs/{digest}"))
            .body(Body::empty())
            .map_err(RegError::internal);
    }

    if method == Method::HEAD && service == "blobs" {
        let repo = elem[1..elem.len() - 2].join("/");
        let resp = fetch_blob(registry, &repo, &target, Method::HEAD).await?;
        let length = resp.content_length();

        let mut builder = response(StatusCode::OK).header("Docker-Content-Digest", target);
        if let Some(length) = length {
            builder = builder.header("Content-Length", length);
        }
        return builder.body(Body::empty()).map_err(RegError::internal);
    }

    if method == Method::GET && service == "blobs" {
        let repo = elem[1..elem.len() - 2].join("/");
        let resp = fetch_blob(registry, &repo, &target, Method::GET).await?;
        let length = resp.content_length();

        let mut builder = response(StatusCode::OK).header("Docker-Content-Digest", target);
        if let Some(length) = length {
            builder = builder.header("Content-Length", length);
        }
        return builder
            .body(Body::from_stream(resp.bytes_stream()))
            .map_err(RegError::internal);
    }

    if method == Method::DELETE && service == "uploads" {
        return Err(RegError::new(
            StatusCode::NOT_FOUND,
            "BLOB_UPLOAD_UNKNOWN",
            "Upload not found",
        ));
    }

    Err(RegError::new(
        StatusCode::BAD_REQUEST,
        "METHOD_UNKNOWN",
        "We don't understand your method + url",
    ))
}

/// Resolve `(repo, digest)` to a CID and fetch the blob from the gateway.
async fn fetch_blob(
    registry: &Registry,
    repo: &str,
    digest: &str,
    method: Method,
) -> Result<reqwest::Response, RegError> {
    let Some(cid) = registry.resolve_cid(repo, digest).await else {
        return Err(RegError::new(
            StatusCode::NOT_FOUND,
            "BLOB_UNKNOWN",
            format!("cannot resolve CID: {repo}:{digest}"),
        ));
    };

    let url = registry.ipfs_url(&[&cid, "blobs", digest]);
    let request = if method == Method::HEAD {
        registry.http.head(&url)
    } else {
        registry.http.get(&url)
    };
    let resp = request.send().await.map_err(RegError::internal)?;
    if !resp.status().is_success() {
        return Err(RegError::new(
            StatusCode::NOT_FOUND,
            "BLOB_UNKNOWN",
            format!("cid: {cid} {}", resp.status()),
        ));
    }
    Ok(resp)
}

async fn read_body(req: Request) -> Result<bytes::Bytes, RegError> {
    axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(RegError::internal)
}

fn response(status: StatusCode) -> axum::http::response::Builder {
    Response::builder().status(status)
}
