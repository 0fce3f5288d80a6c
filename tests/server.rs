//! End-to-end protocol tests over the registry router.
//!
//! The router is exercised in-process via `tower::ServiceExt::oneshot`;
//! where a test needs the store or gateway, a local axum app stands in for
//! both (`/api/v0/add` and `/ipfs/…` under one listener).

use std::fs;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{Response, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use http_body_util::BodyExt;
use similar_asserts::assert_eq;
use tower::ServiceExt;

use ipdr::util::sha256_hex;
use ipdr::{Registry, ServerConfig};

const CID_V1: &str = "bafybeifqi3ldg5yclcz33zahr37aieo4epzbhhjxjpwoqyau2mzdxakqhq";
const HELLO_DIGEST: &str =
    "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn manifest_json(layer_digest: &str) -> String {
    format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{{"mediaType":"application/vnd.docker.container.image.v1+json","size":2,"digest":"sha256:cfg"}},"layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","size":5,"digest":"{layer_digest}"}}]}}"#
    )
}

async fn registry_router(config: ServerConfig) -> Router {
    let registry = Registry::new(&config).await.unwrap();
    ipdr::server::router(Arc::new(registry))
}

fn test_config(dir: &Path) -> ServerConfig {
    ServerConfig {
        cid_store_path: dir.join("cids"),
        ..ServerConfig::default()
    }
}

/// Serve `app` on an ephemeral local port, returning `host:port`.
async fn spawn_backend(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

/// A stand-in for the store: accepts adds with a fixed resulting CID and
/// serves gateway reads of one manifest and one blob.
fn fake_store(published_cid: &str, manifest_body: String, blob_body: &'static str) -> Router {
    let cid = published_cid.to_owned();
    Router::new()
        .route(
            "/api/v0/add",
            post(move |req: Request| {
                let cid = cid.clone();
                async move {
                    // drain the multipart body before answering
                    let _ = axum::body::to_bytes(req.into_body(), usize::MAX).await;
                    format!("{{\"Name\":\"image\",\"Hash\":\"{cid}\"}}\n")
                }
            }),
        )
        .route(
            "/ipfs/{cid}/manifests/{reference}",
            get(move || async move {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from(manifest_body.clone()))
                    .unwrap()
            }),
        )
        .route(
            "/ipfs/{cid}/blobs/{digest}",
            get(move || async move { blob_body }),
        )
}

async fn send(router: &Router, req: Request) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn request(method: &str, uri: &str, body: &[u8]) -> Request {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

fn error_code(body: &[u8]) -> String {
    let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
    parsed["errors"][0]["code"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn test_api_version_check() {
    let dir = tempfile::tempdir().unwrap();
    let router = registry_router(test_config(dir.path())).await;

    for uri in ["/v2", "/v2/"] {
        let (status, headers, _) = send(&router, request("GET", uri, b"")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("Docker-Distribution-API-Version").unwrap(),
            "registry/2.0"
        );
    }

    let (status, _, body) = send(&router, request("GET", "/v2/unknown", b"")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "METHOD_UNKNOWN");
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let router = registry_router(test_config(dir.path())).await;

    let (status, _, body) = send(&router, request("GET", "/health", b"")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK\n");
}

#[tokio::test]
async fn test_upload_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let router = registry_router(test_config(dir.path())).await;

    let (status, headers, _) =
        send(&router, request("POST", "/v2/foo/blobs/uploads/", b"")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers.get("Range").unwrap(), "0-0");
    let uuid = headers
        .get("Docker-Upload-UUID")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    let location = headers.get("Location").unwrap().to_str().unwrap().to_owned();
    assert_eq!(location, format!("/v2/foo/blobs/uploads/{uuid}"));

    let (status, headers, _) = send(&router, request("PATCH", &location, b"hello")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("Range").unwrap(), "0-4");

    let (status, headers, _) = send(
        &router,
        request("PUT", &format!("{location}?digest={HELLO_DIGEST}"), b""),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("Docker-Content-Digest").unwrap(), HELLO_DIGEST);
    assert_eq!(
        headers.get("Location").unwrap(),
        &format!("/v2/foo/blobs/{HELLO_DIGEST}")
    );

    // the session is gone once finalized
    let (status, _, body) = send(&router, request("PATCH", &location, b"more")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_upload_digest_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let router = registry_router(test_config(dir.path())).await;

    let (_, headers, _) = send(&router, request("POST", "/v2/foo/blobs/uploads/", b"")).await;
    let location = headers.get("Location").unwrap().to_str().unwrap().to_owned();
    send(&router, request("PATCH", &location, b"hello")).await;

    let (status, _, body) = send(
        &router,
        request("PUT", &format!("{location}?digest=sha256:beef"), b""),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "BLOB_UPLOAD_INVALID");

    // nothing was promoted into the repo's blob table, so finalizing a
    // manifest still reports the missing layers
    let (status, _, body) = send(
        &router,
        request("PUT", "/v2/foo/manifests/latest", b"{}"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "MANIFEST_BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_unknown_upload_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let router = registry_router(test_config(dir.path())).await;

    let (status, _, body) = send(
        &router,
        request("PATCH", "/v2/foo/blobs/uploads/no-such-session", b"x"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "BLOB_UPLOAD_UNKNOWN");

    let (status, _, body) = send(
        &router,
        request("DELETE", "/v2/foo/blobs/uploads/no-such-session", b""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_push_publish_and_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let backend = spawn_backend(fake_store(
        "bafypushed",
        manifest_json(HELLO_DIGEST),
        "hello",
    ))
    .await;

    let config = ServerConfig {
        ipfs_host: backend.clone(),
        ipfs_gateway: backend,
        ..test_config(dir.path())
    };
    let router = registry_router(config).await;

    // upload the single layer
    let (_, headers, _) = send(&router, request("POST", "/v2/foo/blobs/uploads/", b"")).await;
    let location = headers.get("Location").unwrap().to_str().unwrap().to_owned();
    send(&router, request("PATCH", &location, b"hello")).await;
    let (status, _, _) = send(
        &router,
        request("PUT", &format!("{location}?digest={HELLO_DIGEST}"), b""),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // publish the manifest
    let manifest = manifest_json(HELLO_DIGEST);
    let mut put = request("PUT", "/v2/foo/manifests/1.0", manifest.as_bytes());
    put.headers_mut().insert(
        "Content-Type",
        "application/vnd.docker.distribution.manifest.v2+json"
            .parse()
            .unwrap(),
    );
    let (status, headers, _) = send(&router, put).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("X-Docker-Content-ID").unwrap(), "bafypushed");
    assert_eq!(
        headers.get("Docker-Content-Digest").unwrap(),
        &sha256_hex(manifest.as_bytes())
    );

    // tag, digest and the CID itself all resolve to the published CID
    let digest = sha256_hex(manifest.as_bytes());
    for q in [
        "foo:1.0".to_owned(),
        format!("foo:{digest}"),
        "bafypushed:latest".to_owned(),
    ] {
        let (status, _, body) = send(
            &router,
            request("GET", &format!("/dig?q={q}&short=true"), b""),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "query: {q}");
        assert_eq!(body, b"bafypushed\n", "query: {q}");
    }

    // the tag mapping was persisted for the next process
    let on_disk = fs::read_to_string(dir.path().join("cids/foo/1.0")).unwrap();
    assert_eq!(on_disk, "bafypushed");

    // a second manifest PUT without fresh uploads finds no buffered layers
    let mut put = request("PUT", "/v2/foo/manifests/2.0", manifest.as_bytes());
    put.headers_mut()
        .insert("Content-Type", "application/json".parse().unwrap());
    let (status, _, body) = send(&router, put).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "MANIFEST_BLOB_UNKNOWN");

    // the published manifest serves from the local table
    let (status, headers, body) =
        send(&router, request("GET", "/v2/foo/manifests/1.0", b"")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("X-Docker-Content-ID").unwrap(), "bafypushed");
    assert_eq!(body, manifest.as_bytes());

    // ...and its layer digest now resolves to the same CID for blob reads
    let (status, _, body) = send(
        &router,
        request("GET", &format!("/v2/foo/blobs/{HELLO_DIGEST}"), b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_pull_by_cid_bypasses_resolvers() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest_json("sha256:layerdigest");
    let backend = spawn_backend(fake_store("unused", manifest.clone(), "layer-bytes")).await;

    let config = ServerConfig {
        ipfs_gateway: backend,
        ..test_config(dir.path())
    };
    let router = registry_router(config).await;

    // no resolver backend knows this name; the repo is itself a CID
    let uri = format!("/v2/{CID_V1}/manifests/latest");
    let (status, headers, body) = send(&router, request("GET", &uri, b"")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("X-Docker-Content-ID").unwrap(), CID_V1);
    assert_eq!(
        headers.get("Docker-Content-Digest").unwrap(),
        &sha256_hex(manifest.as_bytes())
    );
    assert_eq!(body, manifest.as_bytes());

    // the manifest's descriptors were registered against the same CID
    let (status, _, body) = send(
        &router,
        request("GET", &format!("/v2/{CID_V1}/blobs/sha256:layerdigest"), b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"layer-bytes");
}

#[tokio::test]
async fn test_unknown_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let router = registry_router(test_config(dir.path())).await;

    let (status, _, body) = send(
        &router,
        request("GET", "/v2/library/alpine/manifests/latest", b""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_dig_resolver_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    for (root, reference, cid) in [
        (&first, "latest", "CID_A"),
        (&second, "latest", "CID_B"),
        (&second, "v1", "CID_C"),
    ] {
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("lib").join(reference), cid).unwrap();
    }

    let config = ServerConfig {
        cid_resolvers: vec![
            format!("file:{}", first.display()),
            format!("file:{}", second.display()),
        ],
        ..test_config(dir.path())
    };
    let router = registry_router(config).await;

    // scoped: the first backend wins
    let (status, headers, body) = send(
        &router,
        request("GET", "/dig?q=lib:latest&short=true", b""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("X-Docker-Content-ID").unwrap(), "CID_A");
    assert_eq!(body, b"CID_A\n");

    // unscoped: the union of every backend's refs, deduplicated and sorted
    let (status, _, body) = send(&router, request("GET", "/dig?q=lib", b"")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"latest\nv1\n");

    let (status, _, _) = send(&router, request("GET", "/dig?q=unknown", b"")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&router, request("GET", "/dig", b"")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
