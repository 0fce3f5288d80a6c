//! The registry HTTP front end.
//!
//! A single [`Registry`] value owns all shared state — manifest table, blob
//! tables, CID store and resolver chain — and is passed by `Arc` into
//! stateless handler functions. The [`Server`] wraps a router around it with
//! explicit start/stop and optional TLS.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;

use crate::cid;
use crate::cids::CidStore;
use crate::error::{RegistryError, Result};
use crate::ipfs::{IpfsClient, IpfsConfig};
use crate::resolver::ResolverChain;

mod blobs;
mod error;
mod manifests;

use blobs::BlobState;
use error::RegError;
use manifests::ManifestState;

/// Config for the registry server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the store's API endpoint.
    pub ipfs_host: String,
    /// URL base for gateway read fetches.
    pub ipfs_gateway: String,
    /// Ordered resolver backend URIs (`file:<path>`, `/ipfs/<cid>`, or a
    /// dnslink domain).
    pub cid_resolvers: Vec<String>,
    /// On-disk root of the persistent CID memo.
    pub cid_store_path: PathBuf,
    /// Listener port.
    pub port: u16,
    /// TLS is enabled when both paths are set.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Enable verbose logging.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ipfs_host: String::new(),
            ipfs_gateway: String::new(),
            cid_resolvers: Vec::new(),
            cid_store_path: default_cid_store_path(),
            port: 5000,
            tls_cert_path: None,
            tls_key_path: None,
            debug: false,
        }
    }
}

/// The default on-disk CID memo location, `<home>/.ipdr/cids`.
pub fn default_cid_store_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".ipdr/cids"),
        None => PathBuf::from(".ipdr/cids"),
    }
}

/// The registry: every piece of shared state the protocol handlers need.
#[derive(Debug)]
pub struct Registry {
    pub(crate) blobs: BlobState,
    pub(crate) manifests: ManifestState,
    pub(crate) cids: CidStore,
    resolver: ResolverChain,
    pub(crate) ipfs: Arc<IpfsClient>,
    /// Outbound client for gateway fetches, with a bounded timeout.
    pub(crate) http: reqwest::Client,
    debug: bool,
}

impl Registry {
    /// Build the registry's state from its config. Resolver backends that
    /// cannot be constructed are skipped.
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let ipfs = Arc::new(IpfsClient::new(&IpfsConfig {
            host: config.ipfs_host.clone(),
            gateway_url: config.ipfs_gateway.clone(),
        })?);
        let resolver = ResolverChain::new(&ipfs, &config.cid_resolvers).await;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            blobs: BlobState::new(),
            manifests: ManifestState::new(),
            cids: CidStore::new(&config.cid_store_path),
            resolver,
            ipfs,
            http,
            debug: config.debug,
        })
    }

    pub(crate) fn ipfs_url(&self, parts: &[&str]) -> String {
        cid::ipfs_url(self.ipfs.gateway_url(), parts)
    }

    /// Resolve a repository and reference to candidate CIDs:
    /// the CID store first, then the repo itself when it parses as a CID in
    /// either encoding (the reference is ignored in that case), then the
    /// resolver chain.
    pub async fn resolve(&self, repo: &str, reference: &str) -> Vec<String> {
        if let Some(cached) = self.cids.get(repo, reference) {
            return vec![cached];
        }

        let parsed = cid::to_b32(repo);
        if !parsed.is_empty() {
            return vec![parsed];
        }
        let b58 = cid::ipfsify(repo);
        if !b58.is_empty() {
            let parsed = cid::to_b32(&b58);
            if !parsed.is_empty() {
                return vec![parsed];
            }
        }

        self.resolver.resolve(repo, reference).await
    }

    /// The unified scoped lookup used by every handler. An empty reference
    /// means `latest`.
    pub(crate) async fn resolve_cid(&self, repo: &str, reference: &str) -> Option<String> {
        let reference = if reference.is_empty() {
            "latest"
        } else {
            reference
        };
        self.resolve(repo, reference).await.into_iter().next()
    }
}

/// Build the registry router. Registered at the site root: `/v2` dispatch,
/// `/health` and `/dig`.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/dig", get(dig))
        .route("/dig/", get(dig))
        .fallback(root)
        .with_state(registry)
}

async fn root(State(registry): State<Arc<Registry>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let result = if blobs::is_blob(&path) {
        blobs::handle(&registry, req).await
    } else if manifests::is_manifest(&path) {
        manifests::handle(&registry, req).await
    } else {
        Ok(version_check(&path))
    };

    match result {
        Ok(resp) => {
            if registry.debug {
                tracing::debug!(%method, %path, status = %resp.status());
            }
            resp
        }
        Err(err) => {
            tracing::debug!(%method, %path, status = %err.status, code = err.code, message = %err.message);
            err.into_response()
        }
    }
}

/// The `/v2/` API presence probe. Anything else under the site root that is
/// neither a blob nor a manifest path is unknown. The API version header is
/// set either way.
fn version_check(path: &str) -> Response {
    let mut resp = if path == "/v2" || path == "/v2/" {
        StatusCode::OK.into_response()
    } else {
        RegError::new(
            StatusCode::NOT_FOUND,
            "METHOD_UNKNOWN",
            "We don't understand your method + url",
        )
        .into_response()
    };
    resp.headers_mut().insert(
        "Docker-Distribution-API-Version",
        HeaderValue::from_static("registry/2.0"),
    );
    resp
}

async fn health() -> &'static str {
    "OK\n"
}

#[derive(Debug, serde::Deserialize)]
struct DigQuery {
    #[serde(default)]
    q: String,
    #[serde(default)]
    short: String,
}

/// Diagnostic lookup: `/dig?q=<name[:tag]>&short=<bool>`. With a tag, prints
/// the CID (short) or the manifest body; without one, lists every known ref.
async fn dig(State(registry): State<Arc<Registry>>, Query(query): Query<DigQuery>) -> Response {
    let short = parse_bool(&query.short);
    let (name, tag) = match query.q.split_once(':') {
        Some((name, tag)) => (name, tag),
        None => (query.q.as_str(), ""),
    };
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Required parameter 'q' missing. /dig?q=name:tag&short=true\n",
        )
            .into_response();
    }

    let list = registry.resolve(name, tag).await;
    if list.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    if !tag.is_empty() {
        let cid = list[0].clone();
        let body = if short {
            format!("{cid}\n")
        } else {
            match manifests::fetch_manifest(&registry, &cid, tag).await {
                Ok(entry) => {
                    let mut body = String::from_utf8_lossy(&entry.blob).into_owned();
                    body.push('\n');
                    body
                }
                Err(_) => String::new(),
            }
        };
        return (StatusCode::OK, [("X-Docker-Content-ID", cid)], body).into_response();
    }

    let mut body = list.join("\n");
    body.push('\n');
    (StatusCode::OK, body).into_response()
}

fn parse_bool(s: &str) -> bool {
    matches!(s, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

/// The registry server: a router over a fresh [`Registry`], served with or
/// without TLS depending on the configured key material.
pub struct Server {
    config: ServerConfig,
    handle: Handle,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handle: Handle::new(),
        }
    }

    /// Bind and serve until [`stop`](Self::stop) is called. Fails fast when
    /// the store is not reachable at the configured address.
    pub async fn start(&self) -> Result<()> {
        let registry = Registry::new(&self.config).await?;
        let version = registry.ipfs.version().await.map_err(|err| {
            RegistryError::Api(format!(
                "IPFS API is not reachable (is the daemon running?): {err}"
            ))
        })?;
        tracing::debug!(%version, "connected to IPFS");

        let app = router(Arc::new(registry));
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));

        match (&self.config.tls_cert_path, &self.config.tls_key_path) {
            (Some(cert), Some(key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key).await?;
                tracing::info!(%addr, "registry listening (TLS)");
                axum_server::bind_rustls(addr, tls)
                    .handle(self.handle.clone())
                    .serve(app.into_make_service())
                    .await?;
            }
            _ => {
                tracing::info!(%addr, "registry listening");
                axum_server::bind(addr)
                    .handle(self.handle.clone())
                    .serve(app.into_make_service())
                    .await?;
            }
        }
        Ok(())
    }

    /// Stop the server, draining in-flight connections briefly.
    pub fn stop(&self) {
        self.handle.graceful_shutdown(Some(Duration::from_secs(10)));
    }
}

/// Split a request path into its non-empty-prefix elements, dropping one
/// trailing empty element so `/v2/x/blobs/uploads/` and
/// `/v2/x/blobs/uploads` parse identically.
pub(crate) fn path_elements(path: &str) -> Vec<&str> {
    let mut elem: Vec<&str> = path.split('/').skip(1).collect();
    if elem.last() == Some(&"") {
        elem.pop();
    }
    elem
}

/// First value of a query parameter, URL-decoded.
pub(crate) fn query_param(req: &Request, name: &str) -> String {
    let Some(query) = req.uri().query() else {
        return String::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

/// Lock a mutex, recovering the inner state from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    const B58: &str = "QmaCm7VNsmM61FApFevTcJ1PxPabmfY4Tf2dFjpAdVdHLF";
    const B32_V1: &str = "bafybeifqi3ldg5yclcz33zahr37aieo4epzbhhjxjpwoqyau2mzdxakqhq";

    fn test_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            cid_store_path: dir.join("cids"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_path_elements() {
        assert_eq!(path_elements("/v2/foo/blobs/uploads/"), vec!["v2", "foo", "blobs", "uploads"]);
        assert_eq!(path_elements("/v2/foo/blobs/uploads/abc"), vec!["v2", "foo", "blobs", "uploads", "abc"]);
        assert_eq!(path_elements("/v2"), vec!["v2"]);
    }

    #[test]
    fn test_is_blob() {
        assert!(blobs::is_blob("/v2/foo/blobs/sha256:abc"));
        assert!(blobs::is_blob("/v2/foo/blobs/uploads/"));
        assert!(blobs::is_blob("/v2/lib/foo/blobs/uploads/some-uuid"));
        assert!(!blobs::is_blob("/v2/foo/manifests/latest"));
        assert!(!blobs::is_blob("/v2/"));
    }

    #[test]
    fn test_is_manifest() {
        assert!(manifests::is_manifest("/v2/foo/manifests/latest"));
        assert!(manifests::is_manifest("/v2/lib/foo/manifests/sha256:abc"));
        assert!(!manifests::is_manifest("/v2/foo/blobs/sha256:abc"));
        assert!(!manifests::is_manifest("/v2/"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_cid_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(&test_config(dir.path())).await.unwrap();
        registry.cids.add("repo", "latest", "bafystored");

        assert_eq!(registry.resolve("repo", "latest").await, vec!["bafystored"]);
    }

    #[tokio::test]
    async fn test_resolve_cid_shaped_repo_bypasses_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(&test_config(dir.path())).await.unwrap();

        // base58, CIDv1 base32 and dockerized base32 forms all normalize to
        // the canonical CIDv1 string, whatever the reference says
        assert_eq!(registry.resolve(B58, "latest").await, vec![B32_V1]);
        assert_eq!(registry.resolve(B32_V1, "ignored").await, vec![B32_V1]);
        let dockerized = crate::cid::dockerize(B58);
        assert_eq!(registry.resolve(&dockerized, "latest").await, vec![B32_V1]);
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(&test_config(dir.path())).await.unwrap();
        assert!(registry.resolve("library/alpine", "latest").await.is_empty());
        assert!(registry.resolve_cid("library/alpine", "").await.is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("yes"));
    }
}
