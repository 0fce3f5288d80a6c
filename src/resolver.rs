//! Resolver backends mapping `repo[:reference]` to CIDs.
//!
//! Three kinds of backend are supported:
//!
//! - `file:<path>` — an on-disk tree `<root>/<repo>/<ref>` whose file
//!   contents are the CID;
//! - `/ipfs/<cid>` — the same tree published in the store, read through
//!   `ls`/`cat`;
//! - a bare domain — a dnslink indirection: the `_dnslink.<domain>` TXT
//!   record names one of the two forms above and is resolved to a delegate
//!   backend at construction time.
//!
//! Backends never fail at resolve time; a backend that cannot satisfy a
//! query returns an empty result.

use std::path::PathBuf;
use std::sync::Arc;

use hickory_resolver::TokioAsyncResolver;

use crate::error::{RegistryError, Result};
use crate::ipfs::IpfsClient;

/// A single resolver backend.
#[derive(Debug)]
pub enum Backend {
    File(FileBackend),
    Ipfs(IpfsBackend),
}

impl Backend {
    /// Construct a backend from its URI. `file:` and `/ipfs/` URIs map
    /// directly; anything else is treated as a dnslink domain whose TXT
    /// record supplies the delegate URI.
    pub async fn from_uri(client: &Arc<IpfsClient>, uri: &str) -> Result<Backend> {
        if let Some(path) = uri.strip_prefix("file:") {
            return Ok(Backend::File(FileBackend::new(path)));
        }
        if uri.starts_with("/ipfs/") {
            return Ok(Backend::Ipfs(IpfsBackend::new(client.clone(), uri)));
        }

        let target = dnslink_lookup(uri).await?;
        if let Some(path) = target.strip_prefix("file:") {
            return Ok(Backend::File(FileBackend::new(path)));
        }
        if target.starts_with("/ipfs/") {
            return Ok(Backend::Ipfs(IpfsBackend::new(client.clone(), &target)));
        }
        Err(RegistryError::UnsupportedResolver(target))
    }

    /// Resolve a repository and reference. An empty reference lists every
    /// known ref of the repository instead.
    pub async fn resolve(&self, repo: &str, reference: &str) -> Vec<String> {
        match self {
            Backend::File(backend) => backend.resolve(repo, reference),
            Backend::Ipfs(backend) => backend.resolve(repo, reference).await,
        }
    }
}

/// Backend over a local file tree.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, repo: &str, reference: &str) -> Vec<String> {
        if reference.is_empty() {
            let Ok(entries) = std::fs::read_dir(self.root.join(repo)) else {
                return Vec::new();
            };
            let mut refs: Vec<String> = entries
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            refs.sort();
            return refs;
        }

        match std::fs::read_to_string(self.root.join(repo).join(reference)) {
            Ok(contents) => vec![contents.trim().to_owned()],
            Err(_) => Vec::new(),
        }
    }
}

/// Backend over a directory tree published in the store under a fixed root
/// CID.
#[derive(Debug)]
pub struct IpfsBackend {
    client: Arc<IpfsClient>,
    cid: String,
}

impl IpfsBackend {
    pub fn new(client: Arc<IpfsClient>, root: &str) -> Self {
        let cid = root
            .strip_prefix("/ipfs/")
            .unwrap_or(root)
            .trim_end_matches('/')
            .to_owned();
        Self { client, cid }
    }

    async fn resolve(&self, repo: &str, reference: &str) -> Vec<String> {
        if reference.is_empty() {
            return match self.client.list(&format!("{}/{}", self.cid, repo)).await {
                Ok(links) => links.into_iter().map(|l| l.name).collect(),
                Err(_) => Vec::new(),
            };
        }

        match self
            .client
            .cat(&format!("{}/{}/{}", self.cid, repo, reference))
            .await
        {
            Ok(bytes) => vec![String::from_utf8_lossy(&bytes).trim().to_owned()],
            Err(_) => Vec::new(),
        }
    }
}

/// Resolve a dnslink domain to its TXT record value, stripping the
/// `dnslink=` prefix. The `_dnslink.` label is prepended when missing.
async fn dnslink_lookup(domain: &str) -> Result<String> {
    let domain = domain.trim().to_ascii_lowercase();
    let domain = if domain.starts_with("_dnslink.") {
        domain
    } else {
        format!("_dnslink.{domain}")
    };

    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|err| RegistryError::Dnslink(err.to_string()))?;
    let records = resolver
        .txt_lookup(domain.as_str())
        .await
        .map_err(|err| RegistryError::Dnslink(err.to_string()))?;

    for record in records.iter() {
        let txt = record.to_string();
        if !txt.is_empty() {
            let value = txt.strip_prefix("dnslink=").unwrap_or(&txt);
            return Ok(value.to_owned());
        }
    }
    Err(RegistryError::Dnslink(format!(
        "no TXT record for {domain}"
    )))
}

/// An ordered chain of backends.
///
/// Scoped lookups return the first backend's non-empty result; unscoped
/// (listing) lookups union every backend's results, deduplicated and sorted.
#[derive(Debug)]
pub struct ResolverChain {
    backends: Vec<Backend>,
}

impl ResolverChain {
    /// Build a chain from backend URIs in order. URIs whose backend cannot
    /// be constructed (unreachable dnslink, unsupported target) are skipped
    /// with a warning.
    pub async fn new(client: &Arc<IpfsClient>, uris: &[String]) -> Self {
        let mut backends = Vec::with_capacity(uris.len());
        for uri in uris {
            match Backend::from_uri(client, uri).await {
                Ok(backend) => backends.push(backend),
                Err(err) => tracing::warn!(%uri, %err, "skipping resolver backend"),
            }
        }
        Self { backends }
    }

    /// Resolve through the chain. Never fails; an empty result means no
    /// backend knows the name.
    pub async fn resolve(&self, repo: &str, reference: &str) -> Vec<String> {
        let mut list = Vec::new();
        for backend in &self.backends {
            let result = backend.resolve(repo, reference).await;
            if result.is_empty() {
                continue;
            }
            if !reference.is_empty() {
                return result;
            }
            list.extend(result);
        }
        list.sort();
        list.dedup();
        list
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::ipfs::IpfsConfig;

    fn file_tree(entries: &[(&str, &str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (repo, reference, cid) in entries {
            let repo_dir = dir.path().join(repo);
            fs::create_dir_all(&repo_dir).unwrap();
            fs::write(repo_dir.join(reference), format!("{cid}\n")).unwrap();
        }
        dir
    }

    fn client() -> Arc<IpfsClient> {
        Arc::new(IpfsClient::new(&IpfsConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_file_backend_scoped() {
        let dir = file_tree(&[("lib", "latest", "CID_A")]);
        let backend = FileBackend::new(dir.path());

        // file contents are trimmed
        assert_eq!(backend.resolve("lib", "latest"), vec!["CID_A"]);
        assert!(backend.resolve("lib", "missing").is_empty());
        assert!(backend.resolve("other", "latest").is_empty());
    }

    #[tokio::test]
    async fn test_file_backend_listing() {
        let dir = file_tree(&[("lib", "latest", "CID_A"), ("lib", "v1", "CID_B")]);
        fs::create_dir_all(dir.path().join("lib/subdir")).unwrap();
        let backend = FileBackend::new(dir.path());

        // only regular files count as refs
        assert_eq!(backend.resolve("lib", ""), vec!["latest", "v1"]);
    }

    #[tokio::test]
    async fn test_chain_precedence() {
        let first = file_tree(&[("lib", "latest", "CID_A")]);
        let second = file_tree(&[("lib", "latest", "CID_B")]);
        let chain = ResolverChain::new(
            &client(),
            &[
                format!("file:{}", first.path().display()),
                format!("file:{}", second.path().display()),
            ],
        )
        .await;

        // the first backend with a non-empty result wins a scoped lookup
        assert_eq!(chain.resolve("lib", "latest").await, vec!["CID_A"]);
    }

    #[tokio::test]
    async fn test_chain_listing_unions() {
        let first = file_tree(&[("lib", "latest", "CID_A"), ("lib", "v2", "CID_C")]);
        let second = file_tree(&[("lib", "latest", "CID_B"), ("lib", "v1", "CID_D")]);
        let chain = ResolverChain::new(
            &client(),
            &[
                format!("file:{}", first.path().display()),
                format!("file:{}", second.path().display()),
            ],
        )
        .await;

        // union of ref names, deduplicated and sorted
        assert_eq!(
            chain.resolve("lib", "").await,
            vec!["latest", "v1", "v2"]
        );
    }

    #[tokio::test]
    async fn test_chain_falls_through_empty_backends() {
        let empty = tempfile::tempdir().unwrap();
        let tree = file_tree(&[("lib", "latest", "CID_A")]);
        let chain = ResolverChain::new(
            &client(),
            &[
                format!("file:{}", empty.path().display()),
                format!("file:{}", tree.path().display()),
            ],
        )
        .await;

        assert_eq!(chain.resolve("lib", "latest").await, vec!["CID_A"]);
        assert!(chain.resolve("unknown", "latest").await.is_empty());
    }
}
