//! Thin client over the IPFS HTTP API and gateway.
//!
//! The registry consumes a narrow slice of the store's surface: recursive
//! adds (as multipart uploads), `cat`, `ls`, `refs` and a normalized gateway
//! URL for read fetches. The store is assumed to be running at the
//! configured address; nothing here spawns a daemon.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::error::{RegistryError, Result};

const DEFAULT_API_HOST: &str = "127.0.0.1:5001";
const DEFAULT_GATEWAY_HOST: &str = "ipfs.io";

/// Timeout for small API calls (`cat`, `ls`, `refs`, `version`). Adds are
/// unbounded since they carry whole image uploads.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Config for the store client.
#[derive(Debug, Clone, Default)]
pub struct IpfsConfig {
    /// Address of the store's API endpoint, e.g. `127.0.0.1:5001`.
    pub host: String,
    /// URL base for read fetches, e.g. `https://ipfs.io`.
    pub gateway_url: String,
}

/// Client for the store's HTTP API.
#[derive(Debug, Clone)]
pub struct IpfsClient {
    http: reqwest::Client,
    api_base: String,
    gateway_url: String,
}

/// One link in a directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct LsLink {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hash", default)]
    pub hash: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

#[derive(Deserialize)]
struct LsObject {
    #[serde(rename = "Links", default)]
    links: Vec<LsLink>,
}

#[derive(Deserialize)]
struct LsResponse {
    #[serde(rename = "Objects", default)]
    objects: Vec<LsObject>,
}

#[derive(Deserialize)]
struct AddEvent {
    #[serde(rename = "Hash", default)]
    hash: String,
}

#[derive(Deserialize)]
struct RefEvent {
    #[serde(rename = "Ref", default)]
    r#ref: String,
}

#[derive(Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version")]
    version: String,
}

impl IpfsClient {
    /// Create a client for the API at `config.host` (defaulted to
    /// `127.0.0.1:5001`) and the gateway at `config.gateway_url`.
    pub fn new(config: &IpfsConfig) -> Result<Self> {
        let host = if config.host.is_empty() {
            DEFAULT_API_HOST
        } else {
            &config.host
        };
        let api_base = if host.contains("://") {
            format!("{}/api/v0", host.trim_end_matches('/'))
        } else {
            format!("http://{host}/api/v0")
        };

        Ok(Self {
            http: reqwest::Client::builder().build()?,
            api_base,
            gateway_url: normalize_gateway_url(&config.gateway_url),
        })
    }

    /// The normalized gateway URL (`http[s]://host[:port]`).
    pub fn gateway_url(&self) -> &str {
        &self.gateway_url
    }

    /// Probe the store's API. Used to fail fast at startup when the store is
    /// not reachable at the configured address.
    pub async fn version(&self) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/version", self.api_base))
            .timeout(API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let version: VersionResponse = resp.json().await?;
        Ok(version.version)
    }

    /// Read the content at `path` (`<cid>[/<sub>/…]`).
    pub async fn cat(&self, path: &str) -> Result<Bytes> {
        let resp = self
            .http
            .post(format!("{}/cat", self.api_base))
            .query(&[("arg", path)])
            .timeout(API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?)
    }

    /// List the links of the directory at `path`.
    pub async fn list(&self, path: &str) -> Result<Vec<LsLink>> {
        let resp = self
            .http
            .post(format!("{}/ls", self.api_base))
            .query(&[("arg", path)])
            .timeout(API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let listing: LsResponse = resp.json().await?;
        Ok(listing.objects.into_iter().flat_map(|o| o.links).collect())
    }

    /// Return the refs of `cid`, direct children only unless `recursive`.
    pub async fn refs(&self, cid: &str, recursive: bool) -> Result<Vec<String>> {
        let max_depth = if recursive { "-1" } else { "1" };
        let resp = self
            .http
            .post(format!("{}/refs", self.api_base))
            .query(&[("arg", cid), ("max-depth", max_depth)])
            .timeout(API_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(parse_refs_output(&resp.text().await?))
    }

    /// Recursively add a local directory tree to the store and return the CID
    /// of the directory's single child — the image directory itself, not the
    /// wrapper. This is what clients pull `<cid>/manifests/…` against.
    pub async fn add_dir(&self, dir: &Path) -> Result<String> {
        let base = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RegistryError::Api(format!("not a directory: {}", dir.display())))?;

        let mut parts = Vec::new();
        collect_dir_parts(dir, &base, &mut parts)?;
        let top = self.add(parts).await?;
        tracing::debug!(%top, "uploaded directory");

        self.first_ref(&top).await
    }

    /// Add an in-memory `image/{manifests/…, blobs/…}` directory and return
    /// its CID. The virtual directory has `image/` as its only top-level
    /// entry, so the final root emitted by the add names the image directory
    /// directly.
    pub async fn add_image(
        &self,
        manifests: &HashMap<String, Vec<u8>>,
        blobs: &HashMap<String, Vec<u8>>,
    ) -> Result<String> {
        let mut parts = vec![
            directory_part("image")?,
            directory_part("image/blobs")?,
            directory_part("image/manifests")?,
        ];
        for (name, data) in sorted(blobs) {
            parts.push(file_part(&format!("image/blobs/{name}"), data.clone())?);
        }
        for (name, data) in sorted(manifests) {
            parts.push(file_part(&format!("image/manifests/{name}"), data.clone())?);
        }

        self.add(parts).await
    }

    /// Issue the add API call and return the last root reference it emits.
    async fn add(&self, parts: Vec<Part>) -> Result<String> {
        let mut form = Form::new();
        for part in parts {
            form = form.part("file", part);
        }

        let resp = self
            .http
            .post(format!("{}/add", self.api_base))
            .query(&[("recursive", "true"), ("cid-version", "1")])
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        parse_add_output(&resp.text().await?)
    }

    /// Return the first non-empty ref of `top`, polling a bounded number of
    /// entries before giving up.
    async fn first_ref(&self, top: &str) -> Result<String> {
        let refs = self.refs(top, false).await?;
        for r in refs.into_iter().take(10) {
            if !r.is_empty() {
                return Ok(r);
            }
        }
        Err(RegistryError::Api(format!("no refs received for {top}")))
    }
}

/// Normalize a gateway URL to `http[s]://host[:port]`, defaulting the scheme
/// to `http` and the host to `ipfs.io`.
pub fn normalize_gateway_url(urlstr: &str) -> String {
    let urlstr = urlstr.trim();
    if urlstr.is_empty() {
        return format!("http://{DEFAULT_GATEWAY_HOST}");
    }
    let with_scheme = if urlstr.contains("://") {
        urlstr.to_string()
    } else {
        format!("http://{urlstr}")
    };
    let parsed = match url::Url::parse(&with_scheme) {
        Ok(u) => u,
        Err(_) => return format!("http://{DEFAULT_GATEWAY_HOST}"),
    };

    let scheme = match parsed.scheme() {
        "https" => "https",
        _ => "http",
    };
    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => DEFAULT_GATEWAY_HOST,
    };
    match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

fn directory_part(name: &str) -> Result<Part> {
    let part = Part::bytes(Vec::new())
        .mime_str("application/x-directory")?
        .file_name(name.to_owned());
    Ok(part)
}

fn file_part(name: &str, data: Vec<u8>) -> Result<Part> {
    let part = Part::bytes(data)
        .mime_str("application/octet-stream")?
        .file_name(name.to_owned());
    Ok(part)
}

/// Walk `base`, appending one part per directory and regular file, parents
/// before children. Symlinks and special files are skipped.
fn collect_dir_parts(base: &Path, prefix: &str, parts: &mut Vec<Part>) -> Result<()> {
    parts.push(directory_part(prefix)?);

    let mut entries = std::fs::read_dir(base)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let child = format!("{}/{}", prefix, name.to_string_lossy());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_dir_parts(&entry.path(), &child, parts)?;
        } else if file_type.is_file() {
            parts.push(file_part(&child, std::fs::read(entry.path())?)?);
        }
    }
    Ok(())
}

fn sorted<'a>(map: &'a HashMap<String, Vec<u8>>) -> Vec<(&'a String, &'a Vec<u8>)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(name, _)| name.as_str());
    entries
}

/// Parse the add API's streamed JSON output, keeping the last emitted root.
fn parse_add_output(body: &str) -> Result<String> {
    let mut last = String::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let event: AddEvent = serde_json::from_str(line)?;
        last = event.hash;
    }
    if last.is_empty() {
        return Err(RegistryError::Api("no results received".into()));
    }
    Ok(last)
}

fn parse_refs_output(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| serde_json::from_str::<RefEvent>(line).ok())
        .map(|event| event.r#ref)
        .filter(|r| !r.is_empty())
        .collect()
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_normalize_gateway_url() {
        for (input, want) in [
            ("", "http://ipfs.io"),
            ("ipfs.io", "http://ipfs.io"),
            ("127.0.0.1:8080", "http://127.0.0.1:8080"),
            ("http://127.0.0.1:8080", "http://127.0.0.1:8080"),
            ("https://cloudflare-ipfs.com", "https://cloudflare-ipfs.com"),
            ("gateway.pinata.cloud:443", "http://gateway.pinata.cloud:443"),
        ] {
            assert_eq!(normalize_gateway_url(input), want, "input: {input:?}");
        }
    }

    #[test]
    fn test_parse_add_output() {
        let body = concat!(
            "{\"Name\":\"image/blobs/sha256:aa\",\"Hash\":\"bafyblob\",\"Size\":\"10\"}\n",
            "{\"Name\":\"image\",\"Hash\":\"bafyimage\",\"Size\":\"40\"}\n",
        );
        assert_eq!(parse_add_output(body).unwrap(), "bafyimage");
        assert!(parse_add_output("").is_err());
    }

    #[test]
    fn test_parse_refs_output() {
        let body = "{\"Ref\":\"bafychild\"}\n{\"Ref\":\"\"}\n";
        assert_eq!(parse_refs_output(body), vec!["bafychild".to_string()]);
    }

    #[test]
    fn test_api_base() {
        let client = IpfsClient::new(&IpfsConfig::default()).unwrap();
        assert_eq!(client.api_base, "http://127.0.0.1:5001/api/v0");

        let client = IpfsClient::new(&IpfsConfig {
            host: "ipfs.example.com:5001".into(),
            gateway_url: String::new(),
        })
        .unwrap();
        assert_eq!(client.api_base, "http://ipfs.example.com:5001/api/v0");
    }
}
