//! Error types for the ipdr library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, RegistryError>`.

/// Result type alias for operations that may return a RegistryError.
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Error types for registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The image archive is malformed or was produced by an unsupported tool.
    #[error("invalid image archive: {0}")]
    InvalidArchive(String),

    /// No backend could map the repository and reference to a CID.
    #[error("cannot resolve CID: {0}")]
    UnresolvedCid(String),

    /// The IPFS API returned an unexpected response.
    #[error("IPFS API error: {0}")]
    Api(String),

    /// A gateway fetch returned a non-success status.
    #[error("cid: {cid} {status}")]
    Gateway { cid: String, status: String },

    /// A dnslink TXT lookup failed or yielded an unusable record.
    #[error("dnslink: {0}")]
    Dnslink(String),

    /// A resolver backend URI has an unsupported scheme.
    #[error("not supported: {0}")]
    UnsupportedResolver(String),

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
