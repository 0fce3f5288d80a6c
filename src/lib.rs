//! IPFS-backed Docker registry.
//!
//! This library implements the two halves of `ipdr`:
//!
//! - **Ingest**: transform a locally exported image archive into a
//!   registry-compatible `{manifests/,blobs/}` directory and publish it to
//!   IPFS, yielding a stable CID that names the image
//!   ([`archive`], [`registry::push_archive`]).
//! - **Serve**: expose the Docker Registry V2 / OCI distribution protocol on
//!   a local endpoint so a standard daemon can push and pull by repository
//!   name or by CID, with the server translating between the wire protocol
//!   and content-addressed gateway fetches ([`server`]).
//!
//! Names are mapped to CIDs by a pluggable [`resolver`] chain (local file
//! tree, a directory published in the store, dnslink TXT indirection),
//! fronted by a persistent [`cids`] memo that successful pushes populate.

pub mod archive;
pub mod cid;
pub mod cids;
pub mod error;
pub mod image;
pub mod ipfs;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod util;

pub use error::{RegistryError, Result};
pub use server::{Registry, Server, ServerConfig};
