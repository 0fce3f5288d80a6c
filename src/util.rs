use sha2::{Digest, Sha256};

/// Hash a byte buffer and return the digest in the `sha256:<hex>` form used
/// throughout the registry protocol.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut context = Sha256::new();
    context.update(bytes);
    format!("sha256:{}", hex::encode(context.finalize()))
}

/// Extract the port from a `host[:port]` string.
///
/// A bare port (`"5000"`) and a host-less form (`":5000"`) are both
/// accepted. Returns 0 when no port is present.
pub fn extract_port(host: &str) -> u16 {
    let tail = match host.rsplit_once(':') {
        Some((_, tail)) => tail,
        None => host,
    };
    tail.parse().unwrap_or(0)
}
