//! CID re-encoding between the two external forms the registry accepts.
//!
//! The store prints CIDs in base58 multihash form (`Qm…`). Container daemons
//! only accept lowercase DNS-label-safe repository names, so CIDs embedded in
//! repo names use a lowercase base32 form instead. Conversion between the two
//! is bijective for valid input.

use data_encoding::{BASE32, BASE32_NOPAD};

/// Multicodec code for dag-pb, the codec of store-produced directory CIDs.
const DAG_PB: u64 = 0x70;

/// Re-encode a base58 CID into the lowercase base32 form accepted as part of
/// a Docker repository name. A leading `/ipfs/` prefix is stripped.
///
/// At most one trailing `=` pad character is removed from the base32
/// encoding. This is exact for 34-byte CIDv0 multihashes (sha2-256), whose
/// base32 encoding always carries pad-length 1; [`ipfsify`] re-appends the
/// single pad on the way back.
pub fn dockerize(base58_hash: &str) -> String {
    let hash = base58_hash.strip_prefix("/ipfs/").unwrap_or(base58_hash);
    let decoded = match bs58::decode(hash).into_vec() {
        Ok(bytes) => bytes,
        Err(_) => return String::new(),
    };
    let mut b32 = BASE32.encode(&decoded);
    if b32.ends_with('=') {
        b32.pop();
    }
    b32.to_ascii_lowercase()
}

/// Re-encode a lowercase base32 CID back into base58 multihash form.
///
/// Appends the single `=` pad stripped by [`dockerize`] before decoding.
/// Returns an empty string on invalid input, never an error.
pub fn ipfsify(base32_hash: &str) -> String {
    let mut padded = base32_hash.to_ascii_uppercase();
    padded.push('=');
    match BASE32.decode(padded.as_bytes()) {
        Ok(bytes) => bs58::encode(bytes).into_string(),
        Err(_) => String::new(),
    }
}

/// Parse `s` as a CID and return the base58 encoding of its multihash, or an
/// empty string when `s` is not a valid CID.
pub fn to_b58(s: &str) -> String {
    match decode_cid(s) {
        Some((_, multihash)) => bs58::encode(multihash).into_string(),
        None => String::new(),
    }
}

/// Parse `s` as a CID and return its CIDv1 base32 string (multibase `b`
/// prefix, lowercase, unpadded), or an empty string when `s` is not a valid
/// CID.
pub fn to_b32(s: &str) -> String {
    let Some((codec, multihash)) = decode_cid(s) else {
        return String::new();
    };
    let mut bytes = Vec::with_capacity(multihash.len() + 4);
    put_uvarint(&mut bytes, 1);
    put_uvarint(&mut bytes, codec);
    bytes.extend_from_slice(&multihash);
    format!("b{}", BASE32_NOPAD.encode(&bytes).to_ascii_lowercase())
}

/// Build a gateway fetch URL: `<gw>/ipfs/<parts joined by '/'>`.
pub fn ipfs_url(gw: &str, parts: &[&str]) -> String {
    format!("{}/ipfs/{}", gw, parts.join("/"))
}

/// Decode a CID in either external form into `(codec, multihash)`.
///
/// CIDv0 is a bare base58 sha2-256 multihash (`Qm…`, always dag-pb); CIDv1
/// is multibase base32 (`b…`). Other multibase prefixes are not produced by
/// the store and are rejected.
fn decode_cid(s: &str) -> Option<(u64, Vec<u8>)> {
    if s.len() == 46 && s.starts_with("Qm") {
        let bytes = bs58::decode(s).into_vec().ok()?;
        if bytes.len() == 34 && bytes[0] == 0x12 && bytes[1] == 0x20 {
            return Some((DAG_PB, bytes));
        }
        return None;
    }

    let rest = s.strip_prefix('b')?;
    let bytes = BASE32_NOPAD
        .decode(rest.to_ascii_uppercase().as_bytes())
        .ok()?;
    let (version, n) = read_uvarint(&bytes)?;
    if version != 1 {
        return None;
    }
    let (codec, m) = read_uvarint(&bytes[n..])?;
    let multihash = bytes[n + m..].to_vec();
    // multihash layout: <hash-code> <digest-len> <digest>
    if multihash.len() < 2 || multihash.len() != multihash[1] as usize + 2 {
        return None;
    }
    Some((codec, multihash))
}

fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 9 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}
