//! Canonical digest utilities.
//!
//! Every claim in an evidence bundle is backed by a sha256 digest, so the
//! digests themselves must be deterministic: two structurally equal JSON
//! values hash identically regardless of field insertion order, hash-map
//! iteration order, or when they were produced.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Chunk size for streaming file digests. Files are never loaded whole.
const FILE_CHUNK_BYTES: usize = 64 * 1024;

/// sha256 over raw bytes, hex-encoded.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// sha256 over the canonical JSON encoding of `value`.
pub fn stable_sha256(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

/// Canonical JSON: object keys sorted, no incidental whitespace.
///
/// This is the only encoding the evidence writer persists, so byte-level
/// diffs of two bundles compare semantics, not serializer moods.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Value's Display emits compact JSON with proper escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

/// sha256 of a file, streamed in fixed-size chunks.
pub fn stable_file_sha256(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; FILE_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True when `digest` looks like a sha256 hex digest.
pub fn is_sha256_hex(digest: &str) -> bool {
    digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit())
}
