//! Content hashing for binary frame correlation
//!
//! The hash only pairs a binary frame with the `bytes_command` envelope that
//! refers to it. It is not an integrity check against an adversary.

use xxhash_rust::xxh3::xxh3_64;

/// Fingerprint `bytes` as 16 lowercase hex digits
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}
