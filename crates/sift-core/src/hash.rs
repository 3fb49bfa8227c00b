//! Hash functions for Sift
//!
//! SHA-256 is used wherever a hash guards integrity (cache file, list
//! snapshots). xxHash64 is used for cheap change detection of small inputs
//! such as the whitelist.

use std::hash::Hasher;

use sha2::{Digest, Sha256};
use twox_hash::XxHash64;

const FINGERPRINT_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Lowercase hex SHA-256 of `data`.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stable 16-character identifier for a subscription URL.
pub fn list_id(url: &str) -> String {
    let mut id = content_hash(url.as_bytes());
    id.truncate(16);
    id
}

/// Order-sensitive xxHash64 over a sequence of strings.
/// Each item is terminated so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint<I, S>(items: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = XxHash64::with_seed(FINGERPRINT_SEED);
    for item in items {
        hasher.write(item.as_ref().as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}
