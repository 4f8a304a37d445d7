//! Content fingerprinting for managed policies
//!
//! The fingerprint qualifies the synthesized package name so coexisting
//! policies never collide in the engine namespace, and doubles as the
//! changed/unchanged test when refreshing from a registry.

use md5::{Digest, Md5};

/// Separator between the hashed fields
const SEPARATOR: &str = "|";

/// Compute the stable identifier of a `(name, body, nonce)` triple.
///
/// Returns a lowercase 32-hex-digit digest over `nonce|name|body`. The same
/// inputs yield the same fingerprint across processes, so a restart computing
/// the same policy lands in the same namespace. Collision resistance only
/// needs to rule out accidental equality between distinct policies;
/// cryptographic strength is not required.
pub fn fingerprint(name: &str, body: &str, nonce: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(SEPARATOR.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(SEPARATOR.as_bytes());
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}
