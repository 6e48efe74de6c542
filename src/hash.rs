//! Spec hashing and drift detection
//!
//! Every managed resource carries a `spec-hash` label holding a digest of the
//! structural spec it was built from. Comparing that label against the digest
//! of a freshly built desired spec detects drift without a deep comparison of
//! server-populated fields.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::SPEC_HASH_LABEL;

/// Number of digest bytes kept (32 hex chars, within the 63-char label limit)
const DIGEST_BYTES: usize = 16;

/// Compute the spec hash of a structural spec.
///
/// The value is first converted to a `serde_json::Value`, whose object maps
/// are key-sorted, so the digest does not depend on struct field order. The
/// canonical JSON is hashed with truncated SHA-256, which is stable across
/// Rust toolchains and process restarts (unlike `DefaultHasher`).
pub fn spec_hash<T: Serialize>(spec: &T) -> String {
    let canonical = serde_json::to_value(spec)
        .map(|value| value.to_string())
        .unwrap_or_default();
    digest_hex(canonical.as_bytes())
}

fn digest_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()[..DIGEST_BYTES]
        .iter()
        .fold(String::with_capacity(DIGEST_BYTES * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Read the spec hash label from a resource's labels, if present
pub fn hash_from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<&str> {
    labels
        .and_then(|l| l.get(SPEC_HASH_LABEL))
        .map(String::as_str)
}

/// Return `labels` with the spec hash label set to `hash`, keeping other entries
pub fn set_hash_label(
    labels: Option<BTreeMap<String, String>>,
    hash: &str,
) -> BTreeMap<String, String> {
    let mut labels = labels.unwrap_or_default();
    labels.insert(SPEC_HASH_LABEL.to_string(), hash.to_string());
    labels
}

/// Whether a stored resource matches its desired counterpart.
///
/// A missing stored hash (created outside the operator, or by a version that
/// did not label) counts as out of sync so the next pass labels it.
pub fn is_in_sync(stored: Option<&str>, desired: &str) -> bool {
    stored == Some(desired)
}
