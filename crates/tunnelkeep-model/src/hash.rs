//! Identity fingerprinting for cache keys

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::identity::TunnelIdentity;

/// Bumped whenever the hashed shape changes, so old cache entries are orphaned
/// instead of being misread.
pub const SCHEMA_VERSION: &str = "tunnelkeep.tunnel.v1";

/// Fingerprint of a tunnel identity within an account and region.
///
/// Returns the first 64 bits of the SHA-256 digest of the canonical JSON
/// payload, as 16 lowercase hex characters.
pub fn hash(identity: &TunnelIdentity, account: &str, region: &str) -> String {
    let payload = json!({
        "account": account,
        "region": region,
        "via": identity.via,
        "into": identity.into,
        "from": identity.from,
        "schemaVersion": SCHEMA_VERSION,
    });

    let canonical = canonicalize(payload).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..8])
}

/// Recursively rebuild objects with their keys in sorted order
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
