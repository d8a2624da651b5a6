//! Canonical serialization for deterministic fingerprints.
//!
//! Report fingerprints must not depend on map iteration order, so hashed data uses
//! `Vec`/`BTreeMap`/`BTreeSet` only and is serialized as compact JSON.

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Serialize a value to canonical JSON bytes for hashing.
///
/// Values that cannot be represented as JSON (non-string map keys) hash as empty input.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    xxh64(&to_canonical_bytes(value), 0)
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_determinism() {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);

        assert_eq!(canonical_hash(&a), canonical_hash(&b));
        assert_eq!(canonical_hash_hex(&a).len(), 16);
    }

    #[test]
    fn test_order_sensitive_for_sequences() {
        assert_ne!(canonical_hash(&vec!["x", "y"]), canonical_hash(&vec!["y", "x"]));
    }
}
