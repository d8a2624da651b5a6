//! Content hashing for reassembled files.
//!
//! Ingestion pipelines record the SHA-256 of the whole original file on every chunk.
//! Recorded values are compared case-insensitively and may carry a `sha256:` prefix.
//! Verification is best-effort: chunks without a recorded hash are accepted as-is.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 of `content` as lowercase hex.
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Normalize a recorded hash for comparison.
pub fn normalize_hash(recorded: &str) -> String {
    let trimmed = recorded.trim();
    let without_prefix = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    without_prefix.to_ascii_lowercase()
}

/// Result of checking content against a recorded hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashValidation {
    /// The recorded hash matches.
    Valid,
    /// The recorded hash differs from the computed one.
    Mismatch {
        /// Recorded (normalized) hash.
        expected: String,
        /// Computed hash.
        actual: String,
    },
}

impl HashValidation {
    /// Whether validation passed.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Check `content` against every distinct recorded hash.
///
/// Returns the first mismatch, in the order given.
pub fn validate_content_hash<'a, I>(content: &[u8], recorded: I) -> HashValidation
where
    I: IntoIterator<Item = &'a str>,
{
    let actual = compute_content_hash(content);
    for value in recorded {
        let expected = normalize_hash(value);
        if expected != actual {
            return HashValidation::Mismatch { expected, actual };
        }
    }
    HashValidation::Valid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            compute_content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_prefix_and_case_are_ignored() {
        let upper = format!("sha256:{}", compute_content_hash(b"abc").to_uppercase());
        assert!(validate_content_hash(b"abc", [upper.as_str()]).is_valid());
    }

    #[test]
    fn test_mismatch_reports_both_values() {
        let result = validate_content_hash(b"abc", ["deadbeef"]);
        match result {
            HashValidation::Mismatch { expected, actual } => {
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual, compute_content_hash(b"abc"));
            }
            HashValidation::Valid => panic!("expected mismatch"),
        }
    }

    #[test]
    fn test_no_recorded_hash_is_valid() {
        assert!(validate_content_hash(b"anything", std::iter::empty()).is_valid());
    }
}
