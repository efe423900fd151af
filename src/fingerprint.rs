//! Deterministic item identity.
//!
//! An item's `uuid` is the SHA-1 hex digest of its origin and its source-native
//! id joined with `:`. Every persisted archive and every downstream store keys
//! on this value, so the algorithm must never change.

use sha1::{Digest, Sha1};

use crate::error::{HarvestError, Result};

/// Compute the fingerprint of an ordered list of non-empty strings.
///
/// Fails with [`HarvestError::InvalidArgument`] when no parts are given or
/// when any part is empty.
///
/// ```
/// use item_harvest::fingerprint::fingerprint;
///
/// let id = fingerprint(&["http://example.com/", "1234567"]).unwrap();
/// assert_eq!(id, "47509b2f0d4ffc513ca9230838a69aa841d7f055");
/// ```
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> Result<String> {
    if parts.is_empty() {
        return Err(HarvestError::InvalidArgument(
            "at least one value is required".to_string(),
        ));
    }

    let mut joined = String::new();
    for (i, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        if part.is_empty() {
            return Err(HarvestError::InvalidArgument(
                "value cannot be None or empty".to_string(),
            ));
        }
        if i > 0 {
            joined.push(':');
        }
        joined.push_str(part);
    }

    let mut hasher = Sha1::new();
    hasher.update(joined.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(
            fingerprint(&["1", "2", "3", "4"]).unwrap(),
            "e7b71c81f5a0723e2237f157dba81777ce7c6c21"
        );
        assert_eq!(
            fingerprint(&["http://example.com/", "1234567"]).unwrap(),
            "47509b2f0d4ffc513ca9230838a69aa841d7f055"
        );
    }

    #[test]
    fn stable_across_calls() {
        let a = fingerprint(&["https://tracker.example.com", "42"]).unwrap();
        let b = fingerprint(&[String::from("https://tracker.example.com"), "42".into()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_part_fails() {
        for parts in [vec!["1", "", "2"], vec!["", "1"], vec!["1", ""], vec![""]] {
            let err = fingerprint(&parts).unwrap_err();
            assert!(matches!(err, HarvestError::InvalidArgument(_)));
        }
    }

    #[test]
    fn no_parts_fails() {
        let parts: [&str; 0] = [];
        assert!(matches!(
            fingerprint(&parts),
            Err(HarvestError::InvalidArgument(_))
        ));
    }
}
