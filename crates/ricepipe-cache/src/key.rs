//! Cache keys

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{CacheError, Result};

/// Ordered list of strings identifying a cached result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey {
    parts: Vec<String>,
}

impl CacheKey {
    /// Build a key from its parts; at least one part is required
    pub fn new<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() {
            return Err(CacheError::InvalidKey {
                reason: "key has no parts".to_string(),
            });
        }
        Ok(Self { parts })
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Hex SHA-256 digest of the parts
    ///
    /// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in &self.parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join(" "))
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self {
            parts: vec![key.to_string()],
        }
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self { parts: vec![key] }
    }
}

impl TryFrom<Vec<String>> for CacheKey {
    type Error = CacheError;

    fn try_from(parts: Vec<String>) -> Result<Self> {
        Self::new(parts)
    }
}

impl TryFrom<&[&str]> for CacheKey {
    type Error = CacheError;

    fn try_from(parts: &[&str]) -> Result<Self> {
        Self::new(parts.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_single_and_list_keys_match() {
        let single = CacheKey::from("ls -l");
        let list = CacheKey::try_from(vec!["ls -l".to_string()]).unwrap();
        assert_eq!(single, list);
        assert_eq!(single.digest(), list.digest());
    }

    #[test]
    fn test_empty_key_rejected() {
        let parts: &[&str] = &[];
        assert!(matches!(
            CacheKey::try_from(parts),
            Err(CacheError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_part_boundaries_matter() {
        let a = CacheKey::try_from(&["ab", "c"][..]).unwrap();
        let b = CacheKey::try_from(&["a", "bc"][..]).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = CacheKey::from("x").digest();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn prop_digest_is_stable(parts in prop::collection::vec(".*", 1..5)) {
            let first = CacheKey::new(parts.clone()).unwrap();
            let second = CacheKey::new(parts).unwrap();
            prop_assert_eq!(first.digest(), second.digest());
        }
    }
}
