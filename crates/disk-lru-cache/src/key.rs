//! Entry ids: filesystem-safe digests of cache keys

use crate::error::{DiskCacheError, Result};
use sha2::{Digest, Sha256};
use std::fmt;

/// Bytes of the SHA-256 output kept for an id (128-bit class)
const DIGEST_BYTES: usize = 16;
const MAX_ID_LEN: usize = 120;

/// Identifier of a disk entry, safe to use as a file name and journal token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(String);

impl EntryId {
    /// Digest an arbitrary cache key into an id
    pub fn from_key(key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        EntryId(hex::encode(&digest[..DIGEST_BYTES]))
    }

    /// Validate an id read back from the journal
    pub fn parse(raw: &str) -> Result<Self> {
        let legal = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
        if legal {
            Ok(EntryId(raw.to_string()))
        } else {
            Err(DiskCacheError::CorruptJournal(format!(
                "illegal entry id {:?}",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let id1 = EntryId::from_key("https://example.com/photos/1.jpg");
        let id2 = EntryId::from_key("https://example.com/photos/1.jpg");
        let id3 = EntryId::from_key("https://example.com/photos/2.jpg");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);

        // 16 digest bytes as hex
        assert_eq!(id1.as_str().len(), 32);
        assert!(id1
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_unsafe_keys_become_legal_ids() {
        for key in ["../../etc/passwd", "a b\nc", "键", &"x".repeat(4096)] {
            let id = EntryId::from_key(key);
            assert!(EntryId::parse(id.as_str()).is_ok());
        }
    }

    #[test]
    fn test_parse_rejects_illegal_ids() {
        assert!(EntryId::parse("").is_err());
        assert!(EntryId::parse("has space").is_err());
        assert!(EntryId::parse("UPPER").is_err());
        assert!(EntryId::parse("a/b").is_err());
        assert!(EntryId::parse(&"a".repeat(121)).is_err());
        assert!(EntryId::parse("abc_123-x").is_ok());
    }
}
