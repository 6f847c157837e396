//! Content addressing for decomposed AST entities.
//!
//! A [`ContentId`] names a subtree by the digest of its canonical encoding
//! (see [`crate::hash`]). The digest algorithm sits behind the [`Hasher`]
//! trait; SHA-256 is the default and the only algorithm used on the wire.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::str::FromStr;

/// Digest algorithm used for content addressing.
///
/// Implementations must be deterministic and produce `HASH_SIZE` bytes.
pub trait Hasher: Clone + Default + PartialEq + Eq + Hash + Send + Sync + 'static {
    /// Size of the digest in bytes.
    const HASH_SIZE: usize;

    /// Digest the input bytes.
    fn digest(data: &[u8]) -> Vec<u8>;

    /// Algorithm name, used in debug output.
    fn algorithm_name() -> &'static str;
}

/// SHA-256 via the `sha2` crate.
#[derive(Clone, Default, Debug, PartialEq, Eq, Hash)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    const HASH_SIZE: usize = 32;

    fn digest(data: &[u8]) -> Vec<u8> {
        sha2::Sha256::digest(data).to_vec()
    }

    fn algorithm_name() -> &'static str {
        "sha256"
    }
}

/// Error parsing a hex-encoded content id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentIdParseError {
    #[error("expected {expected} hex digits, found {found}")]
    Length { expected: usize, found: usize },
    #[error("invalid hex digit {digit:?} at offset {offset}")]
    Digit { digit: char, offset: usize },
}

/// Content identifier parameterized by digest algorithm.
///
/// Two subtrees with the same `ContentId` are structurally identical: same
/// node types, same ground values, same child order, same names. Concrete
/// entity ids never contribute to the digest.
///
/// ```
/// use cesk_types::content_id::{ContentId, Sha256Hasher};
///
/// let cid: ContentId<Sha256Hasher> = ContentId::from_bytes(b"literal");
/// assert_eq!(cid.as_bytes().len(), 32);
/// assert_eq!(cid.to_hex().parse::<ContentId>().unwrap(), cid);
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentId<H: Hasher = Sha256Hasher> {
    hash: Vec<u8>,
    _hasher: PhantomData<H>,
}

impl<H: Hasher> ContentId<H> {
    /// Hash raw bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            hash: H::digest(data),
            _hasher: PhantomData,
        }
    }

    /// Wrap a precomputed digest, rejecting digests of the wrong size.
    pub fn from_hash(hash: Vec<u8>) -> Result<Self, ContentIdParseError> {
        if hash.len() != H::HASH_SIZE {
            return Err(ContentIdParseError::Length {
                expected: H::HASH_SIZE * 2,
                found: hash.len() * 2,
            });
        }
        Ok(Self {
            hash,
            _hasher: PhantomData,
        })
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.hash
    }

    /// Lowercase hex encoding of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.hash.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse a lowercase or uppercase hex digest.
    pub fn from_hex(text: &str) -> Result<Self, ContentIdParseError> {
        if text.len() != H::HASH_SIZE * 2 {
            return Err(ContentIdParseError::Length {
                expected: H::HASH_SIZE * 2,
                found: text.len(),
            });
        }
        let mut hash = Vec::with_capacity(H::HASH_SIZE);
        let mut hi = None;
        for (offset, digit) in text.chars().enumerate() {
            let nibble = digit
                .to_digit(16)
                .ok_or(ContentIdParseError::Digit { digit, offset })?;
            // to_digit(16) is < 16, so the cast is lossless.
            let nibble = nibble as u8;
            match hi.take() {
                None => hi = Some(nibble),
                Some(high) => hash.push((high << 4) | nibble),
            }
        }
        Self::from_hash(hash)
    }

    #[must_use]
    pub fn algorithm(&self) -> &'static str {
        H::algorithm_name()
    }
}

impl<H: Hasher> PartialOrd for ContentId<H> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<H: Hasher> Ord for ContentId<H> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl<H: Hasher> FromStr for ContentId<H> {
    type Err = ContentIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl<H: Hasher> fmt::Debug for ContentId<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_hex: String = self
            .hash
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect();
        write!(f, "ContentId<{}>({short_hex}...)", H::algorithm_name())
    }
}

impl<H: Hasher> fmt::Display for ContentId<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Hex strings on the wire, so content ids work as JSON object keys.
impl<H: Hasher> Serialize for ContentId<H> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de, H: Hasher> Deserialize<'de> for ContentId<H> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_empty() {
        let cid = ContentId::<Sha256Hasher>::from_bytes(b"");
        assert_eq!(
            cid.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hex_round_trip() {
        let cid = ContentId::<Sha256Hasher>::from_bytes(b"(+ 1 2)");
        let parsed: ContentId = cid.to_hex().to_uppercase().parse().unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert_eq!(
            ContentId::<Sha256Hasher>::from_hex("abcd"),
            Err(ContentIdParseError::Length {
                expected: 64,
                found: 4
            })
        );
        let bad = "zz".repeat(32);
        assert!(matches!(
            ContentId::<Sha256Hasher>::from_hex(&bad),
            Err(ContentIdParseError::Digit { digit: 'z', offset: 0 })
        ));
    }

    #[test]
    fn test_serde_as_map_key() {
        let cid = ContentId::<Sha256Hasher>::from_bytes(b"key");
        let mut map = std::collections::BTreeMap::new();
        map.insert(cid.clone(), 7_u8);
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains(&cid.to_hex()));
        let back: std::collections::BTreeMap<ContentId, u8> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&cid), Some(&7));
    }

    #[test]
    fn test_debug_is_short() {
        let cid = ContentId::<Sha256Hasher>::from_bytes(b"test");
        let debug = format!("{cid:?}");
        assert!(debug.starts_with("ContentId<sha256>("));
        assert!(debug.len() < 40);
    }
}
