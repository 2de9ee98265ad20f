//! Content-derived revision identifiers
//!
//! Provides [`Revision`], a strongly-typed 32-byte Blake3 digest that names
//! one merged state of a configuration item, and [`RevisionHasher`], which
//! feeds a file set and trigger marker into it in a canonical order.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte revision digest (Blake3)
///
/// Equal merged inputs always produce an equal revision. Immutable and
/// cheap to clone (Copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision([u8; 32]);

impl Revision {
    /// Create a revision from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create revision from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RevisionError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| RevisionError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Digest arbitrary data
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self::new(*blake3::hash(data).as_bytes())
    }

    /// Digest a serializable value through its JSON encoding
    ///
    /// Used for fingerprints of item inputs; maps are expected to be
    /// ordered (`BTreeMap`) so that the encoding is canonical.
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn compute_serializable<T>(value: &T) -> Result<Self, RevisionError>
    where
        T: serde::Serialize,
    {
        let json = serde_json::to_vec(value)?;
        Ok(Self::compute(&json))
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check if revision is all zeros (placeholder)
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Revision {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self([0; 32])
    }
}

impl serde::Serialize for Revision {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> serde::Deserialize<'de> for Revision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct RevisionVisitor;

        impl serde::de::Visitor<'_> for RevisionVisitor {
            type Value = Revision;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a 32-byte revision as hex string or bytes")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }

            fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Revision::from_slice(value).map_err(serde::de::Error::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(RevisionVisitor)
        } else {
            deserializer.deserialize_bytes(RevisionVisitor)
        }
    }
}

/// Incremental digest over a file set and trigger marker
///
/// Every field is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// never collide. Callers must feed files in a stable order.
#[derive(Debug, Default)]
pub struct RevisionHasher {
    inner: blake3::Hasher,
}

impl RevisionHasher {
    /// Start a new digest
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn field(&mut self, bytes: &[u8]) {
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
    }

    /// Add one file
    pub fn file(&mut self, name: &str, content: &str) -> &mut Self {
        self.inner.update(b"F");
        self.field(name.as_bytes());
        self.field(content.as_bytes());
        self
    }

    /// Add the trigger marker; `None` and `Some("")` are distinct
    pub fn marker(&mut self, marker: Option<&str>) -> &mut Self {
        match marker {
            Some(m) => {
                self.inner.update(b"M");
                self.field(m.as_bytes());
            }
            None => {
                self.inner.update(b"N");
            }
        }
        self
    }

    /// Finish the digest
    #[must_use]
    pub fn finish(&self) -> Revision {
        Revision::new(*self.inner.finalize().as_bytes())
    }
}

/// Errors that can occur when working with revisions
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    /// Invalid digest length
    #[error("invalid revision length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_from_slice_invalid_length() {
        let result = Revision::from_slice(&[1u8; 31]);
        assert!(matches!(
            result,
            Err(RevisionError::InvalidLength { expected: 32, actual: 31 })
        ));
    }

    #[test]
    fn revision_display_and_parse() {
        let rev = Revision::compute(b"max_connections=100");
        let parsed: Revision = rev.to_string().parse().unwrap();
        assert_eq!(rev, parsed);
    }

    #[test]
    fn revision_short_is_prefix() {
        let rev = Revision::compute(b"test");
        assert_eq!(rev.short().len(), 16);
        assert!(rev.to_string().starts_with(&rev.short()));
    }

    #[test]
    fn revision_default_is_zero() {
        assert!(Revision::default().is_zero());
        assert!(!Revision::compute(b"x").is_zero());
    }

    #[test]
    fn revision_serde_json_is_hex() {
        let rev = Revision::compute(b"serde");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, format!("\"{rev}\""));
        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
    }

    #[test]
    fn hasher_is_deterministic() {
        let a = RevisionHasher::new()
            .file("my.cnf", "a=1")
            .marker(Some("v1"))
            .finish();
        let b = RevisionHasher::new()
            .file("my.cnf", "a=1")
            .marker(Some("v1"))
            .finish();
        assert_eq!(a, b);
    }

    #[test]
    fn hasher_length_prefix_prevents_collisions() {
        let a = RevisionHasher::new().file("ab", "c").finish();
        let b = RevisionHasher::new().file("a", "bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn hasher_marker_changes_revision() {
        let base = RevisionHasher::new().file("f", "x").marker(None).finish();
        let empty = RevisionHasher::new().file("f", "x").marker(Some("")).finish();
        let v2 = RevisionHasher::new().file("f", "x").marker(Some("2")).finish();
        assert_ne!(base, empty);
        assert_ne!(empty, v2);
    }
}
