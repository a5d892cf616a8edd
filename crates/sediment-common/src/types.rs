//! Core type definitions for Sediment
//!
//! This module defines the fundamental identifier and key-space types used
//! throughout the system.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tag applied to file parts written without an explicit tag.
pub const DEFAULT_TAG: &str = "default";

/// Opaque handle to a sealed fileset (primitive layer or composite)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileSetId(Uuid);

impl FileSetId {
    /// Generate a new random fileset ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// The tracker ID under which this fileset is registered
    #[must_use]
    pub fn tracker_id(&self) -> String {
        format!("fileset/{}", self.0)
    }
}

impl Default for FileSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileSetId({})", self.0)
    }
}

impl fmt::Display for FileSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash of a chunk (SHA-256 of the plaintext bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    /// Create from raw digest bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex rendering, used as the blob-backend key
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex rendering back into a hash
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// The tracker ID under which this chunk is registered
    #[must_use]
    pub fn tracker_id(&self) -> String {
        format!("chunk/{}", self.to_hex())
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.to_hex())
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A half-open interval of the path key space: `lower` inclusive, `upper`
/// exclusive. `None` on either side means unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRange {
    pub lower: Option<String>,
    pub upper: Option<String>,
}

impl PathRange {
    /// The unbounded range covering the whole key space
    #[must_use]
    pub const fn full() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    /// Whether `path` falls inside this range
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        if let Some(lower) = &self.lower
            && path < lower.as_str()
        {
            return false;
        }
        if let Some(upper) = &self.upper
            && path >= upper.as_str()
        {
            return false;
        }
        true
    }

    /// Whether `path` is at or past the exclusive upper bound
    #[must_use]
    pub fn past_upper(&self, path: &str) -> bool {
        self.upper.as_ref().is_some_and(|u| path >= u.as_str())
    }
}

/// Canonicalize a path: a single leading slash, a trailing slash only for
/// directories.
#[must_use]
pub fn clean_path(path: &str, is_dir: bool) -> String {
    let mut p = format!("/{}", path.trim_matches('/'));
    if is_dir && !p.ends_with('/') {
        p.push('/');
    }
    p
}

/// Whether a canonical path names a directory
#[must_use]
pub fn is_dir(path: &str) -> bool {
    path.ends_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_hash_hex_round_trip() {
        let hash = ChunkHash::from_bytes([0xab; 32]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ChunkHash::from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn test_chunk_hash_from_bad_hex() {
        assert!(ChunkHash::from_hex("abcd").is_err());
        assert!(ChunkHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_path_range_contains() {
        let range = PathRange {
            lower: Some("/b".into()),
            upper: Some("/d".into()),
        };
        assert!(!range.contains("/a"));
        assert!(range.contains("/b"));
        assert!(range.contains("/c"));
        assert!(!range.contains("/d"));

        assert!(PathRange::full().contains("/anything"));
    }

    #[test]
    fn test_path_range_past_upper() {
        let range = PathRange {
            lower: None,
            upper: Some("/m".into()),
        };
        assert!(!range.past_upper("/a"));
        assert!(range.past_upper("/m"));
        assert!(range.past_upper("/z"));
        assert!(!PathRange::full().past_upper("/z"));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("foo/bar", false), "/foo/bar");
        assert_eq!(clean_path("/foo/bar/", false), "/foo/bar");
        assert_eq!(clean_path("foo", true), "/foo/");
        assert!(is_dir("/foo/"));
        assert!(!is_dir("/foo"));
    }
}
