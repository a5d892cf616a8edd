//! Checksum utilities for Sediment
//!
//! Content addressing uses SHA-256; CRC32C covers fast sub-range
//! verification on the read path.

use crate::types::ChunkHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compute the content hash used to address a chunk
#[must_use]
pub fn content_hash(data: &[u8]) -> ChunkHash {
    ChunkHash::from_bytes(Sha256::digest(data).into())
}

/// Checksum for a byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C (fast, for inline verification)
    pub crc32c: u32,
}

impl Checksum {
    /// Compute the checksum of a byte range
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
        }
    }

    /// Verify data against this checksum
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }
}
