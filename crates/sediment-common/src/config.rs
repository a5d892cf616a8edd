//! Configuration types for Sediment
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for a Sediment storage instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Chunk storage configuration
    pub chunk: ChunkConfig,
    /// Compaction configuration
    pub compaction: CompactionConfig,
    /// Garbage collection configuration
    pub gc: GcConfig,
    /// In-memory byte budget of an unordered writer before it flushes a
    /// sub-fileset layer (default: 64 MB)
    pub memory_threshold: usize,
    /// Maximum number of concurrently open writers (admission semaphore)
    pub max_open_writers: usize,
    /// TTL applied to layers sealed on behalf of a caller that did not
    /// specify one
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            compaction: CompactionConfig::default(),
            gc: GcConfig::default(),
            memory_threshold: 64 * 1024 * 1024, // 64 MB
            max_open_writers: 64,
            default_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Chunk storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Target chunk size in bytes (default: 4 MB)
    pub target_size: usize,
    /// Maximum number of chunks held in the read cache
    pub cache_capacity: usize,
    /// TTL applied to newly created chunks
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_size: 4 * 1024 * 1024, // 4 MB
            cache_capacity: 256,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Compaction configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Maximum merge fan-in at any level
    pub max_fan_in: usize,
    /// Target number of shards for a sharded compaction
    pub target_shard_count: usize,
    /// TTL applied to intermediate compaction outputs; kept alive by the
    /// renewer while the parent step runs
    #[serde(with = "duration_secs")]
    pub intermediate_ttl: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_fan_in: 10,
            target_shard_count: 8,
            intermediate_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Garbage collection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Interval between sweeps when running the GC loop
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
