//! Path-range sharding of an index stream.

use sediment_chunk::{ChunkStorage, DataRef};
use sediment_common::{PathRange, Result};

use super::reader::Reader;

/// Splits a sorted `(path, size)` sequence into at most `target_count`
/// contiguous ranges of roughly equal total size.
///
/// The returned ranges tile the full path space: the first has no lower
/// bound, the last no upper bound, and each upper bound equals the next
/// range's lower bound. One entry or fewer yields a single unbounded
/// range.
pub fn shard_by_size(entries: &[(String, u64)], target_count: usize) -> Vec<PathRange> {
    let target_count = target_count.max(1);
    if entries.len() <= 1 || target_count == 1 {
        return vec![PathRange::full()];
    }
    let total: u64 = entries.iter().map(|(_, s)| (*s).max(1)).sum();
    let budget = total.div_ceil(target_count as u64);

    let mut bounds: Vec<String> = Vec::new();
    let mut acc: u64 = 0;
    for (i, (path, size)) in entries.iter().enumerate() {
        acc += (*size).max(1);
        // Never cut after the final entry, that shard would be empty.
        if acc >= budget && bounds.len() + 1 < target_count && i + 1 < entries.len() {
            bounds.push(next_path(path));
            acc = 0;
        }
    }

    let mut shards = Vec::with_capacity(bounds.len() + 1);
    let mut lower: Option<String> = None;
    for bound in bounds {
        shards.push(PathRange {
            lower: lower.clone(),
            upper: Some(bound.clone()),
        });
        lower = Some(bound);
    }
    shards.push(PathRange { lower, upper: None });
    shards
}

/// Shards one serialized index stream by referenced-byte size.
pub async fn compute_shards(
    storage: &ChunkStorage,
    refs: Vec<DataRef>,
    target_count: usize,
) -> Result<Vec<PathRange>> {
    let mut reader = Reader::new(storage, refs);
    let mut entries = Vec::new();
    while let Some(entry) = reader.next().await? {
        let size = entry.size_bytes();
        entries.push((entry.path, size));
    }
    Ok(shard_by_size(&entries, target_count))
}

/// Smallest path strictly greater than `path`, used as an exclusive shard
/// boundary that still includes `path` in the preceding shard.
fn next_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push_str(path);
    out.push('\0');
    out
}

#[cfg(test)]
mod tests {
    use sediment_chunk::{MemObjClient, ObjClient};
    use sediment_common::config::ChunkConfig;
    use std::sync::Arc;

    use super::super::writer::Writer;
    use super::super::{IndexEntry, TagRef};
    use super::*;

    fn storage() -> ChunkStorage {
        let client: Arc<dyn ObjClient> = MemObjClient::shared();
        ChunkStorage::new(client, &ChunkConfig::default())
    }

    fn entry(path: &str, size: u64) -> IndexEntry {
        IndexEntry::additive(
            path,
            vec![TagRef {
                tag: "default".to_string(),
                data_refs: vec![DataRef {
                    chunk: sediment_common::content_hash(path.as_bytes()),
                    offset: 0,
                    length: size,
                    hash: None,
                }],
            }],
        )
    }

    fn sized(entries: &[(&str, u64)]) -> Vec<(String, u64)> {
        entries
            .iter()
            .map(|(p, s)| ((*p).to_string(), *s))
            .collect()
    }

    fn assert_tiling(shards: &[PathRange]) {
        assert!(shards[0].lower.is_none());
        assert!(shards[shards.len() - 1].upper.is_none());
        for pair in shards.windows(2) {
            assert_eq!(pair[0].upper, pair[1].lower);
        }
    }

    #[test]
    fn test_empty_input_is_one_shard() {
        assert_eq!(shard_by_size(&[], 8), vec![PathRange::full()]);
    }

    #[test]
    fn test_splits_evenly_by_size() {
        let shards = shard_by_size(&sized(&[("a", 100), ("b", 100), ("c", 100), ("d", 100)]), 2);
        assert_eq!(shards.len(), 2);
        assert_tiling(&shards);
        // "b" falls in the first shard, "c" in the second.
        assert!(shards[0].contains("b"));
        assert!(shards[1].contains("c"));
    }

    #[test]
    fn test_never_exceeds_entry_count() {
        let shards = shard_by_size(&sized(&[("a", 1), ("b", 1), ("c", 1)]), 16);
        assert!(shards.len() <= 3);
        assert_tiling(&shards);
    }

    #[test]
    fn test_boundary_includes_cut_entry() {
        let shards = shard_by_size(&sized(&[("a", 1000), ("b", 1)]), 2);
        assert_eq!(shards.len(), 2);
        assert!(shards[0].contains("a"));
        assert!(shards[1].contains("b"));
    }

    #[tokio::test]
    async fn test_shards_serialized_stream() {
        let storage = storage();
        let mut w = Writer::new(&storage);
        for (path, size) in [("a", 100u64), ("b", 100), ("c", 100), ("d", 100)] {
            w.append(&entry(path, size)).await.unwrap();
        }
        let (refs, _) = w.close().await.unwrap();
        let shards = compute_shards(&storage, refs, 2).await.unwrap();
        assert_eq!(shards.len(), 2);
        assert_tiling(&shards);
    }
}
