//! Sorted, streamable index over path-addressed entries
//!
//! An index stream is a length-delimited sequence of bincode-encoded
//! `IndexEntry` records, strictly increasing by path, stored as chunks.

pub mod reader;
pub mod shard;
pub mod writer;

pub use reader::Reader;
pub use shard::{compute_shards, shard_by_size};
pub use writer::Writer;

use sediment_chunk::DataRef;
use serde::{Deserialize, Serialize};

/// One named sub-segment of a file's content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub tag: String,
    pub data_refs: Vec<DataRef>,
}

/// One path's state within a layer.
///
/// In a deletive stream, an entry with an empty tag list is a whole-path
/// tombstone; tags name the deleted sub-segments otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub deletive: bool,
    pub tags: Vec<TagRef>,
}

impl IndexEntry {
    /// An additive entry with sorted tags
    #[must_use]
    pub fn additive(path: impl Into<String>, mut tags: Vec<TagRef>) -> Self {
        tags.sort_by(|a, b| a.tag.cmp(&b.tag));
        Self {
            path: path.into(),
            deletive: false,
            tags,
        }
    }

    /// A deletive entry; empty `tags` deletes the whole path
    #[must_use]
    pub fn deletive(path: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            path: path.into(),
            deletive: true,
            tags: tags
                .into_iter()
                .map(|tag| TagRef {
                    tag,
                    data_refs: Vec::new(),
                })
                .collect(),
        }
    }

    /// Whether this is a whole-path tombstone
    #[must_use]
    pub fn deletes_whole_path(&self) -> bool {
        self.deletive && self.tags.is_empty()
    }

    /// Total referenced content bytes
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.data_refs().map(|r| r.length).sum()
    }

    /// Every data ref in tag order
    pub fn data_refs(&self) -> impl Iterator<Item = &DataRef> {
        self.tags.iter().flat_map(|t| t.data_refs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additive_sorts_tags() {
        let entry = IndexEntry::additive(
            "/a",
            vec![
                TagRef {
                    tag: "z".into(),
                    data_refs: Vec::new(),
                },
                TagRef {
                    tag: "a".into(),
                    data_refs: Vec::new(),
                },
            ],
        );
        let tags: Vec<&str> = entry.tags.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "z"]);
    }

    #[test]
    fn test_whole_path_tombstone() {
        assert!(IndexEntry::deletive("/a", Vec::new()).deletes_whole_path());
        assert!(!IndexEntry::deletive("/a", vec!["t".into()]).deletes_whole_path());
        assert!(!IndexEntry::additive("/a", Vec::new()).deletes_whole_path());
    }
}
