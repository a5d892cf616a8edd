//! Layered merge of primitive index streams.
//!
//! Layers are ordered oldest to newest. For each path the merge applies
//! every layer's deletive entry before its additive entry, so a newer
//! layer can tombstone content from older layers and re-add its own in
//! the same step. The merged output carries both a resolved additive
//! entry and the union of tombstones, which lets a compacted layer sit
//! correctly above bases that were not part of the merge.

use std::collections::BTreeMap;

use sediment_chunk::ChunkStorage;
use sediment_common::{PathRange, Result};
use sediment_meta::Primitive;

use crate::index::{IndexEntry, Reader, TagRef};

/// The resolved state of one path across all merged layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub path: String,
    /// Surviving content, tags in ascending name order. `None` when every
    /// tag was tombstoned.
    pub additive: Option<IndexEntry>,
    /// Union of the layers' tombstones for this path, `None` when no layer
    /// deleted anything here.
    pub deletive: Option<IndexEntry>,
}

/// An index reader with one entry of lookahead.
struct PeekReader {
    reader: Reader,
    peeked: Option<IndexEntry>,
}

impl PeekReader {
    fn new(reader: Reader) -> Self {
        Self {
            reader,
            peeked: None,
        }
    }

    async fn peek(&mut self) -> Result<Option<&IndexEntry>> {
        if self.peeked.is_none() {
            self.peeked = self.reader.next().await?;
        }
        Ok(self.peeked.as_ref())
    }

    async fn next_if_path(&mut self, path: &str) -> Result<Option<IndexEntry>> {
        match self.peek().await? {
            Some(entry) if entry.path == path => Ok(self.peeked.take()),
            _ => Ok(None),
        }
    }
}

struct LayerCursor {
    additive: PeekReader,
    deletive: PeekReader,
}

/// Merges the index streams of a stack of primitive layers, yielding one
/// [`Merged`] record per distinct path in ascending path order.
pub struct MergeIterator {
    /// Oldest layer first.
    layers: Vec<LayerCursor>,
}

impl MergeIterator {
    pub fn new(storage: &ChunkStorage, layers: &[Primitive], range: &PathRange) -> Self {
        let layers = layers
            .iter()
            .map(|layer| LayerCursor {
                additive: PeekReader::new(
                    Reader::new(storage, layer.additive.clone()).with_range(range.clone()),
                ),
                deletive: PeekReader::new(
                    Reader::new(storage, layer.deletive.clone()).with_range(range.clone()),
                ),
            })
            .collect();
        Self { layers }
    }

    /// Returns the next merged path, or `None` when every layer is drained.
    pub async fn next(&mut self) -> Result<Option<Merged>> {
        let Some(path) = self.min_path().await? else {
            return Ok(None);
        };

        let mut tags: BTreeMap<String, TagRef> = BTreeMap::new();
        let mut whole_path_delete = false;
        let mut tombstoned: BTreeMap<String, ()> = BTreeMap::new();

        for layer in &mut self.layers {
            if let Some(del) = layer.deletive.next_if_path(&path).await? {
                if del.deletes_whole_path() {
                    tags.clear();
                    whole_path_delete = true;
                    tombstoned.clear();
                } else {
                    for tag in &del.tags {
                        tags.remove(&tag.tag);
                        if !whole_path_delete {
                            tombstoned.insert(tag.tag.clone(), ());
                        }
                    }
                }
            }
            if let Some(add) = layer.additive.next_if_path(&path).await? {
                for tag in add.tags {
                    tags.insert(tag.tag.clone(), tag);
                }
            }
        }

        let additive = if tags.is_empty() {
            None
        } else {
            Some(IndexEntry::additive(
                path.clone(),
                tags.into_values().collect(),
            ))
        };
        let deletive = if whole_path_delete {
            Some(IndexEntry::deletive(path.clone(), Vec::new()))
        } else if tombstoned.is_empty() {
            None
        } else {
            Some(IndexEntry::deletive(
                path.clone(),
                tombstoned.into_keys().collect(),
            ))
        };
        Ok(Some(Merged {
            path,
            additive,
            deletive,
        }))
    }

    /// Smallest path visible at the head of any stream.
    async fn min_path(&mut self) -> Result<Option<String>> {
        let mut min: Option<String> = None;
        for layer in &mut self.layers {
            for head in [
                layer.additive.peek().await?,
                layer.deletive.peek().await?,
            ] {
                if let Some(entry) = head
                    && min.as_deref().is_none_or(|m| entry.path.as_str() < m)
                {
                    min = Some(entry.path.clone());
                }
            }
        }
        Ok(min)
    }
}
