//! Streaming decoder for sorted index entries.

use bytes::{Buf, BytesMut};
use sediment_chunk::{ChunkReader, ChunkStorage, DataRef};
use sediment_common::{Error, PathRange, Result};

use super::IndexEntry;

/// Reads length-delimited index entries from chunk storage, optionally
/// restricted to a path prefix or half-open path range.
///
/// Entries come back in path order. A stream whose paths regress is
/// rejected with [`Error::MalformedIndex`].
pub struct Reader {
    chunks: ChunkReader,
    buf: BytesMut,
    prefix: Option<String>,
    range: PathRange,
    last_path: Option<String>,
    done: bool,
}

impl Reader {
    pub fn new(storage: &ChunkStorage, refs: Vec<DataRef>) -> Self {
        Self {
            chunks: storage.reader(refs),
            buf: BytesMut::new(),
            prefix: None,
            range: PathRange::full(),
            last_path: None,
            done: false,
        }
    }

    /// Restricts the stream to entries whose path starts with `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Restricts the stream to entries whose path falls inside `range`.
    #[must_use]
    pub fn with_range(mut self, range: PathRange) -> Self {
        self.range = range;
        self
    }

    /// Returns the next matching entry, or `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<IndexEntry>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(entry) = self.next_raw().await? else {
                self.done = true;
                return Ok(None);
            };
            if let Some(last) = &self.last_path
                && entry.path <= *last
            {
                return Err(Error::MalformedIndex(format!(
                    "index paths out of order: {last:?} followed by {:?}",
                    entry.path
                )));
            }
            self.last_path = Some(entry.path.clone());
            if self.range.past_upper(&entry.path) {
                // Entries are sorted, nothing later can match.
                self.done = true;
                return Ok(None);
            }
            if !self.range.contains(&entry.path) {
                continue;
            }
            if let Some(prefix) = &self.prefix
                && !entry.path.starts_with(prefix.as_str())
            {
                continue;
            }
            return Ok(Some(entry));
        }
    }

    /// Decodes one frame, refilling the buffer from chunk storage as needed.
    async fn next_raw(&mut self) -> Result<Option<IndexEntry>> {
        loop {
            if let Some(entry) = self.try_decode()? {
                return Ok(Some(entry));
            }
            match self.chunks.next().await? {
                Some(data) => self.buf.extend_from_slice(&data),
                None => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::MalformedIndex(format!(
                        "truncated index frame, {} bytes left",
                        self.buf.len()
                    )));
                }
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<IndexEntry>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let frame = self.buf.split_to(len);
        let entry: IndexEntry = bincode::deserialize(&frame)
            .map_err(|e| Error::MalformedIndex(format!("undecodable index entry: {e}")))?;
        Ok(Some(entry))
    }

    /// Drains the stream into a vector. Intended for tests and small indexes.
    pub async fn collect(mut self) -> Result<Vec<IndexEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
