//! redb table definitions
//!
//! Keys are string IDs; values are bincode-encoded records.

use redb::TableDefinition;

/// FileSetId -> bincode(FileSetRecord)
pub const FILESETS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("filesets");

/// tracker id -> bincode(TrackerRecord)
pub const TRACKER_OBJECTS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("tracker_objects");

/// "{to}\0{from}" -> [] ; reverse index, range-scanned by `{to}\0` prefix
/// to find the records referencing `to`
pub const TRACKER_REFS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("tracker_refs");
