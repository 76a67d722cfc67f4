//! Persisted description of a backup run.
//!
//! One JSON document per backup (`backup_struct.json`) records the
//! database -> table -> part tree, schema pointers and aggregate counters.
//! Unknown fields are ignored on load so older binaries can read newer documents.

mod backup;
mod part;

pub use backup::{BackupMetadata, DatabaseMetadata, TableMetadata};
pub use part::PartMetadata;
