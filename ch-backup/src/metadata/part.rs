use serde::{Deserialize, Serialize};

use crate::clickhouse::FreezedPart;

fn default_disk_name() -> String {
    "default".to_string()
}

/// One data part recorded in a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMetadata {
    /// Owning database; implied by the document tree
    #[serde(skip)]
    pub database: String,

    /// Owning table; implied by the document tree
    #[serde(skip)]
    pub table: String,

    pub name: String,

    /// sha256 of the part's `checksums.txt`
    pub checksum: String,

    #[serde(rename = "bytes")]
    pub size: u64,

    /// Member file names, relative to the part directory, sorted
    pub files: Vec<String>,

    /// Files are packed into a single `<part>.tar` object
    #[serde(default)]
    pub tarball: bool,

    /// Path of the backup that physically stores this part's bytes
    #[serde(default)]
    pub link: Option<String>,

    #[serde(default = "default_disk_name")]
    pub disk_name: String,
}

impl PartMetadata {
    pub fn from_freezed_part(part: &FreezedPart, tarball: bool) -> Self {
        Self {
            database: part.database.clone(),
            table: part.table.clone(),
            name: part.name.clone(),
            checksum: part.checksum.clone(),
            size: part.size,
            files: part.files.clone(),
            tarball,
            link: None,
            disk_name: default_disk_name(),
        }
    }

    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    /// Byte-identical content as far as the recorded manifest can tell.
    pub fn same_content(&self, other: &PartMetadata) -> bool {
        self.checksum == other.checksum && self.size == other.size && self.files == other.files
    }
}
