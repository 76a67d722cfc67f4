//! Database control surface used by backup and restore.
//!
//! [`DatabaseControl`] is everything the orchestrator needs from the server:
//! enumeration, freezing, schema application and part attachment.
//! [`control::ClickhouseControl`] implements it over the HTTP interface and the
//! local data directory.

pub mod control;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::utils::errors::Result;

pub use control::ClickhouseControl;

/// Part produced by a freeze, read from the shadow directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezedPart {
    pub database: String,
    pub table: String,
    pub name: String,
    /// Directory holding the frozen files
    pub path: PathBuf,
    /// sha256 of `checksums.txt`
    pub checksum: String,
    pub size: u64,
    /// Relative file names, sorted
    pub files: Vec<String>,
}

/// Row of `system.parts` for an active part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePart {
    pub name: String,
    pub rows: u64,
}

#[async_trait]
pub trait DatabaseControl: Send + Sync {
    /// Databases on the server, minus `exclude`
    async fn list_databases(&self, exclude: &[String]) -> Result<Vec<String>>;

    /// MergeTree tables of `database`, least recently modified first.
    /// An empty `filter` selects every table.
    async fn list_tables_ordered(&self, database: &str, filter: &[String]) -> Result<Vec<String>>;

    /// Stored `ATTACH DATABASE` statement
    async fn database_schema(&self, database: &str) -> Result<String>;

    /// Stored `ATTACH TABLE` statement
    async fn table_schema(&self, database: &str, table: &str) -> Result<String>;

    async fn list_active_parts(&self, database: &str, table: &str) -> Result<Vec<ActivePart>>;

    /// Freeze a table and describe every part the freeze produced
    async fn freeze_table(&self, database: &str, table: &str) -> Result<Vec<FreezedPart>>;

    /// Remove everything from the shadow directory
    async fn clear_shadow(&self) -> Result<()>;

    async fn apply_schema(&self, sql: &str) -> Result<()>;

    async fn attach_part(&self, database: &str, table: &str, part: &str) -> Result<()>;

    /// Hand `path` and its contents to the server's owner
    async fn fix_ownership(&self, path: &Path) -> Result<()>;

    /// Directory the server attaches parts from
    fn detached_table_path(&self, database: &str, table: &str) -> PathBuf;

    fn detached_part_path(&self, database: &str, table: &str, part: &str) -> PathBuf {
        self.detached_table_path(database, table).join(part)
    }

    /// Ids of local access entities
    async fn list_access_control_objects(&self) -> Result<Vec<String>>;

    fn access_control_path(&self) -> PathBuf;
}

/// Percent-encode a database or table name the way the server names its directories.
pub fn escape_identifier(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'~' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}

/// Turn a stored `ATTACH DATABASE` statement into an applicable `CREATE`.
pub fn rewrite_database_schema(sql: &str) -> String {
    sql.replacen("ATTACH ", "CREATE ", 1)
}

/// Turn a stored `ATTACH <kind> name` statement into `CREATE <kind> `db`.name`.
pub fn rewrite_table_schema(database: &str, sql: &str) -> String {
    const KINDS: [&str; 5] = [
        "TABLE",
        "VIEW",
        "MATERIALIZED VIEW",
        "LIVE VIEW",
        "DICTIONARY",
    ];

    let trimmed = sql.trim_start();
    for kind in KINDS {
        let prefix = format!("ATTACH {} ", kind);
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            return format!("CREATE {} `{}`.{}", kind, database, rest);
        }
    }
    sql.replacen("ATTACH ", "CREATE ", 1)
}
