use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PartMetadata;
use crate::utils::errors::{BackupError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,

    /// Storage path of the table's schema; set once all its parts are stored
    #[serde(default)]
    pub sql_path: Option<String>,

    #[serde(default)]
    pub parts: Vec<PartMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,

    #[serde(default)]
    pub sql_path: Option<String>,

    #[serde(default)]
    pub tables: Vec<TableMetadata>,
}

impl DatabaseMetadata {
    pub fn table(&self, name: &str) -> Option<&TableMetadata> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn table_mut(&mut self, name: &str) -> &mut TableMetadata {
        let idx = match self.tables.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None => {
                self.tables.push(TableMetadata {
                    name: name.to_string(),
                    sql_path: None,
                    parts: Vec::new(),
                });
                self.tables.len() - 1
            }
        };
        &mut self.tables[idx]
    }
}

/// Backup metadata document.
///
/// `end_time` stays unset until every requested database has been processed;
/// a document without it describes an unusable backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub name: String,

    /// Storage-relative root of the backup
    pub path: String,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub rows: u64,

    #[serde(default)]
    pub bytes: u64,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Version of the tool that produced the document
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub databases: Vec<DatabaseMetadata>,

    /// Ids of the access entities stored with the backup
    #[serde(default)]
    pub access_control: Vec<String>,
}

impl BackupMetadata {
    pub fn new(name: &str, path: &str, hostname: &str, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            start_time: Some(Utc::now()),
            end_time: None,
            rows: 0,
            bytes: 0,
            hostname: hostname.to_string(),
            labels,
            version: env!("CARGO_PKG_VERSION").to_string(),
            databases: Vec::new(),
            access_control: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    /// Stamp the end of the run. Later calls keep the first stamp.
    pub fn mark_end(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseMetadata> {
        self.databases.iter().find(|d| d.name == name)
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.name.clone()).collect()
    }

    fn database_mut(&mut self, name: &str) -> &mut DatabaseMetadata {
        let idx = match self.databases.iter().position(|d| d.name == name) {
            Some(idx) => idx,
            None => {
                self.databases.push(DatabaseMetadata {
                    name: name.to_string(),
                    sql_path: None,
                    tables: Vec::new(),
                });
                self.databases.len() - 1
            }
        };
        &mut self.databases[idx]
    }

    pub fn add_database(&mut self, database: &str) {
        self.database_mut(database);
    }

    pub fn add_table(&mut self, database: &str, table: &str) {
        self.database_mut(database).table_mut(table);
    }

    pub fn set_database_sql_path(&mut self, database: &str, sql_path: &str) {
        self.database_mut(database).sql_path = Some(sql_path.to_string());
    }

    pub fn set_table_sql_path(&mut self, database: &str, table: &str, sql_path: &str) {
        self.database_mut(database).table_mut(table).sql_path = Some(sql_path.to_string());
    }

    /// Record a part under its database and table and count its bytes.
    pub fn add_part(&mut self, part: PartMetadata) {
        self.bytes += part.size;
        let database = part.database.clone();
        let table = part.table.clone();
        self.database_mut(&database).table_mut(&table).parts.push(part);
    }

    pub fn add_rows(&mut self, rows: u64) {
        self.rows += rows;
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartMetadata> {
        self.databases
            .iter()
            .flat_map(|d| d.tables.iter())
            .flat_map(|t| t.parts.iter())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode a stored document; `path` names it in decode errors.
    pub fn from_json(data: &[u8], path: &str) -> Result<Self> {
        let mut meta: BackupMetadata =
            serde_json::from_slice(data).map_err(|source| BackupError::MetadataDecode {
                path: path.to_string(),
                source,
            })?;

        for database in &mut meta.databases {
            for table in &mut database.tables {
                for part in &mut table.parts {
                    part.database = database.name.clone();
                    part.table = table.name.clone();
                }
            }
        }
        Ok(meta)
    }
}
