//! Shared fixtures: an in-process database control serving parts from a temp dir.

#![allow(dead_code)]

use async_trait::async_trait;
use ch_backup::clickhouse::{escape_identifier, ActivePart, DatabaseControl, FreezedPart};
use ch_backup::config::{Config, StorageType};
use ch_backup::storage::{create_engine, BackupLayout};
use ch_backup::utils::errors::{BackupError, Result};
use ch_backup::ClickhouseBackup;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct FakePart {
    pub name: String,
    pub checksum: String,
    pub rows: u64,
    pub files: Vec<(String, Vec<u8>)>,
}

impl FakePart {
    pub fn new(name: &str, checksum: &str, rows: u64, files: &[(&str, &[u8])]) -> Self {
        Self {
            name: name.to_string(),
            checksum: checksum.to_string(),
            rows,
            files: files
                .iter()
                .map(|(f, data)| (f.to_string(), data.to_vec()))
                .collect(),
        }
    }

    pub fn size(&self) -> u64 {
        self.files.iter().map(|(_, d)| d.len() as u64).sum()
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<(String, String), Vec<FakePart>>,
    fail_freeze: Option<(String, String)>,
    /// Frozen parts whose files vanish before they can be uploaded
    lost_parts: Vec<(String, String, String)>,
    applied_schemas: Vec<String>,
    attached: Vec<(String, String, String)>,
    owned: Vec<PathBuf>,
}

pub struct FakeControl {
    dir: TempDir,
    state: Mutex<State>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn set_parts(&self, database: &str, table: &str, parts: Vec<FakePart>) {
        self.state
            .lock()
            .unwrap()
            .tables
            .insert((database.to_string(), table.to_string()), parts);
    }

    pub fn fail_freeze(&self, database: &str, table: &str) {
        self.state.lock().unwrap().fail_freeze = Some((database.to_string(), table.to_string()));
    }

    pub fn lose_frozen_part(&self, database: &str, table: &str, part: &str) {
        self.state
            .lock()
            .unwrap()
            .lost_parts
            .push((database.to_string(), table.to_string(), part.to_string()));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_freeze = None;
        state.lost_parts.clear();
    }

    pub fn applied_schemas(&self) -> Vec<String> {
        self.state.lock().unwrap().applied_schemas.clone()
    }

    pub fn attached(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().attached.clone()
    }

    pub fn owned(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().owned.clone()
    }

    fn shadow(&self) -> PathBuf {
        self.root().join("shadow")
    }
}

#[async_trait]
impl DatabaseControl for FakeControl {
    async fn list_databases(&self, exclude: &[String]) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .tables
            .keys()
            .map(|(db, _)| db.clone())
            .filter(|db| !exclude.contains(db))
            .collect();
        names.dedup();
        Ok(names)
    }

    async fn list_tables_ordered(&self, database: &str, filter: &[String]) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .keys()
            .filter(|(db, table)| db == database && (filter.is_empty() || filter.contains(table)))
            .map(|(_, table)| table.clone())
            .collect())
    }

    async fn database_schema(&self, database: &str) -> Result<String> {
        Ok(format!("ATTACH DATABASE {}\nENGINE = Ordinary", database))
    }

    async fn table_schema(&self, _database: &str, table: &str) -> Result<String> {
        Ok(format!(
            "ATTACH TABLE {}\n(\n    `n` UInt32\n)\nENGINE = MergeTree\nORDER BY n",
            table
        ))
    }

    async fn list_active_parts(&self, database: &str, table: &str) -> Result<Vec<ActivePart>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .get(&(database.to_string(), table.to_string()))
            .map(|parts| {
                parts
                    .iter()
                    .map(|p| ActivePart {
                        name: p.name.clone(),
                        rows: p.rows,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn freeze_table(&self, database: &str, table: &str) -> Result<Vec<FreezedPart>> {
        let state = self.state.lock().unwrap();
        if state.fail_freeze == Some((database.to_string(), table.to_string())) {
            return Err(BackupError::Freeze {
                database: database.to_string(),
                table: table.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let table_dir = self
            .shadow()
            .join("1/data")
            .join(escape_identifier(database))
            .join(escape_identifier(table));
        let parts = state
            .tables
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default();

        let mut freezed = Vec::new();
        for part in parts {
            let path = table_dir.join(&part.name);
            for (file, data) in &part.files {
                let file_path = path.join(file);
                if let Some(parent) = file_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(file_path, data)?;
            }
            let key = (database.to_string(), table.to_string(), part.name.clone());
            if state.lost_parts.contains(&key) {
                std::fs::remove_dir_all(&path)?;
            }
            let mut files: Vec<String> = part.files.iter().map(|(f, _)| f.clone()).collect();
            files.sort();
            freezed.push(FreezedPart {
                database: database.to_string(),
                table: table.to_string(),
                name: part.name.clone(),
                path,
                checksum: part.checksum.clone(),
                size: part.size(),
                files,
            });
        }
        Ok(freezed)
    }

    async fn clear_shadow(&self) -> Result<()> {
        match std::fs::remove_dir_all(self.shadow()) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn apply_schema(&self, sql: &str) -> Result<()> {
        self.state.lock().unwrap().applied_schemas.push(sql.to_string());
        Ok(())
    }

    async fn attach_part(&self, database: &str, table: &str, part: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state
            .applied_schemas
            .iter()
            .any(|s| s.starts_with(&format!("CREATE TABLE `{}`.{}", database, table)))
        {
            return Err(BackupError::Query {
                status: 404,
                message: format!("Table {}.{} doesn't exist", database, table),
            });
        }
        state
            .attached
            .push((database.to_string(), table.to_string(), part.to_string()));
        Ok(())
    }

    async fn fix_ownership(&self, path: &Path) -> Result<()> {
        self.state.lock().unwrap().owned.push(path.to_path_buf());
        Ok(())
    }

    fn detached_table_path(&self, database: &str, table: &str) -> PathBuf {
        self.root()
            .join("data")
            .join(escape_identifier(database))
            .join(escape_identifier(table))
            .join("detached")
    }

    async fn list_access_control_objects(&self) -> Result<Vec<String>> {
        let dir = self.access_control_path();
        let mut ids = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if let Some(id) = name.strip_suffix(".sql") {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn access_control_path(&self) -> PathBuf {
        self.root().join("access")
    }
}

pub fn test_config(path_root: &str, tarball_parts: bool) -> Config {
    let mut config = Config::default();
    config.backup.path_root = path_root.to_string();
    config.backup.exclude_dbs = vec!["system".to_string()];
    config.storage.storage_type = StorageType::Memory;
    config.storage.chunk_size = 64;
    config.storage.tarball_parts = tarball_parts;
    config.storage.retry.initial_interval_ms = 1;
    config.storage.retry.max_interval_ms = 2;
    config.multiprocessing.workers = 2;
    config
}

/// Storage shared by every tool instance of one test
pub fn test_layout(config: &Config) -> BackupLayout {
    let engine = create_engine(&config.storage).unwrap();
    BackupLayout::new(engine, &config.backup.path_root, config.storage.tarball_parts)
}

pub async fn tool(config: &Config, layout: &BackupLayout, control: &Arc<FakeControl>) -> ClickhouseBackup {
    let ch_ctl: Arc<dyn DatabaseControl> = control.clone();
    ClickhouseBackup::new(config.clone(), ch_ctl, layout.clone()).await
}
