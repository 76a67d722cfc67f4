//! [`DatabaseControl`] over the ClickHouse HTTP interface and data directory.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{escape_identifier, ActivePart, DatabaseControl, FreezedPart};
use crate::config::ClickhouseConfig;
use crate::utils::errors::{BackupError, Result};

const ACCESS_ENTITY_TABLES: [&str; 5] = [
    "users",
    "roles",
    "quotas",
    "row_policies",
    "settings_profiles",
];

#[derive(Deserialize)]
struct JsonResponse<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct NameRow {
    name: String,
}

#[derive(Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Deserialize)]
struct PartRow {
    name: String,
    rows: u64,
}

pub struct ClickhouseControl {
    config: ClickhouseConfig,
    client: reqwest::Client,
    url: String,
}

/// `'...'` literal with backslash escaping
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// `` `...` `` identifier with backslash escaping
fn quote_name(value: &str) -> String {
    format!("`{}`", value.replace('\\', "\\\\").replace('`', "\\`"))
}

impl ClickhouseControl {
    pub fn new(config: &ClickhouseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            url: format!("{}://{}:{}/", config.protocol, config.host, config.port),
            config: config.clone(),
            client,
        })
    }

    fn shadow_path(&self) -> PathBuf {
        self.config.data_path.join("shadow")
    }

    async fn query(&self, sql: &str) -> Result<String> {
        debug!(sql, "Executing query");
        let mut request = self
            .client
            .post(&self.url)
            .query(&[("output_format_json_quote_64bit_integers", "0")])
            .body(sql.to_string());

        if let Some(user) = &self.config.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.config.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackupError::Query {
                status: status.as_u16(),
                message: body.trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn query_rows<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let body = self.query(&format!("{} FORMAT JSON", sql)).await?;
        let response: JsonResponse<T> = serde_json::from_str(&body)?;
        Ok(response.data)
    }

    async fn read_schema_file(&self, entity: String, path: PathBuf) -> Result<String> {
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BackupError::Schema {
                entity,
                reason: format!("{}: {}", path.display(), e),
            })
    }

    fn ensure_inside_data_path(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.config.data_path) {
            Ok(())
        } else {
            Err(BackupError::PermissionDenied(format!(
                "{} is outside of the ClickHouse data path",
                path.display()
            )))
        }
    }
}

/// Describe every part directory below a frozen table directory.
fn scan_freezed_parts(database: &str, table: &str, table_path: &Path) -> Result<Vec<FreezedPart>> {
    let mut parts = Vec::new();
    if !table_path.exists() {
        return Ok(parts);
    }

    for entry in std::fs::read_dir(table_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let part_path = entry.path();

        let mut files = Vec::new();
        let mut size = 0u64;
        for file in WalkDir::new(&part_path) {
            let file = file.map_err(std::io::Error::from)?;
            if !file.file_type().is_file() {
                continue;
            }
            size += file.metadata().map_err(std::io::Error::from)?.len();
            if let Ok(relative) = file.path().strip_prefix(&part_path) {
                files.push(relative.to_string_lossy().into_owned());
            }
        }
        files.sort();

        let checksums = std::fs::read(part_path.join("checksums.txt"))?;
        parts.push(FreezedPart {
            database: database.to_string(),
            table: table.to_string(),
            name: entry.file_name().to_string_lossy().into_owned(),
            path: part_path,
            checksum: format!("{:x}", Sha256::digest(&checksums)),
            size,
            files,
        });
    }

    parts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(parts)
}

fn chown_recursive(path: &Path, user: &str, group: &str) -> Result<()> {
    let uid = nix::unistd::User::from_name(user)
        .map_err(std::io::Error::from)?
        .ok_or_else(|| BackupError::Config(format!("Unknown user: {}", user)))?
        .uid;
    let gid = nix::unistd::Group::from_name(group)
        .map_err(std::io::Error::from)?
        .ok_or_else(|| BackupError::Config(format!("Unknown group: {}", group)))?
        .gid;

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        nix::unistd::chown(entry.path(), Some(uid), Some(gid)).map_err(std::io::Error::from)?;
    }
    Ok(())
}

#[async_trait]
impl DatabaseControl for ClickhouseControl {
    async fn list_databases(&self, exclude: &[String]) -> Result<Vec<String>> {
        let rows: Vec<NameRow> = self.query_rows("SHOW DATABASES").await?;
        Ok(rows
            .into_iter()
            .map(|r| r.name)
            .filter(|name| !exclude.contains(name))
            .collect())
    }

    async fn list_tables_ordered(&self, database: &str, filter: &[String]) -> Result<Vec<String>> {
        let mut sql = format!(
            "SELECT name FROM system.tables WHERE engine LIKE '%MergeTree%' AND database = {}",
            quote_literal(database)
        );
        if !filter.is_empty() {
            let names: Vec<String> = filter.iter().map(|t| quote_literal(t)).collect();
            sql.push_str(&format!(" AND name IN ({})", names.join(", ")));
        }
        sql.push_str(" ORDER BY metadata_modification_time");

        let rows: Vec<NameRow> = self.query_rows(&sql).await?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    async fn database_schema(&self, database: &str) -> Result<String> {
        let path = self
            .config
            .data_path
            .join("metadata")
            .join(format!("{}.sql", escape_identifier(database)));
        self.read_schema_file(database.to_string(), path).await
    }

    async fn table_schema(&self, database: &str, table: &str) -> Result<String> {
        let path = self
            .config
            .data_path
            .join("metadata")
            .join(escape_identifier(database))
            .join(format!("{}.sql", escape_identifier(table)));
        self.read_schema_file(format!("{}.{}", database, table), path).await
    }

    async fn list_active_parts(&self, database: &str, table: &str) -> Result<Vec<ActivePart>> {
        let sql = format!(
            "SELECT name, rows FROM system.parts \
             WHERE active AND database = {} AND table = {}",
            quote_literal(database),
            quote_literal(table)
        );
        let rows: Vec<PartRow> = self.query_rows(&sql).await?;
        Ok(rows
            .into_iter()
            .map(|r| ActivePart {
                name: r.name,
                rows: r.rows,
            })
            .collect())
    }

    async fn freeze_table(&self, database: &str, table: &str) -> Result<Vec<FreezedPart>> {
        let freeze = |reason: String| BackupError::Freeze {
            database: database.to_string(),
            table: table.to_string(),
            reason,
        };

        self.query(&format!("ALTER TABLE {}.{} FREEZE", quote_name(database), quote_name(table)))
            .await
            .map_err(|e| freeze(e.to_string()))?;

        let increment = tokio::fs::read_to_string(self.shadow_path().join("increment.txt"))
            .await
            .map_err(|e| freeze(format!("cannot read shadow increment: {}", e)))?;

        let table_path = self
            .shadow_path()
            .join(increment.trim())
            .join("data")
            .join(escape_identifier(database))
            .join(escape_identifier(table));

        let (db, tbl) = (database.to_string(), table.to_string());
        let parts = tokio::task::spawn_blocking(move || scan_freezed_parts(&db, &tbl, &table_path))
            .await?
            .map_err(|e| freeze(e.to_string()))?;

        info!(database, table, parts = parts.len(), "Table frozen");
        Ok(parts)
    }

    async fn clear_shadow(&self) -> Result<()> {
        let shadow = self.shadow_path();
        self.ensure_inside_data_path(&shadow)?;
        debug!(path = %shadow.display(), "Removing shadow data");
        match tokio::fs::remove_dir_all(&shadow).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_schema(&self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    async fn attach_part(&self, database: &str, table: &str, part: &str) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {}.{} ATTACH PART {}",
            quote_name(database),
            quote_name(table),
            quote_literal(part)
        );
        self.query(&sql).await.map(|_| ())
    }

    async fn fix_ownership(&self, path: &Path) -> Result<()> {
        self.ensure_inside_data_path(path)?;
        let path = path.to_path_buf();
        let user = self.config.owner_user.clone();
        let group = self.config.owner_group.clone();
        tokio::task::spawn_blocking(move || chown_recursive(&path, &user, &group)).await?
    }

    fn detached_table_path(&self, database: &str, table: &str) -> PathBuf {
        self.config
            .data_path
            .join("data")
            .join(escape_identifier(database))
            .join(escape_identifier(table))
            .join("detached")
    }

    async fn list_access_control_objects(&self) -> Result<Vec<String>> {
        let sql = ACCESS_ENTITY_TABLES
            .iter()
            .map(|t| format!("SELECT toString(id) AS id FROM system.{} WHERE storage = 'local_directory'", t))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let rows: Vec<IdRow> = self.query_rows(&sql).await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    fn access_control_path(&self) -> PathBuf {
        self.config.access_control_path.clone()
    }
}
