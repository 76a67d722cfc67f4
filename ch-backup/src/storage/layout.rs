//! Where backup pieces live in storage, and how they get there.
//!
//! ```text
//! <path_root>/<backup>/backup_struct.json
//! <path_root>/<backup>/metadata/<db>.sql
//! <path_root>/<backup>/metadata/<db>/<table>.sql
//! <path_root>/<backup>/data/<db>/<table>/<part>/<file>    (plain parts)
//! <path_root>/<backup>/data/<db>/<table>/<part>.tar       (tarball parts)
//! <path_root>/<backup>/access_control/<id>.sql
//! ```
//!
//! Database and table names are escaped with [`escape_identifier`]. Part
//! file paths are derived from metadata and never stored.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{DeleteOutcome, StorageEngine};
use crate::clickhouse::{escape_identifier, FreezedPart};
use crate::metadata::{BackupMetadata, PartMetadata};
use crate::utils::errors::{BackupError, Result};

pub const BACKUP_META_FILE: &str = "backup_struct.json";

fn join(base: &str, child: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        child.to_string()
    } else {
        format!("{}/{}", base, child)
    }
}

#[derive(Clone)]
pub struct BackupLayout {
    engine: Arc<dyn StorageEngine>,
    root: String,
    tarball_parts: bool,
}

impl BackupLayout {
    pub fn new(engine: Arc<dyn StorageEngine>, path_root: &str, tarball_parts: bool) -> Self {
        Self {
            engine,
            root: path_root.trim_matches('/').to_string(),
            tarball_parts,
        }
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Whether newly uploaded parts are packed into tarballs
    pub fn tarball_parts(&self) -> bool {
        self.tarball_parts
    }

    pub fn backup_path(&self, name: &str) -> String {
        join(&self.root, name)
    }

    pub fn backup_meta_path(&self, name: &str) -> String {
        join(&self.backup_path(name), BACKUP_META_FILE)
    }

    pub fn database_schema_path(&self, backup_path: &str, database: &str) -> String {
        join(
            backup_path,
            &format!("metadata/{}.sql", escape_identifier(database)),
        )
    }

    pub fn table_schema_path(&self, backup_path: &str, database: &str, table: &str) -> String {
        join(
            backup_path,
            &format!(
                "metadata/{}/{}.sql",
                escape_identifier(database),
                escape_identifier(table)
            ),
        )
    }

    fn part_root(&self, backup_path: &str, database: &str, table: &str, part: &str) -> String {
        join(
            backup_path,
            &format!(
                "data/{}/{}/{}",
                escape_identifier(database),
                escape_identifier(table),
                part
            ),
        )
    }

    /// Every object holding the part's bytes, under the backup that owns them.
    pub fn part_remote_paths(&self, owner_path: &str, part: &PartMetadata) -> Vec<String> {
        let root = self.part_root(owner_path, &part.database, &part.table, &part.name);
        if part.tarball {
            vec![format!("{}.tar", root)]
        } else {
            part.files.iter().map(|f| join(&root, f)).collect()
        }
    }

    pub fn access_control_path(&self, backup_path: &str, id: &str) -> String {
        join(backup_path, &format!("access_control/{}.sql", id))
    }

    pub async fn save_backup_meta(&self, meta: &BackupMetadata) -> Result<()> {
        let path = self.backup_meta_path(&meta.name);
        self.engine
            .upload_data(Bytes::from(meta.to_json()?), &path)
            .await?;
        debug!(path, "Backup metadata saved");
        Ok(())
    }

    pub async fn load_backup_meta(&self, name: &str) -> Result<BackupMetadata> {
        let path = self.backup_meta_path(name);
        let data = match self.engine.download_data(&path).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Err(BackupError::BackupNotFound(name.to_string())),
            Err(e) => return Err(e),
        };
        BackupMetadata::from_json(&data, &path)
    }

    /// Names of every directory below the root, complete or not
    pub async fn list_backup_names(&self) -> Result<Vec<String>> {
        let mut names = self.engine.list_dir(&self.root, false).await?;
        names.retain(|n| !n.is_empty() && !n.contains('/'));
        names.sort();
        Ok(names)
    }

    pub async fn save_database_schema(&self, backup_path: &str, database: &str, sql: &str) -> Result<String> {
        let path = self.database_schema_path(backup_path, database);
        self.engine
            .upload_data(Bytes::from(sql.to_string()), &path)
            .await
    }

    pub async fn save_table_schema(
        &self,
        backup_path: &str,
        database: &str,
        table: &str,
        sql: &str,
    ) -> Result<String> {
        let path = self.table_schema_path(backup_path, database, table);
        self.engine
            .upload_data(Bytes::from(sql.to_string()), &path)
            .await
    }

    pub async fn download_text(&self, remote_path: &str) -> Result<String> {
        let data = self.engine.download_data(remote_path).await?;
        String::from_utf8(data.to_vec())
            .map_err(|e| BackupError::InvalidArgument(format!("{} is not UTF-8: {}", remote_path, e)))
    }

    /// Upload the files of a frozen part, packed or one object per file.
    pub async fn upload_part(&self, backup_path: &str, part: &FreezedPart, tarball: bool) -> Result<()> {
        let root = self.part_root(backup_path, &part.database, &part.table, &part.name);

        if tarball {
            let source = part.path.clone();
            let files = part.files.clone();
            let archive = tokio::task::spawn_blocking(move || pack_part(&source, &files)).await??;
            self.engine
                .upload_file(archive.path(), &format!("{}.tar", root))
                .await?;
        } else {
            for file in &part.files {
                self.engine
                    .upload_file(&part.path.join(file), &join(&root, file))
                    .await?;
            }
        }

        debug!(
            database = %part.database,
            table = %part.table,
            part = %part.name,
            tarball,
            "Part uploaded"
        );
        Ok(())
    }

    /// Download a part into `<target_dir>/<part name>`.
    pub async fn download_part(&self, owner_path: &str, part: &PartMetadata, target_dir: &Path) -> Result<()> {
        let part_dir = target_dir.join(&part.name);
        tokio::fs::create_dir_all(&part_dir).await?;

        if part.tarball {
            let remote = format!(
                "{}.tar",
                self.part_root(owner_path, &part.database, &part.table, &part.name)
            );
            let archive = NamedTempFile::new()?;
            self.engine.download_file(&remote, archive.path()).await?;
            tokio::task::spawn_blocking(move || unpack_part(archive, &part_dir)).await??;
        } else {
            let root = self.part_root(owner_path, &part.database, &part.table, &part.name);
            for file in &part.files {
                self.engine
                    .download_file(&join(&root, file), &part_dir.join(file))
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn upload_access_control_file(&self, backup_path: &str, local_dir: &Path, id: &str) -> Result<()> {
        let local = local_dir.join(format!("{}.sql", id));
        self.engine
            .upload_file(&local, &self.access_control_path(backup_path, id))
            .await?;
        Ok(())
    }

    pub async fn download_access_control_file(&self, backup_path: &str, local_dir: &Path, id: &str) -> Result<PathBuf> {
        let local = local_dir.join(format!("{}.sql", id));
        self.engine
            .download_file(&self.access_control_path(backup_path, id), &local)
            .await?;
        Ok(local)
    }

    /// Full storage paths of every object below a backup
    pub async fn backup_objects(&self, name: &str) -> Result<Vec<String>> {
        let backup_path = self.backup_path(name);
        Ok(self
            .engine
            .list_dir(&backup_path, true)
            .await?
            .iter()
            .map(|relative| join(&backup_path, relative))
            .collect())
    }

    pub async fn delete_objects(&self, paths: &[String]) -> Result<Vec<DeleteOutcome>> {
        self.engine.delete_files(paths).await
    }

    pub async fn delete_backup_meta(&self, name: &str) -> Result<()> {
        match self.engine.delete_file(&self.backup_meta_path(name)).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

fn pack_part(source: &Path, files: &[String]) -> Result<NamedTempFile> {
    let archive = NamedTempFile::new()?;
    let mut builder = tar::Builder::new(archive.as_file());
    for file in files {
        builder.append_path_with_name(source.join(file), file)?;
    }
    builder.into_inner()?;
    Ok(archive)
}

fn unpack_part(archive: NamedTempFile, target: &Path) -> Result<()> {
    let mut reader = tar::Archive::new(archive.reopen()?);
    reader.unpack(target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::ObjectStorageEngine;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn layout(root: &str) -> BackupLayout {
        let config = StorageConfig {
            chunk_size: 16,
            ..StorageConfig::default()
        };
        BackupLayout::new(Arc::new(ObjectStorageEngine::in_memory(&config)), root, true)
    }

    fn frozen_part(dir: &Path) -> Result<FreezedPart> {
        let path = dir.join("all_1_1_0");
        std::fs::create_dir_all(path.join("sub"))?;
        std::fs::write(path.join("checksums.txt"), b"checksums")?;
        std::fs::write(path.join("data.bin"), vec![7u8; 100])?;
        std::fs::write(path.join("sub/extra.bin"), b"extra")?;
        Ok(FreezedPart {
            database: "my.db".to_string(),
            table: "t1".to_string(),
            name: "all_1_1_0".to_string(),
            path,
            checksum: "abc".to_string(),
            size: 114,
            files: vec![
                "checksums.txt".to_string(),
                "data.bin".to_string(),
                "sub/extra.bin".to_string(),
            ],
        })
    }

    #[test]
    fn test_paths() {
        let layout = layout("ch_backup/");
        assert_eq!(layout.backup_path("b1"), "ch_backup/b1");
        assert_eq!(layout.backup_meta_path("b1"), "ch_backup/b1/backup_struct.json");
        assert_eq!(
            layout.table_schema_path("ch_backup/b1", "my.db", "t-1"),
            "ch_backup/b1/metadata/my%2Edb/t%2D1.sql"
        );
        assert_eq!(super::join("", "b1"), "b1");
    }

    #[tokio::test]
    async fn test_part_roundtrip_in_both_modes() -> Result<()> {
        let layout = layout("root");
        let source = TempDir::new()?;
        let part = frozen_part(source.path())?;

        for tarball in [true, false] {
            let backup_path = layout.backup_path(if tarball { "packed" } else { "plain" });
            layout.upload_part(&backup_path, &part, tarball).await?;

            let meta = PartMetadata::from_freezed_part(&part, tarball);
            for remote in layout.part_remote_paths(&backup_path, &meta) {
                assert!(layout.engine().path_exists(&remote).await?, "{}", remote);
            }

            let target = TempDir::new()?;
            layout.download_part(&backup_path, &meta, target.path()).await?;
            let restored = target.path().join("all_1_1_0");
            assert_eq!(std::fs::read(restored.join("data.bin"))?, vec![7u8; 100]);
            assert_eq!(std::fs::read(restored.join("sub/extra.bin"))?, b"extra");
        }

        let packed = PartMetadata::from_freezed_part(&part, true);
        assert_eq!(
            layout.part_remote_paths("root/packed", &packed),
            vec!["root/packed/data/my%2Edb/t1/all_1_1_0.tar"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_meta_save_load_and_listing() -> Result<()> {
        let layout = layout("ch_backup");
        let mut meta = BackupMetadata::new("b1", &layout.backup_path("b1"), "host", BTreeMap::new());
        meta.mark_end();
        layout.save_backup_meta(&meta).await?;
        layout
            .save_database_schema(&meta.path, "db1", "CREATE DATABASE db1")
            .await?;

        assert_eq!(layout.load_backup_meta("b1").await?, meta);
        assert!(matches!(
            layout.load_backup_meta("b2").await,
            Err(BackupError::BackupNotFound(_))
        ));
        assert_eq!(layout.list_backup_names().await?, vec!["b1"]);

        let mut objects = layout.backup_objects("b1").await?;
        objects.sort();
        assert_eq!(
            objects,
            vec!["ch_backup/b1/backup_struct.json", "ch_backup/b1/metadata/db1.sql"]
        );

        layout.delete_backup_meta("b1").await?;
        layout.delete_backup_meta("b1").await?;
        Ok(())
    }
}
