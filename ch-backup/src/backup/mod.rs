//! Backup and restore orchestration.
//!
//! Databases and tables are processed one at a time. Parts of one table are
//! transferred concurrently through the [`ExecPool`], and the table's schema
//! pointer is recorded only after all of them have been collected.

mod access;

use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clickhouse::{rewrite_database_schema, rewrite_table_schema, DatabaseControl};
use crate::config::Config;
use crate::dedup::DedupResolver;
use crate::metadata::{BackupMetadata, DatabaseMetadata, PartMetadata, TableMetadata};
use crate::pool::ExecPool;
use crate::storage::BackupLayout;
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_bytes, format_duration};

const BACKUP_NAME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Backup name; derived from the start time when unset
    pub name: Option<String>,
    /// Databases to back up; all but the excluded ones when unset
    pub databases: Option<Vec<String>>,
    /// Ignore the minimum backup interval
    pub force: bool,
    /// Leave out parts whose upload failed instead of failing the run
    pub keep_going: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Databases to restore; everything in the backup when unset
    pub databases: Option<Vec<String>>,
    /// Skip parts whose download failed instead of failing the run
    pub keep_going: bool,
}

pub struct ClickhouseBackup {
    config: Config,
    ch_ctl: Arc<dyn DatabaseControl>,
    layout: BackupLayout,
    pool: ExecPool<String>,
    uploaded_bytes: Arc<AtomicU64>,
}

impl ClickhouseBackup {
    pub async fn new(config: Config, ch_ctl: Arc<dyn DatabaseControl>, layout: BackupLayout) -> Self {
        let pool = ExecPool::new(config.multiprocessing.workers).await;
        Self {
            config,
            ch_ctl,
            layout,
            pool,
            uploaded_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Names of complete backups, newest first
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut backups: Vec<BackupMetadata> = self
            .load_backups(false)
            .await?
            .into_iter()
            .filter(|b| b.is_complete())
            .collect();
        backups.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        Ok(backups.into_iter().map(|b| b.name).collect())
    }

    pub async fn show(&self, name: &str) -> Result<BackupMetadata> {
        self.layout.load_backup_meta(name).await
    }

    /// Load every backup document. Directories without one are skipped;
    /// undecodable documents are fatal when `strict`.
    async fn load_backups(&self, strict: bool) -> Result<Vec<BackupMetadata>> {
        let mut backups = Vec::new();
        for name in self.layout.list_backup_names().await? {
            match self.layout.load_backup_meta(&name).await {
                Ok(meta) => backups.push(meta),
                Err(BackupError::BackupNotFound(_)) => {
                    debug!("Skipping {}: no backup metadata", name);
                }
                Err(e) if !strict && matches!(e, BackupError::MetadataDecode { .. }) => {
                    warn!("Skipping backup {}: {}", name, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(backups)
    }

    pub async fn backup(&self, options: BackupOptions) -> Result<String> {
        let started = Instant::now();
        let now = Utc::now();
        let backups = self.load_backups(self.config.backup.deduplicate_parts).await?;

        if !options.force && self.config.backup.min_interval_minutes > 0 {
            let threshold = now - Duration::minutes(self.config.backup.min_interval_minutes);
            let latest = backups
                .iter()
                .filter(|b| b.end_time.is_some_and(|end| end > threshold))
                .max_by_key(|b| b.end_time);
            if let Some(latest) = latest {
                info!(
                    "Skipping backup: {} finished less than {} minutes ago",
                    latest.name, self.config.backup.min_interval_minutes
                );
                return Ok(latest.name.clone());
            }
        }

        let name = options
            .name
            .unwrap_or_else(|| now.format(BACKUP_NAME_FORMAT).to_string());
        if backups.iter().any(|b| b.name == name) {
            return Err(BackupError::InvalidArgument(format!(
                "Backup {} already exists",
                name
            )));
        }

        let databases = match options.databases {
            Some(databases) => databases,
            None => {
                self.ch_ctl
                    .list_databases(&self.config.backup.exclude_dbs)
                    .await?
            }
        };

        let resolver = if self.config.backup.deduplicate_parts {
            let age_limit = Duration::days(self.config.backup.deduplication_age_limit_days);
            DedupResolver::new(DedupResolver::select_candidates(backups, age_limit, now))
        } else {
            DedupResolver::new(Vec::new())
        };
        if resolver.is_empty() {
            debug!("No deduplication sources, every part will be uploaded");
        }

        let mut meta = BackupMetadata::new(
            &name,
            &self.layout.backup_path(&name),
            &self.config.clickhouse.host,
            self.config.backup.labels.clone(),
        );
        self.layout.save_backup_meta(&meta).await?;
        self.uploaded_bytes.store(0, Ordering::SeqCst);

        info!("Starting backup {} for databases: {}", name, databases.join(", "));

        if let Err(e) = self
            .backup_databases(&mut meta, &databases, &resolver, options.keep_going)
            .await
        {
            error!("Backup {} failed: {}", name, e);
            if !self.config.backup.keep_freezed_data_on_failure {
                if let Err(clear_err) = self.ch_ctl.clear_shadow().await {
                    warn!("Failed to clear shadow data: {}", clear_err);
                }
            }
            return Err(e);
        }

        self.ch_ctl.clear_shadow().await?;
        meta.mark_end();
        self.layout.save_backup_meta(&meta).await?;

        info!(
            "Backup {} completed: {} rows, {} total, {} uploaded in {}",
            name,
            meta.rows,
            format_bytes(meta.bytes),
            format_bytes(self.uploaded_bytes.load(Ordering::SeqCst)),
            format_duration(started.elapsed())
        );
        Ok(name)
    }

    async fn backup_databases(
        &self,
        meta: &mut BackupMetadata,
        databases: &[String],
        resolver: &DedupResolver,
        keep_going: bool,
    ) -> Result<()> {
        for database in databases {
            debug!("Running database backup: {}", database);
            meta.add_database(database);

            let tables = self.ch_ctl.list_tables_ordered(database, &[]).await?;
            for table in &tables {
                self.backup_table(meta, database, table, resolver, keep_going)
                    .await?;
            }

            let sql = rewrite_database_schema(&self.ch_ctl.database_schema(database).await?);
            let sql_path = self
                .layout
                .save_database_schema(&meta.path, database, &sql)
                .await?;
            meta.set_database_sql_path(database, &sql_path);
        }

        if self.config.backup.backup_access_control {
            access::backup_access_control(self.ch_ctl.as_ref(), &self.layout, meta).await?;
        }
        Ok(())
    }

    async fn backup_table(
        &self,
        meta: &mut BackupMetadata,
        database: &str,
        table: &str,
        resolver: &DedupResolver,
        keep_going: bool,
    ) -> Result<()> {
        debug!("Running table backup: {}.{}", database, table);
        meta.add_table(database, table);

        let schema = rewrite_table_schema(database, &self.ch_ctl.table_schema(database, table).await?);
        let sql_path = self
            .layout
            .save_table_schema(&meta.path, database, table, &schema)
            .await?;

        let rows: HashMap<String, u64> = self
            .ch_ctl
            .list_active_parts(database, table)
            .await?
            .into_iter()
            .map(|p| (p.name, p.rows))
            .collect();

        self.ch_ctl.clear_shadow().await?;
        let freezed = self
            .ch_ctl
            .freeze_table(database, table)
            .await
            .map_err(|e| match e {
                BackupError::Freeze { .. } => e,
                other => BackupError::Freeze {
                    database: database.to_string(),
                    table: table.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let tarball = self.layout.tarball_parts();
        let mut pending: HashMap<String, PartMetadata> = HashMap::new();
        let mut linked = 0usize;

        for part in freezed {
            let mut entry = PartMetadata::from_freezed_part(&part, tarball);

            if let Some(found) = resolver.resolve(&entry, &self.layout).await? {
                entry.link = Some(found.backup_path);
                entry.tarball = found.tarball;
                meta.add_rows(rows.get(&entry.name).copied().unwrap_or(0));
                meta.add_part(entry);
                linked += 1;
                continue;
            }

            let layout = self.layout.clone();
            let backup_path = meta.path.clone();
            let part_name = part.name.clone();
            let uploaded_bytes = self.uploaded_bytes.clone();
            let size = part.size;
            self.pool
                .submit(
                    format!("{}.{}.{}", database, table, part.name),
                    async move {
                        layout
                            .upload_part(&backup_path, &part, tarball)
                            .await
                            .map(|_| part_name)
                    },
                    Some(Box::new(move || {
                        uploaded_bytes.fetch_add(size, Ordering::SeqCst);
                    })),
                )
                .await?;
            pending.insert(entry.name.clone(), entry);
        }

        let uploaded = pending.len();
        debug!("Waiting for {} uploads of {}.{}", uploaded, database, table);
        for name in self.pool.wait_all(keep_going, None).await? {
            if let Some(entry) = pending.remove(&name) {
                meta.add_rows(rows.get(&name).copied().unwrap_or(0));
                meta.add_part(entry);
            }
        }
        for name in pending.keys() {
            warn!("Part {}.{}.{} was not uploaded and is left out of the backup", database, table, name);
        }

        meta.set_table_sql_path(database, table, &sql_path);
        info!(
            "Table {}.{} backed up: {} parts uploaded, {} deduplicated",
            database,
            table,
            uploaded - pending.len(),
            linked
        );
        Ok(())
    }

    pub async fn restore(&self, name: &str, options: RestoreOptions) -> Result<()> {
        let started = Instant::now();
        let meta = self.layout.load_backup_meta(name).await?;
        if !meta.is_complete() {
            return Err(BackupError::BackupIncomplete(name.to_string()));
        }

        let available = meta.database_names();
        let databases = match options.databases {
            Some(requested) => {
                let missing: Vec<String> = requested
                    .iter()
                    .filter(|db| !available.contains(db))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    error!(
                        "Required databases {} were not found in backup {}",
                        missing.join(", "),
                        meta.path
                    );
                    return Err(BackupError::MissingDatabases {
                        backup: name.to_string(),
                        missing,
                    });
                }
                requested
            }
            None => available,
        };

        info!("Restoring backup {} databases: {}", name, databases.join(", "));
        for database in &databases {
            if let Some(db_meta) = meta.database(database) {
                self.restore_database(&meta, db_meta, options.keep_going).await?;
            }
        }

        access::restore_access_control(self.ch_ctl.as_ref(), &self.layout, &meta).await?;

        info!("Backup {} restored in {}", name, format_duration(started.elapsed()));
        Ok(())
    }

    async fn apply_schema(&self, entity: String, sql_path: &str) -> Result<()> {
        let sql = self.layout.download_text(sql_path).await?;
        self.ch_ctl
            .apply_schema(&sql)
            .await
            .map_err(|e| BackupError::Schema {
                entity,
                reason: e.to_string(),
            })
    }

    async fn restore_database(&self, meta: &BackupMetadata, db_meta: &DatabaseMetadata, keep_going: bool) -> Result<()> {
        debug!("Running database restore: {}", db_meta.name);

        if let Some(sql_path) = &db_meta.sql_path {
            self.apply_schema(db_meta.name.clone(), sql_path).await?;
        }
        for table in &db_meta.tables {
            if let Some(sql_path) = &table.sql_path {
                self.apply_schema(format!("{}.{}", db_meta.name, table.name), sql_path)
                    .await?;
            }
        }

        for table in &db_meta.tables {
            self.restore_table_data(meta, &db_meta.name, table, keep_going)
                .await?;
        }
        Ok(())
    }

    async fn restore_table_data(
        &self,
        meta: &BackupMetadata,
        database: &str,
        table: &TableMetadata,
        keep_going: bool,
    ) -> Result<()> {
        if table.parts.is_empty() {
            return Ok(());
        }
        let detached = self.ch_ctl.detached_table_path(database, &table.name);

        for part in &table.parts {
            let layout = self.layout.clone();
            let owner = part.link.clone().unwrap_or_else(|| meta.path.clone());
            let part = part.clone();
            let target = detached.clone();
            self.pool
                .submit(
                    format!("{}.{}.{}", database, table.name, part.name),
                    async move {
                        layout
                            .download_part(&owner, &part, &target)
                            .await
                            .map(|_| part.name)
                    },
                    None,
                )
                .await?;
        }

        let downloaded: HashSet<String> = self
            .pool
            .wait_all(keep_going, None)
            .await?
            .into_iter()
            .collect();
        if downloaded.is_empty() {
            return Ok(());
        }

        self.ch_ctl.fix_ownership(&detached).await?;
        for part in table.parts.iter().filter(|p| downloaded.contains(&p.name)) {
            self.ch_ctl
                .attach_part(database, &table.name, &part.name)
                .await?;
        }

        info!(
            "Table {}.{} restored: {} of {} parts attached",
            database,
            table.name,
            downloaded.len(),
            table.parts.len()
        );
        Ok(())
    }

    /// Remove a backup, keeping objects other backups still link to.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let objects = self.layout.backup_objects(name).await?;
        if objects.is_empty() {
            return Err(BackupError::BackupNotFound(name.to_string()));
        }

        let target_path = self.layout.backup_path(name);
        let all = self.load_backups(false).await?;
        let target = all.iter().find(|b| b.name == name);
        let others: Vec<&BackupMetadata> = all.iter().filter(|b| b.name != name).collect();

        let referenced: HashSet<String> = others
            .iter()
            .flat_map(|b| b.parts())
            .filter(|p| p.link.as_deref() == Some(target_path.as_str()))
            .flat_map(|p| self.layout.part_remote_paths(&target_path, p))
            .collect();

        let meta_path = self.layout.backup_meta_path(name);
        let mut doomed: Vec<String> = objects
            .into_iter()
            .filter(|o| *o != meta_path && !referenced.contains(o))
            .collect();

        // Objects kept alive only by this backup's links into already deleted backups
        if let Some(target) = target {
            let live_paths: HashSet<&str> = others.iter().map(|b| b.path.as_str()).collect();
            let still_linked: HashSet<String> = others
                .iter()
                .flat_map(|b| b.parts())
                .filter_map(|p| p.link.as_ref().map(|link| self.layout.part_remote_paths(link, p)))
                .flatten()
                .collect();
            for part in target.parts() {
                if let Some(link) = part.link.as_deref().filter(|l| !live_paths.contains(l)) {
                    doomed.extend(
                        self.layout
                            .part_remote_paths(link, part)
                            .into_iter()
                            .filter(|p| !still_linked.contains(p)),
                    );
                }
            }
        }

        let outcomes = self.layout.delete_objects(&doomed).await?;
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_deleted()).collect();
        for outcome in &failed {
            warn!(
                "Failed to delete {}: {}",
                outcome.path,
                outcome.error.as_deref().unwrap_or_default()
            );
        }

        self.layout.delete_backup_meta(name).await?;
        info!(
            "Backup {} deleted: {} objects removed, {} kept for linked backups, {} failed",
            name,
            outcomes.len() - failed.len(),
            referenced.len(),
            failed.len()
        );
        Ok(())
    }

    /// Apply retention policies and drop stale incomplete backups.
    /// Returns the names of deleted backups.
    pub async fn purge(&self) -> Result<Vec<String>> {
        let backups = self.load_backups(false).await?;
        let now = Utc::now();
        let retain_count = self.config.backup.retain_count;
        let retain_time = self
            .config
            .backup
            .retain_time_days
            .map(|days| now - Duration::days(days));

        let (mut complete, incomplete): (Vec<&BackupMetadata>, Vec<&BackupMetadata>) =
            backups.iter().partition(|b| b.is_complete());
        complete.sort_by(|a, b| b.end_time.cmp(&a.end_time));

        let mut doomed: Vec<&BackupMetadata> = Vec::new();
        if retain_count.is_some() || retain_time.is_some() {
            for (idx, backup) in complete.iter().enumerate() {
                let keep_by_count = retain_count.is_some_and(|n| idx < n);
                let keep_by_time = retain_time
                    .zip(backup.end_time)
                    .is_some_and(|(threshold, end)| end > threshold);
                if !keep_by_count && !keep_by_time {
                    doomed.push(*backup);
                }
            }
        }

        if let Some(newest_end) = complete.first().and_then(|b| b.end_time) {
            for backup in incomplete {
                if backup.start_time.map_or(true, |start| start < newest_end) {
                    doomed.push(backup);
                }
            }
        }

        // oldest first, so links into earlier deletions are cleaned up by later ones
        doomed.sort_by_key(|b| b.start_time);
        let mut deleted = Vec::with_capacity(doomed.len());
        for backup in doomed {
            info!("Purging backup {}", backup.name);
            self.delete(&backup.name).await?;
            deleted.push(backup.name.clone());
        }
        Ok(deleted)
    }

    /// Stop the transfer workers once queued jobs are done
    pub async fn shutdown(self) {
        self.pool.shutdown(true).await;
    }
}
